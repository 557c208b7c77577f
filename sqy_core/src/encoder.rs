use std::borrow::Cow;

use crate::error::{Result, SqyError};
use crate::format::{max_header_size, seal, StageRecord, StreamHeader};
use crate::pipeline::Pipeline;
use crate::registry::Registry;
use crate::stage::{Stage, StageContext, StageMeta};
use crate::types::{Layout, MAX_NDIMS};

/// Runs a pipeline's stages first to last and frames the result.
///
/// # Encode contract
/// 1. The source length must match its [`Layout`] (`ShapeMismatch` otherwise).
/// 2. The element type chain is checked for every stage before any stage
///    runs, so an unsupported type fails without touching a buffer.
/// 3. Each stage writes into a scratch buffer of `max_encoded_size` bytes
///    which is then truncated to what the stage actually wrote.
/// 4. The serialized header is sealed with an xxhash3-64 checksum over
///    itself and the payload.
/// 5. The header and payload are only copied into `dst` once the total is
///    known to fit. A short `dst` yields `BufferTooSmall` and stays untouched.
///
/// # Output layout
/// ```text
/// [HEADER: prefix, shape, stage records, pipeline name]
/// [PAYLOAD: output of the last stage]
/// ```
pub struct Encoder {
    pipeline: Pipeline,
    stages: Vec<Box<dyn Stage>>,
    threads: usize,
}

impl Encoder {
    pub fn new(pipeline: Pipeline) -> Result<Self> {
        let stages = pipeline.build()?;
        Ok(Self {
            pipeline,
            stages,
            threads: 1,
        })
    }

    /// Parse `name` against `registry` and build its stages.
    pub fn from_name(name: &str, registry: &Registry) -> Result<Self> {
        Self::new(Pipeline::parse(name, registry)?)
    }

    /// Allow up to `threads` workers inside stages that split their input.
    /// Output bytes do not depend on this value.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_lossy(&self) -> bool {
        self.stages.iter().any(|s| s.is_lossy())
    }

    /// Composed bound for `input_len` bytes of any shape.
    ///
    /// Each stage's bound is fed to the next stage as its assumed input
    /// length, then the largest possible header is added. Saturates at
    /// `usize::MAX` instead of wrapping.
    pub fn max_encoded_size(&self, input_len: usize) -> usize {
        self.bound(MAX_NDIMS, input_len)
    }

    /// Tighter bound once the shape is known.
    pub fn max_encoded_size_for(&self, layout: &Layout) -> usize {
        self.bound(layout.ndims(), layout.byte_len())
    }

    fn bound(&self, ndims: usize, input_len: usize) -> usize {
        let payload = self
            .stages
            .iter()
            .fold(input_len, |len, stage| stage.max_encoded_size(len));
        let header = max_header_size(
            ndims,
            self.pipeline.to_string().len(),
            self.stages.iter().map(|s| s.max_sidecar_size()),
        );
        header.saturating_add(payload)
    }

    /// Encode `src` into `dst`; return the number of bytes written.
    pub fn encode(&self, src: &[u8], layout: &Layout, dst: &mut [u8]) -> Result<usize> {
        let (header, payload) = self.encode_parts(src, layout)?;
        let total = header.len() + payload.len();
        if dst.len() < total {
            return Err(SqyError::buffer_too_small(total, dst.len()));
        }
        dst[..header.len()].copy_from_slice(&header);
        dst[header.len()..total].copy_from_slice(&payload);
        Ok(total)
    }

    /// Encode into a freshly allocated buffer of exactly the right size.
    pub fn encode_to_vec(&self, src: &[u8], layout: &Layout) -> Result<Vec<u8>> {
        let (mut out, payload) = self.encode_parts(src, layout)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Serialized, sealed header and the payload.
    fn encode_parts(&self, src: &[u8], layout: &Layout) -> Result<(Vec<u8>, Vec<u8>)> {
        layout.check_len(src.len())?;

        // ── Type chain, before any buffer is touched ────────────────────────
        self.stages
            .iter()
            .try_fold(layout.element(), |element, stage| stage.output_element(element))?;

        let ctx = StageContext::with_threads(self.threads);
        let (payload, records) = if ctx.is_parallel() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
                .map_err(|e| SqyError::encode("pipeline", format!("thread pool: {e}")))?;
            pool.install(|| self.run_stages(src, layout, &ctx))?
        } else {
            self.run_stages(src, layout, &ctx)?
        };

        let header = StreamHeader {
            element: layout.element(),
            shape: layout.shape().to_vec(),
            pipeline: self.pipeline.to_string(),
            stages: records,
            raw_size: src.len() as u64,
            payload_size: payload.len() as u64,
            checksum: 0,
        };
        let mut header = header.to_bytes()?;
        seal(&mut header, &payload);
        Ok((header, payload))
    }

    fn run_stages(
        &self,
        src: &[u8],
        layout: &Layout,
        ctx: &StageContext,
    ) -> Result<(Vec<u8>, Vec<StageRecord>)> {
        let mut current: Cow<'_, [u8]> = Cow::Borrowed(src);
        let mut layout = layout.clone();
        let mut records = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let mut scratch = vec![0u8; stage.max_encoded_size(current.len())];
            let mut meta = StageMeta::default();
            let written = stage.encode(&current, &layout, &mut scratch, &mut meta, ctx)?;
            if written > scratch.len() {
                return Err(SqyError::encode(stage.name(), "reported more bytes than its bound"));
            }
            if meta.sidecar.len() > stage.max_sidecar_size() {
                return Err(SqyError::encode(stage.name(), "sidecar exceeds its declared maximum"));
            }
            scratch.truncate(written);

            let next = stage.output_layout(&layout, written)?;
            if next.byte_len() != written {
                return Err(SqyError::encode(
                    stage.name(),
                    format!("wrote {written} bytes for output layout {next}"),
                ));
            }
            log::debug!(
                "{}: {} -> {} ({} -> {} bytes)",
                stage.name(),
                layout,
                next,
                current.len(),
                written
            );

            records.push(StageRecord {
                input_len: current.len() as u64,
                sidecar: meta.sidecar,
            });
            layout = next;
            current = Cow::Owned(scratch);
        }
        Ok((current.into_owned(), records))
    }
}
