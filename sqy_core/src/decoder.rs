use crate::error::{Result, SqyError};
use crate::format::{stream_checksum, HeaderPrefix, StreamHeader};
use crate::pipeline::Pipeline;
use crate::registry::Registry;
use crate::stage::{Stage, StageContext, StageMeta};
use crate::types::Layout;

/// Reverses [`Encoder`](crate::Encoder) output using only what the stream carries.
///
/// # Decode sequence
/// 1. Parse and bounds-check the header.
/// 2. Check the payload is complete and verify the xxhash3-64 checksum over
///    header and payload.
/// 3. Re-parse the pipeline name stored in the header and rebuild its stages.
/// 4. Replay the layout chain forward from the stored shape and the
///    recorded per-stage input lengths.
/// 5. Run the stages last to first. Before each stage's output is allocated,
///    its length is checked against [`Stage::max_decoded_size`] of the bytes
///    actually present.
///
/// Nothing is written to the destination unless every step succeeds.
pub struct Decoder<'r> {
    registry: &'r Registry,
    threads: usize,
}

impl<'r> Decoder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            threads: 1,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Original byte length, read from the fixed prefix alone.
    pub fn decompressed_length(src: &[u8]) -> Result<usize> {
        let prefix = HeaderPrefix::peek(src)?;
        usize::try_from(prefix.raw_size)
            .map_err(|_| SqyError::decode("header", "raw size exceeds the address space"))
    }

    /// Parse the full header without touching the payload.
    pub fn header(src: &[u8]) -> Result<StreamHeader> {
        StreamHeader::from_bytes(src).map(|(header, _)| header)
    }

    /// Decode `src` into the front of `dst`; return the number of bytes written.
    ///
    /// `dst` must hold at least [`Decoder::decompressed_length`] bytes.
    pub fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let (header, header_len) = StreamHeader::from_bytes(src)?;
        let raw_len = header.raw_size as usize;
        if dst.len() < raw_len {
            return Err(SqyError::buffer_too_small(raw_len, dst.len()));
        }
        let raw = self.decode_payload(&header, src, header_len)?;
        dst[..raw_len].copy_from_slice(&raw);
        Ok(raw_len)
    }

    pub fn decode_to_vec(&self, src: &[u8]) -> Result<Vec<u8>> {
        let (header, header_len) = StreamHeader::from_bytes(src)?;
        self.decode_payload(&header, src, header_len)
    }

    fn decode_payload(&self, header: &StreamHeader, src: &[u8], header_len: usize) -> Result<Vec<u8>> {
        let rest = &src[header_len..];
        let payload = usize::try_from(header.payload_size)
            .ok()
            .and_then(|len| rest.get(..len))
            .ok_or_else(|| {
                SqyError::decode(
                    "payload",
                    format!("stream is truncated: {} payload bytes expected, {} present", header.payload_size, rest.len()),
                )
            })?;
        let computed = stream_checksum(&src[..header_len], payload);
        if computed != header.checksum {
            return Err(SqyError::decode(
                "payload",
                format!("checksum mismatch: expected {:016x}, got {:016x}", header.checksum, computed),
            ));
        }

        let pipeline = Pipeline::parse(&header.pipeline, self.registry)
            .map_err(|e| SqyError::decode("header", e.to_string()))?;
        let stages = pipeline.build()?;
        if stages.len() != header.stages.len() {
            return Err(SqyError::decode(
                "header",
                format!("{} stage records for a {}-stage pipeline", header.stages.len(), stages.len()),
            ));
        }
        let layouts = self.replay_layouts(header, &stages)?;

        let ctx = StageContext::with_threads(self.threads);
        if ctx.is_parallel() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
                .map_err(|e| SqyError::decode("pipeline", format!("thread pool: {e}")))?;
            pool.install(|| run_reverse(&stages, header, &layouts, payload, &ctx))
        } else {
            run_reverse(&stages, header, &layouts, payload, &ctx)
        }
    }

    /// Input layout of every stage, checked against the recorded lengths.
    fn replay_layouts(&self, header: &StreamHeader, stages: &[Box<dyn Stage>]) -> Result<Vec<Layout>> {
        let mut layout = header
            .layout()
            .map_err(|e| SqyError::decode("header", e.to_string()))?;
        let mut layouts = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if layout.byte_len() as u64 != header.stages[i].input_len {
                return Err(SqyError::decode(
                    stage.name(),
                    format!("recorded input length {} disagrees with layout {layout}", header.stages[i].input_len),
                ));
            }
            let out_len = header
                .stages
                .get(i + 1)
                .map_or(header.payload_size, |next| next.input_len);
            let out_len = usize::try_from(out_len)
                .map_err(|_| SqyError::decode(stage.name(), "length exceeds the address space"))?;
            let next = stage
                .output_layout(&layout, out_len)
                .map_err(|e| SqyError::decode(stage.name(), e.to_string()))?;
            if next.byte_len() != out_len {
                return Err(SqyError::decode(
                    stage.name(),
                    format!("encoded length {out_len} disagrees with layout {next}"),
                ));
            }
            layouts.push(std::mem::replace(&mut layout, next));
        }
        Ok(layouts)
    }
}

fn run_reverse(
    stages: &[Box<dyn Stage>],
    header: &StreamHeader,
    layouts: &[Layout],
    payload: &[u8],
    ctx: &StageContext,
) -> Result<Vec<u8>> {
    let mut current = payload.to_vec();
    for ((stage, layout), record) in stages.iter().zip(layouts).zip(&header.stages).rev() {
        let meta = StageMeta {
            sidecar: record.sidecar.clone(),
        };
        let limit = stage.max_decoded_size(&current);
        if layout.byte_len() > limit {
            return Err(SqyError::decode(
                stage.name(),
                format!("{} encoded bytes cannot expand to {} (at most {limit})", current.len(), layout.byte_len()),
            ));
        }
        let mut out = vec![0u8; layout.byte_len()];
        stage.decode(&current, layout, &meta, &mut out, ctx)?;
        log::debug!("{}: {} -> {} bytes", stage.name(), current.len(), out.len());
        current = out;
    }
    Ok(current)
}
