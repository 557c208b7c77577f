use crate::error::{Result, SqyError};
use crate::pipeline::StageDescriptor;
use crate::types::{ElementType, Layout};

/// Side record a stage emits during encode and needs back during decode.
///
/// For most stages (pass_through, lz4, bitswap, ...) this is always empty.
/// The quantiser stores its reconstruction table here. The sidecar is kept
/// in the stream header next to the stage's input length and passed back to
/// [`Stage::decode`] verbatim.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct StageMeta {
    pub sidecar: Vec<u8>,
}

/// Per-call execution settings handed to every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    /// Worker threads available inside the current call (0 and 1 mean sequential).
    pub threads: usize,
}

impl StageContext {
    pub fn sequential() -> Self {
        Self { threads: 1 }
    }

    pub fn with_threads(threads: usize) -> Self {
        Self { threads }
    }

    /// Stages with data parallelism switch to rayon iterators when this holds.
    /// The executor has already installed a pool of the right size.
    #[inline]
    pub fn is_parallel(&self) -> bool {
        self.threads > 1
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self::sequential()
    }
}

/// One transform in a pipeline.
///
/// Each `Stage` implementation:
/// - Consumes a dense array described by a [`Layout`] and writes into a
///   caller-provided buffer of at least `max_encoded_size(input.len())` bytes.
/// - Must be deterministic: the same input and arguments give the same bytes
///   regardless of `StageContext::threads`.
/// - Reports up front which element types it accepts through
///   `output_element`, so a pipeline can be rejected before any buffer is touched.
pub trait Stage: Send + Sync {
    /// Registry token of the stage, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether decode may return something other than the original bits.
    fn is_lossy(&self) -> bool {
        false
    }

    /// Element type produced for a given input element type, or
    /// `UnsupportedElementType` if the stage cannot take it.
    fn output_element(&self, input: ElementType) -> Result<ElementType>;

    /// `true` when the output keeps the input's shape (filters),
    /// `false` when it is an opaque byte stream (sinks).
    fn preserves_shape(&self) -> bool {
        true
    }

    /// Layout of the encoded output, derived from the input layout and the
    /// number of bytes actually written.
    fn output_layout(&self, input: &Layout, encoded_len: usize) -> Result<Layout> {
        let element = self.output_element(input.element())?;
        if self.preserves_shape() {
            input.with_element(element)
        } else {
            Ok(Layout::flat(element, encoded_len))
        }
    }

    /// Worst-case encoded size for `input_len` input bytes. Always `>= input_len`,
    /// non-decreasing in `input_len`, and saturating at `usize::MAX`.
    fn max_encoded_size(&self, input_len: usize) -> usize;

    /// Largest output [`Stage::decode`] can produce from `encoded`.
    ///
    /// The decoder never allocates more than this for the stage's output, so
    /// a forged length in a header is rejected instead of allocated. The
    /// default fits filters whose output is as long as their input.
    fn max_decoded_size(&self, encoded: &[u8]) -> usize {
        encoded.len()
    }

    /// Largest sidecar this stage ever writes.
    fn max_sidecar_size(&self) -> usize {
        0
    }

    /// Encode `input` (described by `layout`) into `output`; return bytes written.
    fn encode(
        &self,
        input: &[u8],
        layout: &Layout,
        output: &mut [u8],
        meta: &mut StageMeta,
        ctx: &StageContext,
    ) -> Result<usize>;

    /// Invert [`Stage::encode`]. `layout` is the layout the stage was encoded
    /// from, and `output` is exactly `layout.byte_len()` bytes long.
    fn decode(
        &self,
        input: &[u8],
        layout: &Layout,
        meta: &StageMeta,
        output: &mut [u8],
        ctx: &StageContext,
    ) -> Result<()>;
}

/// Construction of a concrete stage from a parsed descriptor.
///
/// Argument validation lives here, so checking a descriptor and building the
/// stage can never disagree.
pub trait FromDescriptor: Sized {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self>;
}

/// Fail with `EncodeFailure` unless `output` can hold `needed` bytes.
pub fn ensure_capacity(stage: &str, needed: usize, available: usize) -> Result<()> {
    if available < needed {
        return Err(SqyError::encode(
            stage,
            format!("scratch buffer holds {available} bytes, {needed} needed"),
        ));
    }
    Ok(())
}

/// Fail with `UnsupportedElementType` unless `found` is one of `accepted`.
pub fn expect_element(stage: &str, found: ElementType, accepted: &[ElementType]) -> Result<ElementType> {
    if accepted.contains(&found) {
        Ok(found)
    } else {
        Err(SqyError::unsupported(stage, found))
    }
}
