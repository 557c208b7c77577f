use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Largest expansion of a zstd frame: a 4-byte RLE block (3-byte block
/// header plus one byte) regenerates at most one 128 KiB block.
pub(crate) const MAX_RATIO: usize = (128 << 10) / 4;

/// `ZSTD_compressBound`, saturating instead of overflowing for huge inputs.
pub(crate) fn compress_bound(input_len: usize) -> usize {
    let small_input_margin = if input_len < (128 << 10) {
        ((128 << 10) - input_len) >> 11
    } else {
        0
    };
    input_len
        .saturating_add(input_len >> 8)
        .saturating_add(small_input_margin)
}

/// Zstandard sink.
///
/// The whole input becomes one zstd frame at the configured level
/// (default: 3). Slower than lz4 but usually smaller.
///
/// Best for: archival copies where decode speed matters less than size.
pub struct ZstdStage {
    /// Compression level (1 = fast / larger, 22 = slow / smallest).
    pub level: i32,
}

impl Default for ZstdStage {
    fn default() -> Self {
        Self { level: DEFAULT_LEVEL }
    }
}

impl ZstdStage {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl FromDescriptor for ZstdStage {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self::new(descriptor.arg_in("level", DEFAULT_LEVEL, 1, 22)?))
    }
}

impl Stage for ZstdStage {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn output_element(&self, _input: ElementType) -> Result<ElementType> {
        Ok(ElementType::U8)
    }

    fn preserves_shape(&self) -> bool {
        false
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        compress_bound(input_len)
    }

    fn max_decoded_size(&self, encoded: &[u8]) -> usize {
        encoded.len().saturating_mul(MAX_RATIO)
    }

    fn encode(
        &self,
        input: &[u8],
        _layout: &Layout,
        output: &mut [u8],
        _meta: &mut StageMeta,
        _ctx: &StageContext,
    ) -> Result<usize> {
        zstd::bulk::compress_to_buffer(input, output, self.level)
            .map_err(|e| SqyError::encode(self.name(), e.to_string()))
    }

    fn decode(
        &self,
        input: &[u8],
        _layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        _ctx: &StageContext,
    ) -> Result<()> {
        // The frame carries its own content size, but the expected length is
        // already known from the layout, so decode straight into `output`.
        let n = zstd::bulk::decompress_to_buffer(input, output)
            .map_err(|e| SqyError::decode(self.name(), e.to_string()))?;
        if n != output.len() {
            return Err(SqyError::decode(
                self.name(),
                format!("frame decoded to {n} bytes, {} expected", output.len()),
            ));
        }
        Ok(())
    }
}
