use lz4_flex::block::{compress, decompress_into, get_maximum_output_size};
use rayon::prelude::*;
use sqy_core::stage::ensure_capacity;
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

/// Default frame step in KiB.
pub const DEFAULT_FRAMESTEP_KB: u32 = 256;

/// Largest expansion of an LZ4 block: every extra match-length byte adds at
/// most 255 output bytes.
const MAX_RATIO: usize = 255;

/// LZ4 sink.
///
/// The input is cut into independent frames of `framestep_kb` KiB (the last
/// one may be shorter), each compressed as a raw LZ4 block. Frames are
/// compressed and decompressed in parallel when threads are available; the
/// cut points depend only on the input length, so output bytes never depend
/// on the thread count.
///
/// # Layout written
/// ```text
/// [frame_size: u32] [frame_count: u32]
/// [compressed_len: u32 x frame_count]
/// [FRAME 0] [FRAME 1] ... [FRAME N-1]
/// ```
pub struct Lz4Stage {
    frame_size: usize,
}

impl Default for Lz4Stage {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMESTEP_KB)
    }
}

impl Lz4Stage {
    pub fn new(framestep_kb: u32) -> Self {
        Self {
            frame_size: framestep_kb as usize * 1024,
        }
    }
}

impl FromDescriptor for Lz4Stage {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self::new(descriptor.arg_in(
            "framestep_kb",
            DEFAULT_FRAMESTEP_KB,
            1,
            1 << 20,
        )?))
    }
}

impl Stage for Lz4Stage {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn output_element(&self, _input: ElementType) -> Result<ElementType> {
        Ok(ElementType::U8)
    }

    fn preserves_shape(&self) -> bool {
        false
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        let full = input_len / self.frame_size;
        let tail = input_len % self.frame_size;
        let mut bound = full
            .saturating_mul(4 + get_maximum_output_size(self.frame_size))
            .saturating_add(8);
        if tail > 0 {
            bound = bound.saturating_add(4 + get_maximum_output_size(tail));
        }
        bound
    }

    /// The frame table caps the output at `frame_count * frame_size`, and the
    /// block format caps it at [`MAX_RATIO`] times the stored bytes.
    fn max_decoded_size(&self, encoded: &[u8]) -> usize {
        let Some(table) = encoded.get(..8) else {
            return 0;
        };
        let frame_size = u32::from_le_bytes([table[0], table[1], table[2], table[3]]) as usize;
        let count = u32::from_le_bytes([table[4], table[5], table[6], table[7]]) as usize;
        frame_size
            .saturating_mul(count)
            .min(encoded.len().saturating_mul(MAX_RATIO))
    }

    fn encode(
        &self,
        input: &[u8],
        _layout: &Layout,
        output: &mut [u8],
        _meta: &mut StageMeta,
        ctx: &StageContext,
    ) -> Result<usize> {
        let frames: Vec<Vec<u8>> = if ctx.is_parallel() {
            input.par_chunks(self.frame_size).map(compress).collect()
        } else {
            input.chunks(self.frame_size).map(compress).collect()
        };

        let table_len = 8 + 4 * frames.len();
        let total = table_len + frames.iter().map(Vec::len).sum::<usize>();
        ensure_capacity(self.name(), total, output.len())?;

        let too_big = |_| SqyError::encode("lz4", "frame size does not fit 32 bits");
        let frame_size = u32::try_from(self.frame_size).map_err(too_big)?;
        let count = u32::try_from(frames.len()).map_err(too_big)?;
        output[0..4].copy_from_slice(&frame_size.to_le_bytes());
        output[4..8].copy_from_slice(&count.to_le_bytes());
        let mut pos = table_len;
        for (i, frame) in frames.iter().enumerate() {
            let len = frame.len() as u32;
            output[8 + 4 * i..12 + 4 * i].copy_from_slice(&len.to_le_bytes());
            output[pos..pos + frame.len()].copy_from_slice(frame);
            pos += frame.len();
        }
        Ok(total)
    }

    fn decode(
        &self,
        input: &[u8],
        _layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        ctx: &StageContext,
    ) -> Result<()> {
        let fail = |reason: String| SqyError::decode("lz4", reason);
        if input.len() < 8 {
            return Err(fail(format!("{} bytes is too short for a frame table", input.len())));
        }
        let frame_size = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
        let count = u32::from_le_bytes([input[4], input[5], input[6], input[7]]) as usize;
        if frame_size == 0 || count != output.len().div_ceil(frame_size) {
            return Err(fail(format!(
                "{count} frames of {frame_size} bytes cannot hold {} bytes",
                output.len()
            )));
        }
        let table = input
            .get(8..8 + 4 * count)
            .ok_or_else(|| fail("frame table is truncated".into()))?;

        let mut frames = Vec::with_capacity(count);
        let mut pos = 8 + 4 * count;
        for entry in table.chunks_exact(4) {
            let len = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
            let frame = input
                .get(pos..pos + len)
                .ok_or_else(|| fail("frame payload is truncated".into()))?;
            frames.push(frame);
            pos += len;
        }
        if pos != input.len() {
            return Err(fail(format!("{} trailing bytes after last frame", input.len() - pos)));
        }

        let expand = |(out, frame): (&mut [u8], &&[u8])| -> Result<()> {
            let n = decompress_into(frame, out).map_err(|e| fail(format!("lz4 decompress error: {e}")))?;
            if n != out.len() {
                return Err(fail(format!("frame decoded to {n} bytes, {} expected", out.len())));
            }
            Ok(())
        };
        if ctx.is_parallel() {
            output
                .par_chunks_mut(frame_size)
                .zip(frames.par_iter())
                .try_for_each(expand)
        } else {
            output
                .chunks_mut(frame_size)
                .zip(frames.iter())
                .try_for_each(expand)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(stage: &Lz4Stage, input: &[u8], threads: usize) -> Vec<u8> {
        let layout = Layout::flat(ElementType::U8, input.len());
        let mut out = vec![0u8; stage.max_encoded_size(input.len())];
        let n = stage
            .encode(input, &layout, &mut out, &mut StageMeta::default(), &StageContext::with_threads(threads))
            .unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn frames_are_independent_and_deterministic() {
        let stage = Lz4Stage::new(1);
        let input: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let seq = encode(&stage, &input, 1);
        assert_eq!(seq, encode(&stage, &input, 4));
        assert_eq!(u32::from_le_bytes([seq[4], seq[5], seq[6], seq[7]]), 5);

        let layout = Layout::flat(ElementType::U8, input.len());
        let mut back = vec![0u8; input.len()];
        stage
            .decode(&seq, &layout, &StageMeta::default(), &mut back, &StageContext::with_threads(3))
            .unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn empty_input_has_no_frames() {
        let stage = Lz4Stage::default();
        let out = encode(&stage, &[], 1);
        assert_eq!(out.len(), 8);
        let mut back = [0u8; 0];
        stage
            .decode(&out, &Layout::flat(ElementType::U8, 0), &StageMeta::default(), &mut back, &StageContext::sequential())
            .unwrap();
    }

    #[test]
    fn bound_saturates_for_huge_inputs() {
        let stage = Lz4Stage::new(1);
        assert_eq!(stage.max_encoded_size(usize::MAX), usize::MAX);
        let n = usize::MAX / 2;
        assert!(stage.max_encoded_size(n) >= n);
    }

    #[test]
    fn decoded_size_is_capped_by_the_frame_table() {
        let stage = Lz4Stage::new(1);
        let input = vec![0u8; 3000];
        let mut enc = encode(&stage, &input, 1);
        assert_eq!(stage.max_decoded_size(&enc), 3 * 1024);

        // a forged frame size is still capped by what the bytes can expand to
        enc[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(stage.max_decoded_size(&enc), enc.len() * MAX_RATIO);
        assert_eq!(stage.max_decoded_size(&enc[..7]), 0);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let stage = Lz4Stage::new(1);
        let input = vec![7u8; 3000];
        let enc = encode(&stage, &input, 1);
        let layout = Layout::flat(ElementType::U8, input.len());
        let mut back = vec![0u8; input.len()];
        for cut in [0, 5, 12, enc.len() - 1] {
            let err = stage
                .decode(&enc[..cut], &layout, &StageMeta::default(), &mut back, &StageContext::sequential())
                .unwrap_err();
            assert!(matches!(err, SqyError::DecodeFailure { .. }), "cut {cut}");
        }
    }
}
