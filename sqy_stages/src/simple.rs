//! Single-stage codec over raw bytes.
//!
//! This is the `lz4` pipeline applied to a 1-D `u8` array, so its streams
//! are ordinary sqy streams and decode with [`crate::api`] as well.

use sqy_core::{Decoder, Encoder, ElementType, Layout, Result};

use crate::REGISTRY;

/// Pipeline every simple stream is produced with.
pub const SIMPLE_PIPELINE: &str = "lz4";

fn encoder() -> Result<Encoder> {
    Encoder::from_name(SIMPLE_PIPELINE, &REGISTRY)
}

/// Largest stream [`encode`] can produce for `input_len` bytes.
pub fn max_encoded_length(input_len: usize) -> Result<usize> {
    Ok(encoder()?.max_encoded_size_for(&Layout::flat(ElementType::U8, input_len)))
}

/// Compress `src` into `dst`; return the stream length.
pub fn encode(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    encoder()?.encode(src, &Layout::flat(ElementType::U8, src.len()), dst)
}

/// Decompress `src` into `dst`, sized with [`decompressed_length`].
pub fn decode(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    Decoder::new(&REGISTRY).decode(src, dst)
}

pub fn decompressed_length(src: &[u8]) -> Result<usize> {
    Decoder::decompressed_length(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqy_core::SqyError;

    #[test]
    fn ramp_round_trips_smaller() {
        let src: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        let mut dst = vec![0u8; max_encoded_length(src.len()).unwrap()];
        let n = encode(&src, &mut dst).unwrap();
        assert!(n > 0 && n < src.len());

        let stream = &dst[..n];
        let mut back = vec![0u8; decompressed_length(stream).unwrap()];
        assert_eq!(decode(stream, &mut back).unwrap(), 1024);
        assert_eq!(back, src);
    }

    #[test]
    fn short_destination_is_reported() {
        let src = vec![9u8; 100];
        let mut dst = [0u8; 8];
        assert!(matches!(encode(&src, &mut dst), Err(SqyError::BufferTooSmall { .. })));
        assert_eq!(dst, [0u8; 8]);
    }
}
