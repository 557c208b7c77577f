use num_traits::{PrimInt, WrappingAdd, WrappingSub};

/// Integer sample view over a byte buffer in host byte order.
///
/// Stage buffers are plain `Vec<u8>` with no alignment guarantee, so samples
/// are copied in and out rather than cast in place.
pub(crate) trait Word: PrimInt + WrappingAdd + WrappingSub + Send + Sync + 'static {
    const WORD_BITS: usize;

    fn load(bytes: &[u8]) -> Vec<Self>;
    fn store(values: &[Self], out: &mut [u8]);
}

impl Word for u8 {
    const WORD_BITS: usize = 8;

    fn load(bytes: &[u8]) -> Vec<Self> {
        bytes.to_vec()
    }

    fn store(values: &[Self], out: &mut [u8]) {
        out[..values.len()].copy_from_slice(values);
    }
}

impl Word for u16 {
    const WORD_BITS: usize = 16;

    fn load(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    fn store(values: &[Self], out: &mut [u8]) {
        for (chunk, v) in out.chunks_exact_mut(2).zip(values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
    }
}
