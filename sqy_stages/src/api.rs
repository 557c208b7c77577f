//! Typed entry points over the bundled registry.
//!
//! Every function here is a pure function of its arguments. Callers size
//! destination buffers with [`max_compressed_length_for_shape`] and
//! [`decompressed_length`] before encoding or decoding; nothing is grown or
//! reallocated behind their back.

use sqy_core::{
    Decoder, Encoder, HeaderPrefix, Layout, Pipeline, Result, Sample, SqyError, StreamHeader, Version, VERSION,
};

use crate::REGISTRY;

pub fn version() -> Version {
    VERSION
}

/// `true` iff `name` parses, every stage is registered and every argument
/// is valid. Never fails.
pub fn pipeline_possible(name: &str) -> bool {
    Pipeline::is_possible(name, &REGISTRY)
}

/// Composed worst-case stream size for `input_len` bytes of any shape.
pub fn max_compressed_length(name: &str, input_len: usize) -> Result<usize> {
    Ok(Encoder::from_name(name, &REGISTRY)?.max_encoded_size(input_len))
}

/// Worst-case stream size for an array of `T` with the given shape.
pub fn max_compressed_length_for_shape<T: Sample>(name: &str, shape: &[usize]) -> Result<usize> {
    let layout = Layout::new(T::ELEMENT, shape)?;
    Ok(Encoder::from_name(name, &REGISTRY)?.max_encoded_size_for(&layout))
}

/// Compress `src` (row-major, last dimension fastest) into `dst`.
///
/// Returns the stream length. `dst` is left untouched on failure, and a short
/// `dst` is reported as `BufferTooSmall` before anything is written.
pub fn encode<T: Sample>(name: &str, src: &[T], shape: &[usize], dst: &mut [u8], threads: usize) -> Result<usize> {
    let layout = Layout::new(T::ELEMENT, shape)?;
    Encoder::from_name(name, &REGISTRY)?
        .with_threads(threads)
        .encode(bytemuck::cast_slice(src), &layout, dst)
}

pub fn encode_to_vec<T: Sample>(name: &str, src: &[T], shape: &[usize], threads: usize) -> Result<Vec<u8>> {
    let layout = Layout::new(T::ELEMENT, shape)?;
    Encoder::from_name(name, &REGISTRY)?
        .with_threads(threads)
        .encode_to_vec(bytemuck::cast_slice(src), &layout)
}

fn expect_sample<T: Sample>(src: &[u8]) -> Result<HeaderPrefix> {
    let prefix = HeaderPrefix::peek(src)?;
    if prefix.element != T::ELEMENT {
        return Err(SqyError::unsupported(
            format!("decode into {}", T::ELEMENT),
            prefix.element,
        ));
    }
    Ok(prefix)
}

/// Decompress `src` into the front of `dst`; return the number of samples written.
pub fn decode<T: Sample>(src: &[u8], dst: &mut [T], threads: usize) -> Result<usize> {
    expect_sample::<T>(src)?;
    let written = Decoder::new(&REGISTRY)
        .with_threads(threads)
        .decode(src, bytemuck::cast_slice_mut(dst))?;
    Ok(written / T::ELEMENT.width())
}

/// Decompress `src` into a new vector.
///
/// The vector is sized from the verified stream, never from the header's
/// claimed length alone.
pub fn decode_to_vec<T: Sample>(src: &[u8], threads: usize) -> Result<Vec<T>> {
    expect_sample::<T>(src)?;
    let bytes = Decoder::new(&REGISTRY).with_threads(threads).decode_to_vec(src)?;
    let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); bytes.len() / T::ELEMENT.width()];
    bytemuck::cast_slice_mut(&mut out).copy_from_slice(&bytes);
    Ok(out)
}

// ── Header queries ─────────────────────────────────────────────────────────

/// Original length in bytes, from the fixed header prefix only.
pub fn decompressed_length(src: &[u8]) -> Result<usize> {
    Decoder::decompressed_length(src)
}

pub fn header_size(src: &[u8]) -> Result<usize> {
    Ok(HeaderPrefix::peek(src)?.header_len as usize)
}

pub fn decompressed_ndims(src: &[u8]) -> Result<usize> {
    Ok(HeaderPrefix::peek(src)?.ndims as usize)
}

pub fn decompressed_shape(src: &[u8]) -> Result<Vec<usize>> {
    Ok(Decoder::header(src)?.shape)
}

/// Bytes per sample of the original array.
pub fn decompressed_sizeof(src: &[u8]) -> Result<usize> {
    Ok(HeaderPrefix::peek(src)?.element.width())
}

/// Canonical name of the pipeline that produced `src`.
pub fn encoded_pipeline(src: &[u8]) -> Result<String> {
    Decoder::header(src).map(|StreamHeader { pipeline, .. }| pipeline)
}
