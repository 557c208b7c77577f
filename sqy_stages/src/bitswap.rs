use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::word::Word;

/// Bits per plane selectable through the numeric suffix (`bitswap1` .. `bitswap8`).
pub const BITSWAP_VARIANTS: &[u32] = &[1, 2, 4, 8];

/// Bit-plane reordering filter.
///
/// Every sample is rotated left by one bit, then split into planes of
/// `bits_per_plane` bits. All samples' most significant plane is stored
/// first, the least significant last, each plane packed densely into words
/// of the input type. Planes of smooth data are long runs of zeros, which
/// the sink that follows compresses well.
///
/// The trailing `len % planes` samples that do not fill a whole word are
/// copied verbatim. Output length equals input length.
pub struct BitSwapStage {
    bits_per_plane: usize,
}

impl BitSwapStage {
    pub fn new(bits_per_plane: u32) -> Result<Self> {
        if !BITSWAP_VARIANTS.contains(&bits_per_plane) {
            return Err(SqyError::invalid_pipeline(
                format!("bitswap{bits_per_plane}"),
                format!("bits per plane must be one of {BITSWAP_VARIANTS:?}"),
            ));
        }
        Ok(Self {
            bits_per_plane: bits_per_plane as usize,
        })
    }

    fn planes<T: Word>(&self) -> usize {
        T::WORD_BITS / self.bits_per_plane
    }

    fn mask<T: Word>(&self) -> T {
        T::max_value() >> (T::WORD_BITS - self.bits_per_plane)
    }

    fn split<T: Word>(&self, values: &[T], ctx: &StageContext) -> Vec<T> {
        let bits = self.bits_per_plane;
        let planes = self.planes::<T>();
        let mask = self.mask::<T>();
        let segment = values.len() / planes;
        let body = segment * planes;

        // Output word `o` holds plane (planes-1 - o/segment) of the `planes`
        // consecutive samples starting at (o % segment) * planes.
        let gather = |o: usize| -> T {
            let shift = (planes - 1 - o / segment) * bits;
            let first = (o % segment) * planes;
            (0..planes).fold(T::zero(), |word, q| {
                let plane = (values[first + q].rotate_left(1) >> shift) & mask;
                word | (plane << (T::WORD_BITS - bits - q * bits))
            })
        };

        let mut words = vec![T::zero(); values.len()];
        if ctx.is_parallel() {
            words[..body]
                .par_iter_mut()
                .enumerate()
                .for_each(|(o, w)| *w = gather(o));
        } else {
            words[..body]
                .iter_mut()
                .enumerate()
                .for_each(|(o, w)| *w = gather(o));
        }
        words[body..].copy_from_slice(&values[body..]);
        words
    }

    fn join<T: Word>(&self, words: &[T], ctx: &StageContext) -> Vec<T> {
        let bits = self.bits_per_plane;
        let planes = self.planes::<T>();
        let mask = self.mask::<T>();
        let segment = words.len() / planes;
        let body = segment * planes;

        let scatter = |k: usize| -> T {
            let (j, q) = (k / planes, k % planes);
            let shift = T::WORD_BITS - bits - q * bits;
            let rotated = (0..planes).fold(T::zero(), |value, p| {
                let word = words[(planes - 1 - p) * segment + j];
                value | (((word >> shift) & mask) << (p * bits))
            });
            rotated.rotate_right(1)
        };

        let mut values = vec![T::zero(); words.len()];
        if ctx.is_parallel() {
            values[..body]
                .par_iter_mut()
                .enumerate()
                .for_each(|(k, v)| *v = scatter(k));
        } else {
            values[..body]
                .iter_mut()
                .enumerate()
                .for_each(|(k, v)| *v = scatter(k));
        }
        values[body..].copy_from_slice(&words[body..]);
        values
    }

    fn encode_as<T: Word>(&self, input: &[u8], output: &mut [u8], ctx: &StageContext) -> usize {
        let words = self.split(&T::load(input), ctx);
        T::store(&words, output);
        input.len()
    }

    fn decode_as<T: Word>(&self, input: &[u8], output: &mut [u8], ctx: &StageContext) {
        let values = self.join(&T::load(input), ctx);
        T::store(&values, output);
    }
}

impl FromDescriptor for BitSwapStage {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        let bits = descriptor.variant.ok_or_else(|| {
            SqyError::invalid_pipeline(descriptor.to_string(), "bitswap needs a bits-per-plane suffix")
        })?;
        Self::new(bits)
    }
}

impl Stage for BitSwapStage {
    fn name(&self) -> &'static str {
        "bitswap"
    }

    fn output_element(&self, input: ElementType) -> Result<ElementType> {
        expect_element(self.name(), input, &[ElementType::U8, ElementType::U16])
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        input_len
    }

    fn encode(
        &self,
        input: &[u8],
        layout: &Layout,
        output: &mut [u8],
        _meta: &mut StageMeta,
        ctx: &StageContext,
    ) -> Result<usize> {
        ensure_capacity(self.name(), input.len(), output.len())?;
        Ok(match self.output_element(layout.element())? {
            ElementType::U8 => self.encode_as::<u8>(input, output, ctx),
            ElementType::U16 => self.encode_as::<u16>(input, output, ctx),
        })
    }

    fn decode(
        &self,
        input: &[u8],
        layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        ctx: &StageContext,
    ) -> Result<()> {
        if input.len() != output.len() {
            return Err(SqyError::decode(
                self.name(),
                format!("{} bytes stored, {} expected", input.len(), output.len()),
            ));
        }
        match self.output_element(layout.element())? {
            ElementType::U8 => self.decode_as::<u8>(input, output, ctx),
            ElementType::U16 => self.decode_as::<u16>(input, output, ctx),
        }
        Ok(())
    }
}
