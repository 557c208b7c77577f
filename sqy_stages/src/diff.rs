use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::word::Word;

/// Row-wise delta filter: every sample but the first of a row is replaced by
/// its wrapping difference to the left neighbour. Lossless.
pub struct DiffStage;

impl DiffStage {
    fn forward<T: Word>(row_in: &[T], row_out: &mut [T]) {
        let mut prev = T::zero();
        for (o, &v) in row_out.iter_mut().zip(row_in) {
            *o = v.wrapping_sub(&prev);
            prev = v;
        }
    }

    fn inverse<T: Word>(row: &mut [T]) {
        let mut acc = T::zero();
        for v in row.iter_mut() {
            acc = acc.wrapping_add(v);
            *v = acc;
        }
    }

    fn encode_as<T: Word>(input: &[u8], row_len: usize, output: &mut [u8], ctx: &StageContext) {
        let values = T::load(input);
        let mut deltas = vec![T::zero(); values.len()];
        if row_len > 0 {
            if ctx.is_parallel() {
                deltas
                    .par_chunks_mut(row_len)
                    .zip(values.par_chunks(row_len))
                    .for_each(|(out, row)| Self::forward(row, out));
            } else {
                deltas
                    .chunks_mut(row_len)
                    .zip(values.chunks(row_len))
                    .for_each(|(out, row)| Self::forward(row, out));
            }
        }
        T::store(&deltas, output);
    }

    fn decode_as<T: Word>(input: &[u8], row_len: usize, output: &mut [u8], ctx: &StageContext) {
        let mut values = T::load(input);
        if row_len > 0 {
            if ctx.is_parallel() {
                values.par_chunks_mut(row_len).for_each(Self::inverse::<T>);
            } else {
                values.chunks_mut(row_len).for_each(Self::inverse::<T>);
            }
        }
        T::store(&values, output);
    }
}

impl FromDescriptor for DiffStage {
    fn from_descriptor(_descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self)
    }
}

impl Stage for DiffStage {
    fn name(&self) -> &'static str {
        "diff"
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
        match self.output_element(layout.element())? {
            ElementType::U8 => Self::encode_as::<u8>(input, layout.row_len(), output, ctx),
            ElementType::U16 => Self::encode_as::<u16>(input, layout.row_len(), output, ctx),
        }
        Ok(input.len())
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
            ElementType::U8 => Self::decode_as::<u8>(input, layout.row_len(), output, ctx),
            ElementType::U16 => Self::decode_as::<u16>(input, layout.row_len(), output, ctx),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_restart_on_every_row() {
        let layout = Layout::new(ElementType::U8, &[2, 4]).unwrap();
        let input = [10u8, 12, 11, 250, 5, 5, 6, 0];
        let mut encoded = [0u8; 8];
        let ctx = StageContext::sequential();
        DiffStage
            .encode(&input, &layout, &mut encoded, &mut StageMeta::default(), &ctx)
            .unwrap();
        assert_eq!(encoded, [10, 2, 255, 239, 5, 0, 1, 250]);

        let mut decoded = [0u8; 8];
        DiffStage
            .decode(&encoded, &layout, &StageMeta::default(), &mut decoded, &ctx)
            .unwrap();
        assert_eq!(decoded, input);
    }
}
