use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::word::Word;

/// Background removal filter.
///
/// Samples at or below `threshold` become 0; every other sample is reduced
/// by `threshold`. Decode hands the reduced values back unchanged, so the
/// stage is lossy whenever `threshold > 0`.
pub struct RemoveBackgroundStage {
    threshold: u16,
}

/// Clear samples at or below `level` and lower the rest by `level`.
pub(crate) fn subtract_background<T: Word>(values: &mut [T], level: T, ctx: &StageContext) {
    let clip = |v: &mut T| *v = if *v > level { *v - level } else { T::zero() };
    if ctx.is_parallel() {
        values.par_iter_mut().for_each(clip);
    } else {
        values.iter_mut().for_each(clip);
    }
}

impl RemoveBackgroundStage {
    fn apply<T: Word>(&self, input: &[u8], output: &mut [u8], ctx: &StageContext) {
        // A threshold beyond the type's range clears everything.
        let t = T::from(self.threshold).unwrap_or_else(T::max_value);
        let mut values = T::load(input);
        subtract_background(&mut values, t, ctx);
        T::store(&values, output);
    }
}

impl FromDescriptor for RemoveBackgroundStage {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self {
            threshold: descriptor.arg("threshold", 0u16)?,
        })
    }
}

impl Stage for RemoveBackgroundStage {
    fn name(&self) -> &'static str {
        "remove_background"
    }

    fn is_lossy(&self) -> bool {
        self.threshold > 0
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
            ElementType::U8 => self.apply::<u8>(input, output, ctx),
            ElementType::U16 => self.apply::<u16>(input, output, ctx),
        }
        Ok(input.len())
    }

    fn decode(
        &self,
        input: &[u8],
        _layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        _ctx: &StageContext,
    ) -> Result<()> {
        if input.len() != output.len() {
            return Err(SqyError::decode(
                self.name(),
                format!("{} bytes stored, {} expected", input.len(), output.len()),
            ));
        }
        output.copy_from_slice(input);
        Ok(())
    }
}
