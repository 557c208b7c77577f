use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::background::subtract_background;
use crate::flatten::{flatten, DEFAULT_FRACTION};
use crate::word::Word;

/// Share of a face's samples at or below its background level.
pub const FACE_QUANTILE: f64 = 0.99;

/// Background removal with a level estimated from the data.
///
/// The outer faces of the frame view (first and last frame, first and last
/// row of every frame) are assumed to hold background only. The level is
/// the 99th percentile of the darkest face. Shot noise brighter than that
/// level is flattened with the `flatten_to_neighborhood` kernel, then the
/// level is subtracted from every sample, clamping at zero.
///
/// The estimate is not stored, so decode copies and the stage is lossy.
pub struct EstimatedBackgroundStage;

/// Smallest sample value `v` such that at least `FACE_QUANTILE` of `face`
/// is `<= v`.
fn face_level<T: Word>(mut face: Vec<T>) -> Option<T> {
    if face.is_empty() {
        return None;
    }
    let rank = ((face.len() as f64 * FACE_QUANTILE).ceil() as usize).clamp(1, face.len()) - 1;
    Some(*face.select_nth_unstable(rank).1)
}

/// Background level of an array viewed as `(frames, height, width)`.
pub(crate) fn estimate_level<T: Word>(values: &[T], (frames, height, width): (usize, usize, usize)) -> T {
    let frame_len = height * width;
    if frame_len == 0 || frames == 0 {
        return T::zero();
    }
    let frame = |z: usize| values[z * frame_len..(z + 1) * frame_len].to_vec();
    let row_face = |y: usize| -> Vec<T> {
        (0..frames)
            .flat_map(|z| values[z * frame_len + y * width..][..width].iter().copied())
            .collect()
    };
    [frame(0), frame(frames - 1), row_face(0), row_face(height - 1)]
        .into_iter()
        .filter_map(face_level)
        .min()
        .unwrap_or_else(T::zero)
}

impl EstimatedBackgroundStage {
    fn apply<T: Word>(&self, input: &[u8], layout: &Layout, output: &mut [u8], ctx: &StageContext) {
        let dims = layout.frame_dims();
        let values = T::load(input);
        let level = estimate_level(&values, dims);
        log::debug!(
            "{}: estimated background level {} for {layout}",
            self.name(),
            level.to_u64().unwrap_or(0)
        );
        let mut flattened = flatten(&values, dims, level, DEFAULT_FRACTION, ctx);
        subtract_background(&mut flattened, level, ctx);
        T::store(&flattened, output);
    }
}

impl FromDescriptor for EstimatedBackgroundStage {
    fn from_descriptor(_descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self)
    }
}

impl Stage for EstimatedBackgroundStage {
    fn name(&self) -> &'static str {
        "remove_estimated_background"
    }

    fn is_lossy(&self) -> bool {
        true
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
            ElementType::U8 => self.apply::<u8>(input, layout, output, ctx),
            ElementType::U16 => self.apply::<u16>(input, layout, output, ctx),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_the_percentile_of_the_darkest_face() {
        assert_eq!(face_level((1..=100u16).collect()), Some(99));
        assert_eq!(face_level(vec![7u8]), Some(7));
        assert_eq!(face_level(Vec::<u16>::new()), None);

        // first frame is dark (level 20), the last frame is bright
        let (frames, h, w) = (4, 10, 10);
        let values: Vec<u16> = (0..frames * h * w)
            .map(|i| if i < h * w { 20 } else if i >= (frames - 1) * h * w { 900 } else { 300 })
            .collect();
        assert_eq!(estimate_level(&values, (frames, h, w)), 20);
    }

    #[test]
    fn subtracts_the_estimate_and_keeps_bright_structure() {
        // background 100 with a bright 6x6x6 block in the middle
        let n = 12;
        let at = |z: usize, y: usize, x: usize| (z * n + y) * n + x;
        let mut values = vec![100u16; n * n * n];
        for z in 3..9 {
            for y in 3..9 {
                for x in 3..9 {
                    values[at(z, y, x)] = 1100;
                }
            }
        }
        let mut input = vec![0u8; values.len() * 2];
        u16::store(&values, &mut input);
        let layout = Layout::new(ElementType::U16, &[n, n, n]).unwrap();
        let mut out = vec![0u8; input.len()];
        let stage = EstimatedBackgroundStage;
        stage
            .encode(&input, &layout, &mut out, &mut StageMeta::default(), &StageContext::with_threads(2))
            .unwrap();
        let out = u16::load(&out);
        assert_eq!(out[at(0, 0, 0)], 0);
        assert_eq!(out[at(6, 6, 6)], 1000);
        assert!(stage.is_lossy());
    }
}
