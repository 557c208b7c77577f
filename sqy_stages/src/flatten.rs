use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::word::Word;

/// Neighbourhood half-width along every axis longer than one sample.
pub const RADIUS: usize = 2;

/// Default share of dark neighbours above which a sample is cleared.
pub const DEFAULT_FRACTION: f32 = 0.5;

/// Shot-noise filter.
///
/// A sample at or above `threshold` is set to 0 when more than `fraction` of
/// its neighbours lie below `threshold`; everything else passes through. The
/// neighbourhood is a cube of `2 * RADIUS + 1` samples per side over the
/// frame view of the array (frames, rows, columns). An axis of extent 1 does
/// not take part, so a 2-D image uses a square and a 1-D signal a window.
/// Samples too close to the border for a full neighbourhood are kept.
///
/// Decode copies, so the stage is lossy whenever `threshold > 0`.
pub struct FlattenStage {
    threshold: u16,
    fraction: f32,
}

impl FlattenStage {
    pub fn new(threshold: u16, fraction: f32) -> Self {
        Self { threshold, fraction }
    }

    fn apply<T: Word>(&self, input: &[u8], layout: &Layout, output: &mut [u8], ctx: &StageContext) {
        let values = T::load(input);
        let flattened = match T::from(self.threshold) {
            Some(t) => flatten(&values, layout.frame_dims(), t, self.fraction, ctx),
            // nothing reaches a threshold beyond the type's range
            None => values,
        };
        T::store(&flattened, output);
    }
}

/// Half-widths along (frames, rows, columns).
fn radii((frames, height, width): (usize, usize, usize)) -> [usize; 3] {
    [frames, height, width].map(|extent| if extent > 1 { RADIUS } else { 0 })
}

/// Number of samples below `threshold` around `(z, y, x)`. The centre itself
/// is at or above `threshold` whenever this is asked.
fn dark_neighbours<T: Word>(
    values: &[T],
    (_, height, width): (usize, usize, usize),
    [rz, ry, rx]: [usize; 3],
    (z, y, x): (usize, usize, usize),
    threshold: T,
) -> usize {
    let mut count = 0;
    for nz in z - rz..=z + rz {
        for ny in y - ry..=y + ry {
            let row = &values[(nz * height + ny) * width..][..width];
            count += row[x - rx..=x + rx].iter().filter(|&&v| v < threshold).count();
        }
    }
    count
}

/// Shot-noise removal kernel shared with the estimated background stage.
pub(crate) fn flatten<T: Word>(
    values: &[T],
    dims: (usize, usize, usize),
    threshold: T,
    fraction: f32,
    ctx: &StageContext,
) -> Vec<T> {
    let (frames, height, width) = dims;
    let [rz, ry, rx] = radii(dims);
    let mut out = values.to_vec();
    let frame_len = height * width;
    if frame_len == 0 || frames <= 2 * rz || height <= 2 * ry || width <= 2 * rx {
        return out;
    }
    let neighbours = (2 * rz + 1) * (2 * ry + 1) * (2 * rx + 1) - 1;
    let cut = fraction * neighbours as f32;

    let clear_frame = |(z, frame): (usize, &mut [T])| {
        if z < rz || z + rz >= frames {
            return;
        }
        for y in ry..height - ry {
            for x in rx..width - rx {
                let v = values[z * frame_len + y * width + x];
                if v < threshold {
                    continue;
                }
                let dark = dark_neighbours(values, dims, [rz, ry, rx], (z, y, x), threshold);
                if dark as f32 > cut {
                    frame[y * width + x] = T::zero();
                }
            }
        }
    };
    if ctx.is_parallel() {
        out.par_chunks_mut(frame_len).enumerate().for_each(clear_frame);
    } else {
        out.chunks_mut(frame_len).enumerate().for_each(clear_frame);
    }
    out
}

impl FromDescriptor for FlattenStage {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self::new(
            descriptor.arg("threshold", 0u16)?,
            descriptor.arg_in("fraction", DEFAULT_FRACTION, 0.0, 1.0)?,
        ))
    }
}

impl Stage for FlattenStage {
    fn name(&self) -> &'static str {
        "flatten_to_neighborhood"
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

    fn run(stage: &FlattenStage, values: &[u16], shape: &[usize], threads: usize) -> Vec<u16> {
        let mut input = vec![0u8; values.len() * 2];
        u16::store(values, &mut input);
        let layout = Layout::new(ElementType::U16, shape).unwrap();
        let mut out = vec![0u8; input.len()];
        stage
            .encode(&input, &layout, &mut out, &mut StageMeta::default(), &StageContext::with_threads(threads))
            .unwrap();
        u16::load(&out)
    }

    #[test]
    fn isolated_bright_samples_are_cleared() {
        // 9x9x9 of dark background with a lone hot pixel and a bright 5x5x5 block
        let n = 9;
        let mut values = vec![10u16; n * n * n];
        let at = |z: usize, y: usize, x: usize| (z * n + y) * n + x;
        values[at(2, 2, 2)] = 500;
        for z in 4..9 {
            for y in 4..9 {
                for x in 4..9 {
                    values[at(z, y, x)] = 800;
                }
            }
        }
        let out = run(&FlattenStage::new(100, 0.5), &values, &[n, n, n], 1);
        assert_eq!(out[at(2, 2, 2)], 0);
        // the block centre has only bright neighbours
        assert_eq!(out[at(6, 6, 6)], 800);
        // border samples keep their value
        assert_eq!(out[at(8, 8, 8)], 800);
        assert_eq!(out[at(0, 0, 0)], 10);
    }

    #[test]
    fn two_dimensional_images_use_a_square() {
        let mut values = vec![0u16; 8 * 8];
        values[3 * 8 + 3] = 1000;
        let out = run(&FlattenStage::new(1, 0.5), &values, &[8, 8], 1);
        assert_eq!(out[3 * 8 + 3], 0);
        assert_eq!(radii((1, 8, 8)), [0, RADIUS, RADIUS]);
    }

    #[test]
    fn thread_count_does_not_change_output() {
        let values: Vec<u16> = (0..12 * 20 * 20u32).map(|i| ((i * 7919) % 300) as u16).collect();
        let stage = FlattenStage::new(150, 0.4);
        assert_eq!(run(&stage, &values, &[12, 20, 20], 1), run(&stage, &values, &[12, 20, 20], 4));
    }

    #[test]
    fn zero_threshold_is_lossless() {
        let stage = FlattenStage::new(0, 0.5);
        assert!(!stage.is_lossy());
        let values: Vec<u16> = (0..1000).map(|i| (i * 13 % 97) as u16).collect();
        assert_eq!(run(&stage, &values, &[10, 10, 10], 2), values);
    }
}
