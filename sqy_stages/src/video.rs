use std::borrow::Cow;
use std::marker::PhantomData;
use std::ops::Range;

use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::zstd_stage;

/// Default number of frames per group of pictures for `h264`.
pub const DEFAULT_GOP: usize = 16;

/// A group is only closed once it holds this many bytes, so stacks of tiny
/// frames still compress in useful chunks.
pub const MIN_GROUP_BYTES: usize = 4096;

const MODE_RAW: u8 = 0;
const MODE_ZSTD: u8 = 1;

/// mode:u8 + payload_len:u32
const ENTRY_SIZE: usize = 5;

/// How a video sink predicts frames after the first of a group.
pub trait Profile: Send + Sync + 'static {
    /// Registry token.
    const NAME: &'static str;
    const DEFAULT_GOP: usize;

    /// Prediction of pixel `i` of `current` given the previous reconstructed
    /// frame. Only pixels before `i` in `current` are valid.
    fn predict_inter(current: &[u8], reference: &[u8], i: usize, width: usize) -> u8;
}

/// Co-located pixel of the previous frame.
pub struct H264;

impl Profile for H264 {
    const NAME: &'static str = "h264";
    const DEFAULT_GOP: usize = DEFAULT_GOP;

    #[inline]
    fn predict_inter(_current: &[u8], reference: &[u8], i: usize, _width: usize) -> u8 {
        reference[i]
    }
}

/// Previous frame corrected by the change of the spatial prediction between
/// the two frames, which follows content that brightens or drifts.
pub struct Hevc;

impl Profile for Hevc {
    const NAME: &'static str = "hevc";
    const DEFAULT_GOP: usize = 32;

    #[inline]
    fn predict_inter(current: &[u8], reference: &[u8], i: usize, width: usize) -> u8 {
        let drift = intra(current, i, width) as i16 - intra(reference, i, width) as i16;
        (reference[i] as i16 + drift).clamp(0, 255) as u8
    }
}

/// Block video sink for 8-bit frame stacks, registered as `h264` and `hevc`.
///
/// The array is viewed as frames (last two dimensions) grouped into
/// independent groups of pictures. The first frame of a group is predicted
/// from its own already-coded neighbours with the median edge detector; every
/// later frame is predicted from the previous reconstructed frame as the
/// [`Profile`] says. Residuals of a group are entropy coded with zstd, or
/// stored raw when that is not smaller.
///
/// `qp = 0` is lossless. For `qp > 0` residuals are quantised with a step of
/// `round(2^(qp/6))`, and prediction runs on the reconstruction so encoder and
/// decoder never drift apart.
///
/// # Layout written
/// ```text
/// [group_count: u32]
/// [mode: u8, payload_len: u32] x group_count
/// [GROUP 0] [GROUP 1] ... [GROUP N-1]
/// ```
pub struct VideoStage<P: Profile> {
    qp: u32,
    gop: usize,
    level: i32,
    profile: PhantomData<P>,
}

pub type H264Stage = VideoStage<H264>;
pub type HevcStage = VideoStage<Hevc>;

impl<P: Profile> VideoStage<P> {
    pub fn new(qp: u32, gop: usize, level: i32) -> Self {
        Self {
            qp,
            gop,
            level,
            profile: PhantomData,
        }
    }
}

impl<P: Profile> Default for VideoStage<P> {
    fn default() -> Self {
        Self::new(0, P::DEFAULT_GOP, zstd_stage::DEFAULT_LEVEL)
    }
}

impl<P: Profile> FromDescriptor for VideoStage<P> {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self::new(
            descriptor.arg_in("qp", 0, 0, 51)?,
            descriptor.arg_in("gop", P::DEFAULT_GOP, 1, 1 << 16)?,
            descriptor.arg_in("level", zstd_stage::DEFAULT_LEVEL, 1, 22)?,
        ))
    }
}

/// Frames `[start, end)` of each group of pictures.
fn groups(frames: usize, frame_len: usize, gop: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    if frames == 0 || frame_len == 0 {
        return out;
    }
    let mut start = 0;
    for f in 0..frames {
        let n = f + 1 - start;
        if n >= gop && n * frame_len >= MIN_GROUP_BYTES {
            out.push(start..f + 1);
            start = f + 1;
        }
    }
    if start < frames {
        out.push(start..frames);
    }
    out
}

/// LOCO-I median edge detector.
fn med(a: u8, b: u8, c: u8) -> u8 {
    let (lo, hi) = (a.min(b), a.max(b));
    if c >= hi {
        lo
    } else if c <= lo {
        hi
    } else {
        (a as i16 + b as i16 - c as i16) as u8
    }
}

/// Spatial prediction of pixel `i` from the pixels before it in `frame`.
#[inline]
fn intra(frame: &[u8], i: usize, width: usize) -> u8 {
    let (x, y) = (i % width, i / width);
    match (x, y) {
        (0, 0) => 0,
        (_, 0) => frame[i - 1],
        (0, _) => frame[i - width],
        _ => med(frame[i - 1], frame[i - width], frame[i - width - 1]),
    }
}

#[inline]
fn predict<P: Profile>(current: &[u8], reference: Option<&[u8]>, i: usize, width: usize) -> u8 {
    match reference {
        Some(reference) => P::predict_inter(current, reference, i, width),
        None => intra(current, i, width),
    }
}

fn round_div(d: i32, step: i32) -> i32 {
    if d >= 0 {
        (d + step / 2) / step
    } else {
        -((-d + step / 2) / step)
    }
}

impl<P: Profile> VideoStage<P> {
    fn step(&self) -> i32 {
        if self.qp == 0 {
            1
        } else {
            (2f64.powf(self.qp as f64 / 6.0).round() as i32).clamp(1, 64)
        }
    }

    /// Residuals of one group; `frames` holds whole frames of `height * width`.
    fn residuals(&self, frames: &[u8], width: usize, frame_len: usize) -> Vec<u8> {
        let step = self.step();
        let mut recon = vec![0u8; frames.len()];
        let mut residuals = vec![0u8; frames.len()];
        for k in 0..frames.len() / frame_len {
            let (done, rest) = recon.split_at_mut(k * frame_len);
            let reference = (k > 0).then(|| &done[(k - 1) * frame_len..]);
            let current = &mut rest[..frame_len];
            let src = &frames[k * frame_len..(k + 1) * frame_len];
            let res = &mut residuals[k * frame_len..(k + 1) * frame_len];
            for i in 0..frame_len {
                let pred = predict::<P>(current, reference, i, width);
                if step == 1 {
                    res[i] = src[i].wrapping_sub(pred);
                    current[i] = src[i];
                } else {
                    let q = round_div(src[i] as i32 - pred as i32, step).clamp(-128, 127);
                    res[i] = q as i8 as u8;
                    current[i] = (pred as i32 + q * step).clamp(0, 255) as u8;
                }
            }
        }
        residuals
    }

    /// Invert [`VideoStage::residuals`] into `out`.
    fn reconstruct(&self, residuals: &[u8], out: &mut [u8], width: usize, frame_len: usize) {
        let step = self.step();
        for k in 0..out.len() / frame_len {
            let (done, rest) = out.split_at_mut(k * frame_len);
            let reference = (k > 0).then(|| &done[(k - 1) * frame_len..]);
            let current = &mut rest[..frame_len];
            let res = &residuals[k * frame_len..(k + 1) * frame_len];
            for i in 0..frame_len {
                let pred = predict::<P>(current, reference, i, width);
                current[i] = if step == 1 {
                    res[i].wrapping_add(pred)
                } else {
                    (pred as i32 + (res[i] as i8 as i32) * step).clamp(0, 255) as u8
                };
            }
        }
    }

    fn encode_group(&self, frames: &[u8], width: usize, frame_len: usize) -> Result<(u8, Vec<u8>)> {
        let residuals = self.residuals(frames, width, frame_len);
        let packed = zstd::bulk::compress(&residuals, self.level)
            .map_err(|e| SqyError::encode(self.name(), e.to_string()))?;
        Ok(if packed.len() < residuals.len() {
            (MODE_ZSTD, packed)
        } else {
            (MODE_RAW, residuals)
        })
    }

    fn decode_group(&self, out: &mut [u8], mode: u8, payload: &[u8], width: usize, frame_len: usize) -> Result<()> {
        let residuals: Cow<'_, [u8]> = match mode {
            MODE_RAW if payload.len() == out.len() => Cow::Borrowed(payload),
            MODE_ZSTD => {
                let mut buf = vec![0u8; out.len()];
                let n = zstd::bulk::decompress_to_buffer(payload, &mut buf)
                    .map_err(|e| SqyError::decode(self.name(), e.to_string()))?;
                if n != out.len() {
                    return Err(SqyError::decode(
                        self.name(),
                        format!("group decoded to {n} bytes, {} expected", out.len()),
                    ));
                }
                Cow::Owned(buf)
            }
            _ => {
                return Err(SqyError::decode(
                    self.name(),
                    format!("bad group record (mode {mode}, {} bytes)", payload.len()),
                ))
            }
        };
        self.reconstruct(&residuals, out, width, frame_len);
        Ok(())
    }
}

impl<P: Profile> Stage for VideoStage<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn is_lossy(&self) -> bool {
        self.qp > 0
    }

    fn output_element(&self, input: ElementType) -> Result<ElementType> {
        expect_element(self.name(), input, &[ElementType::U8])
    }

    fn preserves_shape(&self) -> bool {
        false
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        ((input_len / MIN_GROUP_BYTES + 1) * ENTRY_SIZE)
            .saturating_add(4)
            .saturating_add(input_len)
    }

    fn max_decoded_size(&self, encoded: &[u8]) -> usize {
        encoded.len().saturating_mul(zstd_stage::MAX_RATIO)
    }

    fn encode(
        &self,
        input: &[u8],
        layout: &Layout,
        output: &mut [u8],
        _meta: &mut StageMeta,
        ctx: &StageContext,
    ) -> Result<usize> {
        self.output_element(layout.element())?;
        let (frames, height, width) = layout.frame_dims();
        let frame_len = height * width;
        let groups = groups(frames, frame_len, self.gop);

        let encode_one = |r: &Range<usize>| self.encode_group(&input[r.start * frame_len..r.end * frame_len], width, frame_len);
        let coded: Vec<(u8, Vec<u8>)> = if ctx.is_parallel() {
            groups.par_iter().map(encode_one).collect::<Result<_>>()?
        } else {
            groups.iter().map(encode_one).collect::<Result<_>>()?
        };
        log::debug!("{}: {} frames of {height}x{width} in {} groups", P::NAME, frames, coded.len());

        let table_len = 4 + coded.len() * ENTRY_SIZE;
        let total = table_len + coded.iter().map(|(_, p)| p.len()).sum::<usize>();
        ensure_capacity(self.name(), total, output.len())?;

        output[..4].copy_from_slice(&(coded.len() as u32).to_le_bytes());
        let mut pos = table_len;
        for (i, (mode, payload)) in coded.iter().enumerate() {
            let entry = &mut output[4 + i * ENTRY_SIZE..4 + (i + 1) * ENTRY_SIZE];
            entry[0] = *mode;
            entry[1..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            output[pos..pos + payload.len()].copy_from_slice(payload);
            pos += payload.len();
        }
        Ok(total)
    }

    fn decode(
        &self,
        input: &[u8],
        layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        ctx: &StageContext,
    ) -> Result<()> {
        let fail = |reason: String| SqyError::decode(P::NAME, reason);
        let (frames, height, width) = layout.frame_dims();
        let frame_len = height * width;
        let groups = groups(frames, frame_len, self.gop);

        let count = input
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| fail("missing group count".into()))?;
        if count != groups.len() {
            return Err(fail(format!("{count} groups stored, {} expected for {layout}", groups.len())));
        }
        let table = input
            .get(4..4 + count * ENTRY_SIZE)
            .ok_or_else(|| fail("group table is truncated".into()))?;
        let mut parts = Vec::with_capacity(count);
        let mut pos = 4 + count * ENTRY_SIZE;
        for entry in table.chunks_exact(ENTRY_SIZE) {
            let len = u32::from_le_bytes([entry[1], entry[2], entry[3], entry[4]]) as usize;
            let payload = input
                .get(pos..pos + len)
                .ok_or_else(|| fail("group payload is truncated".into()))?;
            parts.push((entry[0], payload));
            pos += len;
        }
        if pos != input.len() {
            return Err(fail(format!("{} trailing bytes after last group", input.len() - pos)));
        }

        let mut regions: Vec<&mut [u8]> = Vec::with_capacity(count);
        let mut rest = output;
        for r in &groups {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(r.len() * frame_len);
            regions.push(head);
            rest = tail;
        }

        let decode_one = |(out, &(mode, payload)): (&mut [u8], &(u8, &[u8]))| {
            self.decode_group(out, mode, payload, width, frame_len)
        };
        if ctx.is_parallel() {
            regions.into_par_iter().zip(parts.par_iter()).try_for_each(decode_one)
        } else {
            regions.into_iter().zip(parts.iter()).try_for_each(decode_one)
        }
    }
}
