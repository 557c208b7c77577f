use rayon::prelude::*;
use sqy_core::stage::{ensure_capacity, expect_element};
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

use crate::word::Word;

/// Number of 8-bit codes.
pub const CODES: usize = 256;

/// Sidecar bytes: the reconstruction table, 256 little-endian `u16`s.
pub const TABLE_BYTES: usize = CODES * 2;

const LEVELS: usize = 1 << 16;

/// Histogram-driven `u16 -> u8` quantiser.
///
/// With at most 256 distinct values each value gets its own code and the
/// stage is lossless. Otherwise the sorted distinct values are cut into
/// contiguous buckets of roughly equal population and each bucket decodes to
/// the count-weighted mean of its members.
///
/// The reconstruction table travels in the stage sidecar.
pub struct QuantiserStage;

/// Forward map for every 16-bit value and the table that undoes it.
struct Codebook {
    codes: Vec<u8>,
    table: [u16; CODES],
    lossless: bool,
}

impl Codebook {
    fn from_histogram(hist: &[u64]) -> Self {
        let levels: Vec<(usize, u64)> = hist
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0)
            .map(|(value, &count)| (value, count))
            .collect();

        let mut codes = vec![0u8; LEVELS];
        let mut table = [0u16; CODES];

        if levels.len() <= CODES {
            for (code, &(value, _)) in levels.iter().enumerate() {
                codes[value] = code as u8;
                table[code] = value as u16;
            }
            return Self {
                codes,
                table,
                lossless: true,
            };
        }

        let mut sums = [0u128; CODES];
        let mut weights = [0u64; CODES];
        let mut bucket = 0usize;
        let mut filled = 0u64;
        let mut rest: u64 = levels.iter().map(|&(_, c)| c).sum();

        for (i, &(value, count)) in levels.iter().enumerate() {
            if filled > 0 && bucket < CODES - 1 {
                let buckets_left = (CODES - 1 - bucket) as u64;
                let share = (filled + rest) / (buckets_left + 1);
                if (levels.len() - i) as u64 <= buckets_left || filled + count / 2 > share {
                    bucket += 1;
                    filled = 0;
                }
            }
            filled += count;
            rest -= count;
            codes[value] = bucket as u8;
            sums[bucket] += value as u128 * count as u128;
            weights[bucket] += count;
        }

        let mut last = 0u16;
        for code in 0..CODES {
            if weights[code] > 0 {
                let w = weights[code] as u128;
                last = ((sums[code] + w / 2) / w) as u16;
            }
            table[code] = last;
        }
        Self {
            codes,
            table,
            lossless: false,
        }
    }

    fn table_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

fn histogram(values: &[u16], ctx: &StageContext) -> Vec<u64> {
    let count = |mut hist: Vec<u64>, chunk: &[u16]| {
        for &v in chunk {
            hist[v as usize] += 1;
        }
        hist
    };
    if ctx.is_parallel() {
        values
            .par_chunks(LEVELS)
            .fold(|| vec![0u64; LEVELS], count)
            .reduce(
                || vec![0u64; LEVELS],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            )
    } else {
        count(vec![0u64; LEVELS], values)
    }
}

fn read_table(sidecar: &[u8]) -> Result<[u16; CODES]> {
    if sidecar.len() != TABLE_BYTES {
        return Err(SqyError::decode(
            "quantiser",
            format!("reconstruction table holds {} bytes, {TABLE_BYTES} expected", sidecar.len()),
        ));
    }
    let mut table = [0u16; CODES];
    for (entry, pair) in table.iter_mut().zip(sidecar.chunks_exact(2)) {
        *entry = u16::from_le_bytes([pair[0], pair[1]]);
    }
    Ok(table)
}

impl FromDescriptor for QuantiserStage {
    fn from_descriptor(_descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self)
    }
}

impl Stage for QuantiserStage {
    fn name(&self) -> &'static str {
        "quantiser"
    }

    fn is_lossy(&self) -> bool {
        true
    }

    fn output_element(&self, input: ElementType) -> Result<ElementType> {
        expect_element(self.name(), input, &[ElementType::U16]).map(|_| ElementType::U8)
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        input_len
    }

    fn max_decoded_size(&self, encoded: &[u8]) -> usize {
        encoded.len().saturating_mul(2)
    }

    fn max_sidecar_size(&self) -> usize {
        TABLE_BYTES
    }

    fn encode(
        &self,
        input: &[u8],
        layout: &Layout,
        output: &mut [u8],
        meta: &mut StageMeta,
        ctx: &StageContext,
    ) -> Result<usize> {
        self.output_element(layout.element())?;
        let values = u16::load(input);
        ensure_capacity(self.name(), values.len(), output.len())?;

        let book = Codebook::from_histogram(&histogram(&values, ctx));
        if !book.lossless {
            log::debug!("quantiser: more than {CODES} distinct values, falling back to weighted buckets");
        }
        let out = &mut output[..values.len()];
        if ctx.is_parallel() {
            out.par_iter_mut()
                .zip(values.par_iter())
                .for_each(|(o, &v)| *o = book.codes[v as usize]);
        } else {
            out.iter_mut()
                .zip(&values)
                .for_each(|(o, &v)| *o = book.codes[v as usize]);
        }
        meta.sidecar = book.table_bytes();
        Ok(values.len())
    }

    fn decode(
        &self,
        input: &[u8],
        _layout: &Layout,
        meta: &StageMeta,
        output: &mut [u8],
        ctx: &StageContext,
    ) -> Result<()> {
        let table = read_table(&meta.sidecar)?;
        if input.len() * 2 != output.len() {
            return Err(SqyError::decode(
                self.name(),
                format!("{} codes stored for {} output bytes", input.len(), output.len()),
            ));
        }
        let expand = |(pair, &code): (&mut [u8], &u8)| {
            pair.copy_from_slice(&table[code as usize].to_ne_bytes());
        };
        if ctx.is_parallel() {
            output.par_chunks_exact_mut(2).zip(input.par_iter()).for_each(expand);
        } else {
            output.chunks_exact_mut(2).zip(input.iter()).for_each(expand);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(values: &[u16], threads: usize) -> (Vec<u16>, Vec<u8>) {
        let mut input = vec![0u8; values.len() * 2];
        u16::store(values, &mut input);
        let layout = Layout::new(ElementType::U16, &[values.len()]).unwrap();
        let ctx = StageContext::with_threads(threads);
        let mut encoded = vec![0u8; QuantiserStage.max_encoded_size(input.len())];
        let mut meta = StageMeta::default();
        let n = QuantiserStage.encode(&input, &layout, &mut encoded, &mut meta, &ctx).unwrap();
        assert_eq!(n, values.len());
        assert_eq!(meta.sidecar.len(), TABLE_BYTES);
        encoded.truncate(n);

        let mut decoded = vec![0u8; input.len()];
        QuantiserStage.decode(&encoded, &layout, &meta, &mut decoded, &ctx).unwrap();
        (u16::load(&decoded), encoded)
    }

    #[test]
    fn few_levels_are_exact() {
        let values: Vec<u16> = (0..10_000).map(|i| [3, 900, 0xAAAA, 0x5555, 65535][i % 5]).collect();
        let (decoded, codes) = round_trip(&values, 1);
        assert_eq!(decoded, values);
        // codes follow value order
        assert_eq!(&codes[..5], &[0, 1, 3, 2, 4]);
    }

    #[test]
    fn many_levels_stay_close_and_monotone() {
        let values: Vec<u16> = (0..8192u32).map(|i| (i * 8) as u16).collect();
        let (decoded, codes) = round_trip(&values, 1);
        for (orig, got) in values.iter().zip(&decoded) {
            assert!((*orig as i32 - *got as i32).abs() <= 256, "{orig} -> {got}");
        }
        assert!(codes.windows(2).all(|w| w[0] <= w[1]));
        let used: std::collections::BTreeSet<u8> = codes.iter().copied().collect();
        assert_eq!(used.len(), CODES);
    }

    #[test]
    fn parallel_encoding_matches_sequential() {
        let values: Vec<u16> = (0..200_000u32).map(|i| (i.wrapping_mul(40503) >> 3) as u16).collect();
        assert_eq!(round_trip(&values, 1).1, round_trip(&values, 4).1);
    }

    #[test]
    fn rejects_bytes() {
        assert!(matches!(
            QuantiserStage.output_element(ElementType::U8),
            Err(SqyError::UnsupportedElementType { .. })
        ));
    }

    #[test]
    fn bad_table_is_a_decode_failure() {
        let layout = Layout::new(ElementType::U16, &[2]).unwrap();
        let meta = StageMeta { sidecar: vec![0; 10] };
        let mut out = [0u8; 4];
        let err = QuantiserStage
            .decode(&[0, 1], &layout, &meta, &mut out, &StageContext::sequential())
            .unwrap_err();
        assert!(matches!(err, SqyError::DecodeFailure { .. }));
    }
}
