use std::ops::Range;

use xxhash_rust::xxh3::Xxh3;

use crate::error::{Result, SqyError};
use crate::types::{ElementType, Layout, MAX_NDIMS};

/// Magic bytes opening every sqy stream.
pub const MAGIC: &[u8; 4] = b"SQYZ";

/// Current stream format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the fixed header prefix in bytes.
///   magic[4] + version:u16 + element:u8 + ndims:u8 + stage_count:u8
///   + reserved:u8 + pipeline_len:u16 + header_len:u32 + raw_size:u64
///   + payload_size:u64 + checksum:u64
///   = 4 + 2 + 1 + 1 + 1 + 1 + 2 + 4 + 8 + 8 + 8 = 40
pub const FIXED_HEADER_SIZE: usize = 40;

/// Bytes per stage record, excluding the sidecar itself.
///   input_len:u64 + sidecar_len:u32 = 12
pub const STAGE_RECORD_SIZE: usize = 12;

/// Bytes per shape dimension.
pub const DIM_SIZE: usize = 8;

/// Longest canonical pipeline name the header can carry.
pub const MAX_PIPELINE_LEN: usize = u16::MAX as usize;

/// Position of the checksum inside the fixed prefix.
const CHECKSUM_FIELD: Range<usize> = 32..40;

const HEADER: &str = "header";

/// xxhash3-64 of a serialized header, minus its own checksum field, followed
/// by the payload. Shape, stage sidecars and the pipeline name are all covered.
///
/// `header` must be at least [`FIXED_HEADER_SIZE`] bytes long.
pub fn stream_checksum(header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&header[..CHECKSUM_FIELD.start]);
    hasher.update(&header[CHECKSUM_FIELD.end..]);
    hasher.update(payload);
    hasher.digest()
}

/// Compute the checksum of `header` + `payload` and store it in the header.
pub fn seal(header: &mut [u8], payload: &[u8]) {
    let checksum = stream_checksum(header, payload);
    header[CHECKSUM_FIELD].copy_from_slice(&checksum.to_le_bytes());
}

/// Upper bound on the encoded header for a pipeline, before any encode.
pub fn max_header_size(ndims: usize, pipeline_len: usize, sidecars: impl Iterator<Item = usize>) -> usize {
    sidecars.fold(
        FIXED_HEADER_SIZE + ndims * DIM_SIZE + pipeline_len,
        |acc, sidecar| acc.saturating_add(STAGE_RECORD_SIZE + sidecar),
    )
}

// ── Fixed prefix ───────────────────────────────────────────────────────────

/// The 40-byte prefix, readable without touching anything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPrefix {
    pub version: u16,
    pub element: ElementType,
    pub ndims: u8,
    pub stage_count: u8,
    pub pipeline_len: u16,
    /// Total header length, prefix included. The payload starts here.
    pub header_len: u32,
    pub raw_size: u64,
    pub payload_size: u64,
    /// See [`stream_checksum`].
    pub checksum: u64,
}

impl HeaderPrefix {
    /// Decode and validate the prefix at the start of `buf`.
    pub fn peek(buf: &[u8]) -> Result<Self> {
        let Some(prefix) = buf.get(..FIXED_HEADER_SIZE) else {
            return Err(SqyError::decode(
                HEADER,
                format!("stream holds {} bytes, the header alone needs {FIXED_HEADER_SIZE}", buf.len()),
            ));
        };
        if &prefix[..4] != MAGIC {
            return Err(SqyError::decode(HEADER, "invalid magic bytes, not a sqy stream"));
        }
        let version = u16::from_le_bytes([prefix[4], prefix[5]]);
        if version != FORMAT_VERSION {
            return Err(SqyError::decode(
                HEADER,
                format!("unsupported format version {version} (only {FORMAT_VERSION} is supported)"),
            ));
        }
        let element = ElementType::from_code(prefix[6])
            .ok_or_else(|| SqyError::decode(HEADER, format!("unknown element code {}", prefix[6])))?;
        let mut r = ByteReader::new(&prefix[10..]);
        Ok(Self {
            version,
            element,
            ndims: prefix[7],
            stage_count: prefix[8],
            pipeline_len: r.u16()?,
            header_len: r.u32()?,
            raw_size: r.u64()?,
            payload_size: r.u64()?,
            checksum: r.u64()?,
        })
    }

    fn write(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.element.code();
        buf[7] = self.ndims;
        buf[8] = self.stage_count;
        // buf[9] reserved, stays zero
        buf[10..12].copy_from_slice(&self.pipeline_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.raw_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[CHECKSUM_FIELD].copy_from_slice(&self.checksum.to_le_bytes());
    }
}

// ── Stage records ──────────────────────────────────────────────────────────

/// What the decoder needs to know about one executed stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRecord {
    /// Bytes the stage consumed during encode.
    pub input_len: u64,
    pub sidecar: Vec<u8>,
}

// ── Full header ────────────────────────────────────────────────────────────

/// Decoded representation of a complete stream header.
///
/// ```text
/// [PREFIX: 40 bytes]
/// [SHAPE: ndims x u64]
/// [STAGE 0 .. STAGE N-1: input_len:u64, sidecar_len:u32, sidecar bytes]
/// [PIPELINE NAME: pipeline_len bytes of UTF-8]
/// [PAYLOAD: payload_size bytes]     <- follows the header
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub element: ElementType,
    pub shape: Vec<usize>,
    /// Canonical pipeline name the payload was produced with.
    pub pipeline: String,
    pub stages: Vec<StageRecord>,
    pub raw_size: u64,
    pub payload_size: u64,
    pub checksum: u64,
}

impl StreamHeader {
    /// Exact serialized length of this header.
    pub fn encoded_len(&self) -> usize {
        max_header_size(
            self.shape.len(),
            self.pipeline.len(),
            self.stages.iter().map(|s| s.sidecar.len()),
        )
    }

    pub fn layout(&self) -> Result<Layout> {
        Layout::new(self.element, &self.shape)
    }

    /// Serialize into the start of `buf`; return bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(SqyError::buffer_too_small(len, buf.len()));
        }
        let too_big = |what: &str| SqyError::encode(HEADER, format!("{what} does not fit the header"));
        let prefix = HeaderPrefix {
            version: FORMAT_VERSION,
            element: self.element,
            ndims: u8::try_from(self.shape.len()).map_err(|_| too_big("shape"))?,
            stage_count: u8::try_from(self.stages.len()).map_err(|_| too_big("stage list"))?,
            pipeline_len: u16::try_from(self.pipeline.len()).map_err(|_| too_big("pipeline name"))?,
            header_len: u32::try_from(len).map_err(|_| too_big("header"))?,
            raw_size: self.raw_size,
            payload_size: self.payload_size,
            checksum: self.checksum,
        };
        prefix.write(&mut buf[..FIXED_HEADER_SIZE]);

        let mut pos = FIXED_HEADER_SIZE;
        let mut put = |bytes: &[u8]| {
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        for &dim in &self.shape {
            put(&(dim as u64).to_le_bytes()[..]);
        }
        for stage in &self.stages {
            let sidecar_len = u32::try_from(stage.sidecar.len()).map_err(|_| too_big("sidecar"))?;
            put(&stage.input_len.to_le_bytes()[..]);
            put(&sidecar_len.to_le_bytes()[..]);
            put(&stage.sidecar);
        }
        put(self.pipeline.as_bytes());
        log::trace!("wrote {len}-byte header for pipeline '{}'", self.pipeline);
        Ok(len)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Parse and validate the header at the start of `buf`.
    ///
    /// Returns the header and its length, i.e. the offset of the payload.
    /// Every length field is bounds-checked against `buf`; any inconsistency
    /// is a `DecodeFailure`.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        let prefix = HeaderPrefix::peek(buf)?;
        let header_len = prefix.header_len as usize;
        let ndims = prefix.ndims as usize;
        if ndims == 0 || ndims > MAX_NDIMS {
            return Err(SqyError::decode(HEADER, format!("invalid dimension count {ndims}")));
        }
        let body = buf.get(FIXED_HEADER_SIZE..header_len).ok_or_else(|| {
            SqyError::decode(
                HEADER,
                format!("header claims {header_len} bytes, stream holds {}", buf.len()),
            )
        })?;

        let mut r = ByteReader::new(body);
        let shape = (0..ndims)
            .map(|_| r.u64().and_then(to_usize))
            .collect::<Result<Vec<_>>>()?;
        let stages = (0..prefix.stage_count)
            .map(|_| -> Result<StageRecord> {
                let input_len = r.u64()?;
                let sidecar_len = r.u32()? as usize;
                Ok(StageRecord {
                    input_len,
                    sidecar: r.take(sidecar_len)?.to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let pipeline = std::str::from_utf8(r.take(prefix.pipeline_len as usize)?)
            .map_err(|_| SqyError::decode(HEADER, "pipeline name is not UTF-8"))?
            .to_string();
        if !r.is_empty() {
            return Err(SqyError::decode(HEADER, "trailing bytes inside header"));
        }

        let layout = Layout::new(prefix.element, &shape).map_err(|e| SqyError::decode(HEADER, e.to_string()))?;
        if layout.byte_len() as u64 != prefix.raw_size {
            return Err(SqyError::decode(
                HEADER,
                format!("shape {shape:?} disagrees with raw size {}", prefix.raw_size),
            ));
        }

        let header = Self {
            element: prefix.element,
            shape,
            pipeline,
            stages,
            raw_size: prefix.raw_size,
            payload_size: prefix.payload_size,
            checksum: prefix.checksum,
        };
        log::trace!("parsed {header_len}-byte header: {header:?}");
        Ok((header, header_len))
    }
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| SqyError::decode(HEADER, format!("length {v} exceeds the address space")))
}

/// Little-endian cursor that never reads past its slice.
struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(SqyError::decode(HEADER, "header is truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamHeader {
        StreamHeader {
            element: ElementType::U16,
            shape: vec![7, 9, 11],
            pipeline: "quantiser->lz4".into(),
            stages: vec![
                StageRecord {
                    input_len: 1386,
                    sidecar: vec![1, 2, 3, 4],
                },
                StageRecord {
                    input_len: 693,
                    sidecar: vec![],
                },
            ],
            raw_size: 1386,
            payload_size: 321,
            checksum: 0xDEAD_BEEF_0BAD_F00D,
        }
    }

    #[test]
    fn header_round_trips() {
        let h = sample();
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), 40 + 3 * 8 + (12 + 4) + 12 + 14);
        let (parsed, len) = StreamHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(len, bytes.len());

        let prefix = HeaderPrefix::peek(&bytes).unwrap();
        assert_eq!(prefix.raw_size, 1386);
        assert_eq!(prefix.ndims, 3);
        assert_eq!(prefix.header_len as usize, bytes.len());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(HeaderPrefix::peek(&bytes), Err(SqyError::DecodeFailure { .. })));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(HeaderPrefix::peek(&bytes), Err(SqyError::DecodeFailure { .. })));
    }

    #[test]
    fn every_truncation_is_a_decode_failure() {
        let bytes = sample().to_bytes().unwrap();
        for cut in 0..bytes.len() {
            let err = StreamHeader::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, SqyError::DecodeFailure { .. }), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn inconsistent_raw_size_is_rejected() {
        let mut h = sample();
        h.raw_size = 1000;
        let bytes = h.to_bytes().unwrap();
        assert!(StreamHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn checksum_covers_every_header_byte_but_itself() {
        let mut bytes = sample().to_bytes().unwrap();
        let payload = [9u8; 16];
        seal(&mut bytes, &payload);
        let sealed = HeaderPrefix::peek(&bytes).unwrap().checksum;
        assert_eq!(sealed, stream_checksum(&bytes, &payload));

        // a different stored checksum does not feed into the hash
        let mut resealed = bytes.clone();
        resealed[CHECKSUM_FIELD].fill(0);
        assert_eq!(stream_checksum(&resealed, &payload), sealed);

        // shape, sidecar and name bytes all do
        for pos in [0, 16, FIXED_HEADER_SIZE, FIXED_HEADER_SIZE + 3 * 8 + 12, bytes.len() - 1] {
            let mut flipped = bytes.clone();
            flipped[pos] ^= 0x01;
            assert_ne!(stream_checksum(&flipped, &payload), sealed, "byte {pos}");
        }
    }

    #[test]
    fn write_to_refuses_short_buffer() {
        let h = sample();
        let mut buf = vec![0u8; h.encoded_len() - 1];
        assert!(matches!(h.write_to(&mut buf), Err(SqyError::BufferTooSmall { .. })));
    }
}
