use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SqyError};

/// Largest number of dimensions a stream header can describe.
pub const MAX_NDIMS: usize = 8;

/// Fixed-width unsigned sample types the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
}

impl ElementType {
    /// Width of one sample in bytes.
    pub const fn width(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
        }
    }

    /// Code stored in the stream header.
    pub const fn code(self) -> u8 {
        self.width() as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ElementType::U8),
            2 => Some(ElementType::U16),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "u8" | "uint8" => Ok(ElementType::U8),
            "u16" | "uint16" => Ok(ElementType::U16),
            other => Err(format!("unknown element type '{other}', expected u8 or u16")),
        }
    }
}

/// Rust sample types that map onto an [`ElementType`].
///
/// `Pod` lets typed caller buffers be viewed as bytes without copying.
pub trait Sample: bytemuck::Pod + Send + Sync + 'static {
    const ELEMENT: ElementType;
}

impl Sample for u8 {
    const ELEMENT: ElementType = ElementType::U8;
}

impl Sample for u16 {
    const ELEMENT: ElementType = ElementType::U16;
}

/// Element type plus shape of a dense array in C order (`shape[0]` varies slowest).
///
/// A `Layout` always describes a byte length that fits in `usize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    element: ElementType,
    shape: Vec<usize>,
    byte_len: usize,
}

impl Layout {
    /// Validate `shape` (1 to [`MAX_NDIMS`] dimensions, no overflow) and build a layout.
    pub fn new(element: ElementType, shape: &[usize]) -> Result<Self> {
        if shape.is_empty() {
            return Err(SqyError::shape("shape has no dimensions"));
        }
        if shape.len() > MAX_NDIMS {
            return Err(SqyError::shape(format!(
                "shape has {} dimensions, at most {MAX_NDIMS} are supported",
                shape.len()
            )));
        }
        let byte_len = shape
            .iter()
            .try_fold(element.width(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| SqyError::shape(format!("shape {shape:?} overflows the address space")))?;
        Ok(Self {
            element,
            shape: shape.to_vec(),
            byte_len,
        })
    }

    /// One-dimensional layout covering `byte_len` bytes.
    pub fn flat(element: ElementType, byte_len: usize) -> Self {
        Self {
            element,
            shape: vec![byte_len / element.width()],
            byte_len: byte_len - byte_len % element.width(),
        }
    }

    /// Same shape, different element type.
    pub fn with_element(&self, element: ElementType) -> Result<Self> {
        Self::new(element, &self.shape)
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.byte_len / self.element.width()
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Reject a buffer whose length disagrees with the layout.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if len != self.byte_len {
            return Err(SqyError::shape(format!(
                "shape {:?} of {} needs {} bytes, buffer holds {len}",
                self.shape, self.element, self.byte_len
            )));
        }
        Ok(())
    }

    /// Length of the fastest-varying dimension.
    pub fn row_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// View the array as a stack of 2-D frames: `(frames, height, width)`.
    ///
    /// The last two dimensions form a frame and every leading dimension is
    /// folded into the frame count. A 1-D array is a single `1 x n` frame.
    pub fn frame_dims(&self) -> (usize, usize, usize) {
        match self.shape.as_slice() {
            [] => (0, 0, 0),
            [n] => (1, 1, *n),
            [lead @ .., h, w] => (lead.iter().product(), *h, *w),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        write!(f, "{}[{}]", self.element, dims.join("x"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_byte_len_counts_element_width() {
        let l = Layout::new(ElementType::U16, &[7, 9, 11]).unwrap();
        assert_eq!(l.num_elements(), 693);
        assert_eq!(l.byte_len(), 1386);
        assert_eq!(l.ndims(), 3);
        assert!(l.check_len(1386).is_ok());
        assert!(matches!(l.check_len(1385), Err(SqyError::ShapeMismatch { .. })));
    }

    #[test]
    fn layout_rejects_bad_shapes() {
        assert!(Layout::new(ElementType::U8, &[]).is_err());
        assert!(Layout::new(ElementType::U8, &[1; MAX_NDIMS + 1]).is_err());
        assert!(Layout::new(ElementType::U16, &[usize::MAX, 2]).is_err());
    }

    #[test]
    fn frame_dims_fold_leading_axes() {
        let l = Layout::new(ElementType::U8, &[2, 3, 4, 5]).unwrap();
        assert_eq!(l.frame_dims(), (6, 4, 5));
        let l = Layout::new(ElementType::U8, &[4, 5]).unwrap();
        assert_eq!(l.frame_dims(), (1, 4, 5));
        let l = Layout::flat(ElementType::U8, 17);
        assert_eq!(l.frame_dims(), (1, 1, 17));
    }

    #[test]
    fn element_type_parses_and_round_trips_codes() {
        assert_eq!("u16".parse::<ElementType>().unwrap(), ElementType::U16);
        assert!("f32".parse::<ElementType>().is_err());
        for e in [ElementType::U8, ElementType::U16] {
            assert_eq!(ElementType::from_code(e.code()), Some(e));
        }
        assert_eq!(ElementType::from_code(9), None);
    }
}
