pub mod decoder;
pub mod encoder;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod registry;
pub mod stage;
pub mod types;
pub mod version;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Result, SqyError};
pub use format::{StageRecord, StreamHeader, HeaderPrefix, FIXED_HEADER_SIZE, MAGIC};
pub use pipeline::{Pipeline, StageDescriptor, STAGE_SEPARATOR};
pub use registry::{Registry, StageEntry};
pub use stage::{FromDescriptor, Stage, StageContext, StageMeta};
pub use types::{ElementType, Layout, Sample, MAX_NDIMS};
pub use version::{Version, VERSION};
