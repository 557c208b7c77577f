mod background;
mod bitswap;
mod diff;
mod estimated_background;
mod flatten;
mod lz4_stage;
mod passthrough;
mod quantiser;
mod video;
mod word;
mod zstd_stage;

pub mod api;
pub mod simple;

pub use background::RemoveBackgroundStage;
pub use bitswap::{BitSwapStage, BITSWAP_VARIANTS};
pub use diff::DiffStage;
pub use estimated_background::EstimatedBackgroundStage;
pub use flatten::FlattenStage;
pub use lz4_stage::{Lz4Stage, DEFAULT_FRAMESTEP_KB};
pub use passthrough::PassThroughStage;
pub use quantiser::QuantiserStage;
pub use video::{H264Stage, HevcStage, Profile, VideoStage, DEFAULT_GOP, H264, Hevc};
pub use zstd_stage::{ZstdStage, DEFAULT_LEVEL};

use sqy_core::registry::{build_stage, check_stage};
use sqy_core::{Registry, StageEntry};

static ENTRIES: [StageEntry; 11] = [
    StageEntry {
        name: "pass_through",
        variants: &[],
        args: &[],
        lossy: false,
        summary: "copy input unchanged",
        check: check_stage::<PassThroughStage>,
        build: build_stage::<PassThroughStage>,
    },
    StageEntry {
        name: "bitswap",
        variants: BITSWAP_VARIANTS,
        args: &[],
        lossy: false,
        summary: "reorder samples into bit planes, suffix = bits per plane",
        check: check_stage::<BitSwapStage>,
        build: build_stage::<BitSwapStage>,
    },
    StageEntry {
        name: "diff",
        variants: &[],
        args: &[],
        lossy: false,
        summary: "wrapping difference to the previous sample of each row",
        check: check_stage::<DiffStage>,
        build: build_stage::<DiffStage>,
    },
    StageEntry {
        name: "remove_background",
        variants: &[],
        args: &["threshold"],
        lossy: true,
        summary: "subtract a flat background level, clamping at zero",
        check: check_stage::<RemoveBackgroundStage>,
        build: build_stage::<RemoveBackgroundStage>,
    },
    StageEntry {
        name: "flatten_to_neighborhood",
        variants: &[],
        args: &["threshold", "fraction"],
        lossy: true,
        summary: "clear bright samples whose neighbourhood is mostly dark",
        check: check_stage::<FlattenStage>,
        build: build_stage::<FlattenStage>,
    },
    StageEntry {
        name: "remove_estimated_background",
        variants: &[],
        args: &[],
        lossy: true,
        summary: "estimate the background from the outer faces, flatten, subtract",
        check: check_stage::<EstimatedBackgroundStage>,
        build: build_stage::<EstimatedBackgroundStage>,
    },
    StageEntry {
        name: "quantiser",
        variants: &[],
        args: &[],
        lossy: true,
        summary: "histogram quantiser u16 -> u8",
        check: check_stage::<QuantiserStage>,
        build: build_stage::<QuantiserStage>,
    },
    StageEntry {
        name: "lz4",
        variants: &[],
        args: &["framestep_kb"],
        lossy: false,
        summary: "LZ4 blocks over fixed frame steps",
        check: check_stage::<Lz4Stage>,
        build: build_stage::<Lz4Stage>,
    },
    StageEntry {
        name: "zstd",
        variants: &[],
        args: &["level"],
        lossy: false,
        summary: "single zstd frame",
        check: check_stage::<ZstdStage>,
        build: build_stage::<ZstdStage>,
    },
    StageEntry {
        name: "h264",
        variants: &[],
        args: &["qp", "gop", "level"],
        lossy: true,
        summary: "predictive video coding of u8 frame stacks, lossless at qp=0",
        check: check_stage::<H264Stage>,
        build: build_stage::<H264Stage>,
    },
    StageEntry {
        name: "hevc",
        variants: &[],
        args: &["qp", "gop", "level"],
        lossy: true,
        summary: "h264 framing with gradient-adjusted inter prediction, lossless at qp=0",
        check: check_stage::<HevcStage>,
        build: build_stage::<HevcStage>,
    },
];

/// Every stage this crate provides. Read-only and shared by all calls.
pub static REGISTRY: Registry = Registry::new(&ENTRIES);

pub fn registry() -> &'static Registry {
    &REGISTRY
}
