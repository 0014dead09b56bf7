//! Decoding for WVQA containers: LCW decompression, codebook/block-pointer
//! video, Westwood ADPCM audio and per-frame metadata.

pub mod adpcm;
pub mod block;
pub mod decoder;
pub mod lcw;
pub mod meta;
pub mod vptr;

mod audio;
mod video;

pub use adpcm::AdpcmState;
pub use block::{BlockGrid, Codebook, Raster};
pub use decoder::{Decoder, PacketSummary};
pub use meta::{DepthBuffer, Light, LightKind, Lights, ScreenEffect, ScreenEffects, ViewParams};
pub use vqa_core::format::{SKIP_AUDIO, SKIP_METADATA, SKIP_NONE, SKIP_VIDEO};
