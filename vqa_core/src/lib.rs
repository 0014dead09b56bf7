pub mod codec;
pub mod error;
pub mod format;
pub mod index;
pub mod reader;
pub mod writer;

pub use codec::FrameMeta;
pub use error::{Error, Result};
pub use format::{ChunkHeader, ChunkKind, Tag, VqaHeader};
pub use index::{ChunkLimits, CodebookInfo, FrameIndex, LoopInfo, LoopTable};
pub use reader::{Reader, ReaderOptions};
pub use writer::{Descriptors, Writer};
