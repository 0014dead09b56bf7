//! Error types for WVQA decoding.

use std::io;

use thiserror::Error;

use crate::format::Tag;

/// Result type for vqa operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for vqa operations.
///
/// `Format` and `Truncated` raised while opening abort the open entirely.
/// Once a container is open, `Decode`, `Truncated` and `Range` only invalidate
/// the frame or audio unit being decoded; see [`Error::is_frame_local`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad magic, malformed descriptor chunk, or unsupported header.
    #[error("invalid WVQA container: {0}")]
    Format(String),

    /// The stream ended before a declared chunk size was satisfied.
    #[error("truncated {tag} chunk: need {need} bytes, have {have}")]
    Truncated { tag: Tag, need: u64, have: u64 },

    /// Frame or loop index out of bounds.
    #[error("{what} index {index} out of range (count {len})")]
    Range {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// Corrupt compressed data, bad opcode, or inconsistent codec state.
    #[error("decode error: {0}")]
    Decode(String),

    /// No packet left at the current stream position.
    #[error("end of stream")]
    EndOfStream,
}

impl Error {
    /// Create a format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a range error.
    pub fn range(what: &'static str, index: usize, len: usize) -> Self {
        Self::Range { what, index, len }
    }

    /// True when the error only invalidates the current frame or audio unit.
    ///
    /// The previously decoded raster, audio and metadata remain valid and the
    /// caller may keep playing from the next packet.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Truncated { .. } | Self::Range { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_local_classification() {
        assert!(Error::decode("bad opcode").is_frame_local());
        assert!(Error::range("frame", 9, 3).is_frame_local());
        assert!(!Error::EndOfStream.is_frame_local());
        assert!(!Error::format("bad magic").is_frame_local());
        let io = Error::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(!io.is_frame_local());
    }

    #[test]
    fn test_messages() {
        let err = Error::Truncated {
            tag: Tag(*b"VPTR"),
            need: 100,
            have: 12,
        };
        assert_eq!(err.to_string(), "truncated VPTR chunk: need 100 bytes, have 12");
        assert_eq!(
            Error::range("loop", 4, 2).to_string(),
            "loop index 4 out of range (count 2)"
        );
    }
}
