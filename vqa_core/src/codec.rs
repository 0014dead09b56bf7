use crate::error::Result;
use crate::format::Tag;

/// Parser for one kind of opaque per-frame metadata blob.
///
/// The decoder only buffers the latest blob of each kind; a `FrameMeta`
/// implementation turns that blob into a caller-owned structure when the
/// caller asks for it. Implementations:
/// - Are identified by the packet chunk `TAG` that carries their blob.
/// - Parse into `self` in place, so structures that accumulate state across
///   frames (a depth buffer receiving partial updates) can keep it.
/// - Must reject a malformed blob without panicking; the error only affects
///   the current frame.
pub trait FrameMeta {
    /// Packet chunk tag carrying this blob.
    const TAG: Tag;

    /// Human-readable name for logs and CLI display.
    const NAME: &'static str;

    /// Parse `blob` into `self`.
    fn decode_into(&mut self, blob: &[u8]) -> Result<()>;
}
