use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::format::{Tag, FRAME_OFFSET_MASK, FRAME_OFFSET_UNIT};

// ── Frame index ────────────────────────────────────────────────────────────

/// Per-frame offset table loaded from `FINF`.
///
/// Each entry is a little-endian u32: the low 28 bits are the packet's byte
/// offset divided by [`FRAME_OFFSET_UNIT`], the top 4 bits are flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameIndex {
    entries: Vec<u32>,
}

impl FrameIndex {
    pub fn new(entries: Vec<u32>) -> Self {
        Self { entries }
    }

    /// Parse a `FINF` payload that must hold exactly `frame_count` entries.
    pub fn from_bytes(buf: &[u8], frame_count: usize) -> Result<Self> {
        if buf.len() != frame_count * 4 {
            return Err(Error::format(format!(
                "FINF chunk is {} bytes, expected {} for {} frames",
                buf.len(),
                frame_count * 4,
                frame_count
            )));
        }
        let mut entries = vec![0u32; frame_count];
        Cursor::new(buf).read_u32_into::<LittleEndian>(&mut entries)?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw(&self, frame: usize) -> Result<u32> {
        self.entries
            .get(frame)
            .copied()
            .ok_or_else(|| Error::range("frame", frame, self.entries.len()))
    }

    /// Stored offset of `frame`, in [`FRAME_OFFSET_UNIT`]s, flags removed.
    pub fn entry(&self, frame: usize) -> Result<u32> {
        Ok(self.raw(frame)? & FRAME_OFFSET_MASK)
    }

    /// Flag nibble stored alongside the offset of `frame`.
    pub fn flags(&self, frame: usize) -> Result<u8> {
        Ok((self.raw(frame)? >> 28) as u8)
    }

    /// Absolute byte offset of the packet for `frame`.
    pub fn byte_offset(&self, frame: usize) -> Result<u64> {
        Ok(self.entry(frame)? as u64 * FRAME_OFFSET_UNIT)
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }
}

// ── Loops ──────────────────────────────────────────────────────────────────

/// A named frame range, e.g. an intro followed by an idle loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopInfo {
    pub begin: u16,
    pub end: u16,
    pub name: String,
}

impl LoopInfo {
    /// Frames from `begin` to `end` inclusive.
    pub fn frame_count(&self) -> usize {
        (self.end - self.begin) as usize + 1
    }
}

/// Size of the `LINH` record: count:u16 + flags:u32.
pub const LINH_SIZE: usize = 6;
/// Size of one `LIND` entry: begin:u16 + end:u16.
pub const LIND_ENTRY_SIZE: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopTable {
    pub flags: u32,
    loops: Vec<LoopInfo>,
}

impl LoopTable {
    pub fn new(flags: u32, loops: Vec<LoopInfo>) -> Self {
        Self { flags, loops }
    }

    /// Parse the `LINH` header and `LIND` entries of a `LINF` container.
    pub fn from_records(linh: &[u8], lind: &[u8]) -> Result<Self> {
        if linh.len() != LINH_SIZE {
            return Err(Error::format(format!(
                "LINH chunk is {} bytes, expected {}",
                linh.len(),
                LINH_SIZE
            )));
        }
        let mut c = Cursor::new(linh);
        let count = c.read_u16::<LittleEndian>()? as usize;
        let flags = c.read_u32::<LittleEndian>()?;

        if lind.len() != count * LIND_ENTRY_SIZE {
            return Err(Error::format(format!(
                "LIND chunk is {} bytes, expected {} for {} loops",
                lind.len(),
                count * LIND_ENTRY_SIZE,
                count
            )));
        }
        let mut c = Cursor::new(lind);
        let mut loops = Vec::with_capacity(count);
        for _ in 0..count {
            let begin = c.read_u16::<LittleEndian>()?;
            let end = c.read_u16::<LittleEndian>()?;
            loops.push(LoopInfo {
                begin,
                end,
                name: String::new(),
            });
        }
        Ok(Self { flags, loops })
    }

    /// Attach names parsed from an `LNIN` container, in loop order.
    pub fn set_names(&mut self, names: Vec<String>) -> Result<()> {
        if names.len() != self.loops.len() {
            return Err(Error::format(format!(
                "{} loop names for {} loops",
                names.len(),
                self.loops.len()
            )));
        }
        for (l, name) in self.loops.iter_mut().zip(names) {
            l.name = name;
        }
        Ok(())
    }

    /// Check every loop lies within `[0, frame_count)` and is not reversed.
    pub fn validate(&self, frame_count: usize) -> Result<()> {
        for (i, l) in self.loops.iter().enumerate() {
            if l.begin > l.end || l.end as usize >= frame_count {
                return Err(Error::format(format!(
                    "loop {} spans frames {}..={} outside 0..{}",
                    i, l.begin, l.end, frame_count
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&LoopInfo> {
        self.loops
            .get(index)
            .ok_or_else(|| Error::range("loop", index, self.loops.len()))
    }

    /// `(begin, end)` frame numbers of loop `index`, both inclusive.
    pub fn bounds(&self, index: usize) -> Result<(u16, u16)> {
        let l = self.get(index)?;
        Ok((l.begin, l.end))
    }

    pub fn name(&self, index: usize) -> Result<&str> {
        Ok(&self.get(index)?.name)
    }

    /// Index of the first loop called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.loops.iter().position(|l| l.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopInfo> {
        self.loops.iter()
    }
}

/// Parse the three parts of an `LNIN` container into loop names.
///
/// `LNHD` holds the count, `LNOF` one u32 offset per name into `LNTX`, and
/// `LNTX` the NUL-terminated strings themselves.
pub fn parse_loop_names(lnhd: &[u8], lnof: &[u8], lntx: &[u8]) -> Result<Vec<String>> {
    if lnhd.len() != 2 {
        return Err(Error::format(format!(
            "LNHD chunk is {} bytes, expected 2",
            lnhd.len()
        )));
    }
    let count = u16::from_le_bytes([lnhd[0], lnhd[1]]) as usize;
    if lnof.len() != count * 4 {
        return Err(Error::format(format!(
            "LNOF chunk is {} bytes, expected {} for {} names",
            lnof.len(),
            count * 4,
            count
        )));
    }

    let mut offsets = vec![0u32; count];
    Cursor::new(lnof).read_u32_into::<LittleEndian>(&mut offsets)?;

    offsets
        .into_iter()
        .map(|off| {
            let tail = lntx.get(off as usize..).ok_or_else(|| {
                Error::format(format!(
                    "loop name offset {} beyond {} byte LNTX",
                    off,
                    lntx.len()
                ))
            })?;
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::format("unterminated loop name in LNTX"))?;
            Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
        })
        .collect()
}

// ── Codebook info ──────────────────────────────────────────────────────────

/// Size of the `CINH` record: count:u16 + reserved[6].
pub const CINH_SIZE: usize = 8;
/// Size of one `CIND` entry: frame:u16 + size:u32.
pub const CIND_ENTRY_SIZE: usize = 6;

/// A frame that carries a codebook update, and the update's compressed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodebookInfo {
    pub frame: u16,
    pub size: u32,
}

/// Parse the `CINH` header and `CIND` entries of a `CINF` container.
pub fn parse_codebook_info(cinh: &[u8], cind: &[u8]) -> Result<Vec<CodebookInfo>> {
    if cinh.len() != CINH_SIZE {
        return Err(Error::format(format!(
            "CINH chunk is {} bytes, expected {}",
            cinh.len(),
            CINH_SIZE
        )));
    }
    let count = u16::from_le_bytes([cinh[0], cinh[1]]) as usize;
    if cind.len() != count * CIND_ENTRY_SIZE {
        return Err(Error::format(format!(
            "CIND chunk is {} bytes, expected {} for {} entries",
            cind.len(),
            count * CIND_ENTRY_SIZE,
            count
        )));
    }
    let mut c = Cursor::new(cind);
    let mut infos = Vec::with_capacity(count);
    for _ in 0..count {
        infos.push(CodebookInfo {
            frame: c.read_u16::<LittleEndian>()?,
            size: c.read_u32::<LittleEndian>()?,
        });
    }
    Ok(infos)
}

// ── Chunk size limits ──────────────────────────────────────────────────────

/// Size of one `MFCT` entry: tag[4] + max:u32.
pub const MFCT_ENTRY_SIZE: usize = 8;

/// Declared maximum payload size per packet chunk tag.
///
/// Scratch buffers are sized from these once and reused; a chunk larger than
/// its declared maximum is rejected rather than grown into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkLimits {
    limits: HashMap<Tag, u32>,
}

impl ChunkLimits {
    /// Parse the `MFHD` count and `MFCT` entries of an `MFCI` container.
    pub fn from_records(mfhd: &[u8], mfct: &[u8]) -> Result<Self> {
        if mfhd.len() != 4 {
            return Err(Error::format(format!(
                "MFHD chunk is {} bytes, expected 4",
                mfhd.len()
            )));
        }
        let count = u32::from_le_bytes([mfhd[0], mfhd[1], mfhd[2], mfhd[3]]) as usize;
        if mfct.len() != count * MFCT_ENTRY_SIZE {
            return Err(Error::format(format!(
                "MFCT chunk is {} bytes, expected {} for {} entries",
                mfct.len(),
                count * MFCT_ENTRY_SIZE,
                count
            )));
        }
        let limits = mfct
            .chunks_exact(MFCT_ENTRY_SIZE)
            .map(|e| {
                let tag = Tag([e[0], e[1], e[2], e[3]]);
                let max = u32::from_le_bytes([e[4], e[5], e[6], e[7]]);
                (tag, max)
            })
            .collect();
        Ok(Self { limits })
    }

    /// Record `max` for `tag` unless the negotiation table already has one.
    pub fn set_default(&mut self, tag: Tag, max: u32) {
        self.limits.entry(tag).or_insert(max);
    }

    pub fn set(&mut self, tag: Tag, max: u32) {
        self.limits.insert(tag, max);
    }

    pub fn get(&self, tag: Tag) -> Option<u32> {
        self.limits.get(&tag).copied()
    }

    /// Entries sorted by tag, for display.
    pub fn sorted(&self) -> Vec<(Tag, u32)> {
        let mut v: Vec<_> = self.limits.iter().map(|(t, m)| (*t, *m)).collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_index_masks_flags() {
        let index = FrameIndex::new(vec![0x1000_0010, 0x0000_0040]);
        assert_eq!(index.entry(0).unwrap(), 0x10);
        assert_eq!(index.flags(0).unwrap(), 1);
        assert_eq!(index.byte_offset(1).unwrap(), 0x80);
    }

    #[test]
    fn test_frame_index_range() {
        let index = FrameIndex::new(vec![6, 20]);
        let err = index.byte_offset(2).unwrap_err();
        assert!(matches!(err, Error::Range { index: 2, len: 2, .. }), "got {err}");
    }

    #[test]
    fn test_frame_index_size_mismatch() {
        assert!(FrameIndex::from_bytes(&[0u8; 12], 4).is_err());
        assert_eq!(FrameIndex::from_bytes(&[0u8; 16], 4).unwrap().len(), 4);
    }

    #[test]
    fn test_loop_table_with_names() {
        let linh = [2, 0, 0, 0, 0, 0];
        let lind = [0, 0, 4, 0, 5, 0, 9, 0];
        let mut table = LoopTable::from_records(&linh, &lind).unwrap();

        let lnhd = [2, 0];
        let lnof = [0, 0, 0, 0, 6, 0, 0, 0];
        let lntx = b"intro\0idle\0";
        table
            .set_names(parse_loop_names(&lnhd, &lnof, lntx).unwrap())
            .unwrap();

        assert_eq!(table.bounds(1).unwrap(), (5, 9));
        assert_eq!(table.name(0).unwrap(), "intro");
        assert_eq!(table.find("idle"), Some(1));
        assert_eq!(table.get(1).unwrap().frame_count(), 5);
        table.validate(10).unwrap();
        assert!(table.validate(9).is_err());
        assert!(table.bounds(2).is_err());
    }

    #[test]
    fn test_loop_names_must_match_count() {
        let mut table = LoopTable::from_records(&[1, 0, 0, 0, 0, 0], &[0, 0, 1, 0]).unwrap();
        assert!(table.set_names(vec![]).is_err());
    }

    #[test]
    fn test_unterminated_loop_name() {
        let err = parse_loop_names(&[1, 0], &[0, 0, 0, 0], b"idle").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_codebook_info() {
        let cinh = [1, 0, 0, 0, 0, 0, 0, 0];
        let cind = [3, 0, 0x10, 0x20, 0, 0];
        let infos = parse_codebook_info(&cinh, &cind).unwrap();
        assert_eq!(infos, vec![CodebookInfo { frame: 3, size: 0x2010 }]);
    }

    #[test]
    fn test_chunk_limits_table_wins() {
        let mut mfct = Vec::new();
        mfct.extend_from_slice(b"VPTR");
        mfct.extend_from_slice(&100u32.to_le_bytes());
        let mut limits = ChunkLimits::from_records(&1u32.to_le_bytes(), &mfct).unwrap();
        limits.set_default(Tag::VPTR, 4000);
        limits.set_default(Tag::CBFZ, 500);
        assert_eq!(limits.get(Tag::VPTR), Some(100));
        assert_eq!(limits.get(Tag::CBFZ), Some(500));
        assert_eq!(limits.get(Tag::ZBUF), None);
    }
}
