use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};
use vqa_core::format::{padded, CHUNK_HEADER_SIZE};
use vqa_core::{ChunkHeader, ChunkKind, Error, Result, Tag, VqaHeader};

use crate::block::{BlockGrid, Codebook, Raster};
use crate::lcw;
use crate::vptr::{self, BlockOp};

const HEADER_LEN: usize = CHUNK_HEADER_SIZE as usize;

/// Codebook, raster and the block pointers waiting to be expanded.
pub(crate) struct VideoState {
    pub codebook: Codebook,
    pub raster: Raster,
    block_bytes: usize,
    /// Decompressed codebook updates, committed only once all validate.
    staging: Vec<u8>,
    updates: Vec<(usize, Range<usize>)>,
    vptr: Vec<u8>,
    ops: Vec<BlockOp>,
    pending: bool,
}

impl VideoState {
    pub fn new(header: &VqaHeader) -> Self {
        Self {
            codebook: Codebook::new(header.block_pixels(), header.max_blocks as usize),
            raster: Raster::new(
                header.width as usize,
                header.height as usize,
                BlockGrid::from_header(header),
            ),
            block_bytes: header.block_bytes(),
            staging: Vec::with_capacity(header.codebook_bytes()),
            updates: Vec::new(),
            vptr: Vec::with_capacity(header.max_vptr_size as usize),
            ops: Vec::new(),
            pending: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn discard_pending(&mut self) {
        self.pending = false;
    }

    /// Take in one `VQFR` payload: apply its codebook updates and buffer its
    /// block pointers. Returns the number of codebook blocks replaced.
    ///
    /// The sub-chunk layout is checked in full before anything is applied.
    pub fn load_frame(&mut self, payload: &[u8], limit: impl Fn(Tag) -> u32) -> Result<usize> {
        self.staging.clear();
        self.updates.clear();
        let mut vptr = None;
        let mut pos = 0usize;

        while pos < payload.len() {
            if vptr.is_some() {
                return Err(Error::decode(format!(
                    "{} bytes after VPTR in video frame",
                    payload.len() - pos
                )));
            }
            let head: &[u8; HEADER_LEN] = payload
                .get(pos..pos + HEADER_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::decode("video frame ends inside a sub-chunk header"))?;
            let chd = ChunkHeader::from_bytes(head);
            let start = pos + HEADER_LEN;
            let body = payload.get(start..start + chd.size as usize).ok_or_else(|| {
                Error::decode(format!(
                    "{} sub-chunk of {} bytes overruns its video frame",
                    chd.tag, chd.size
                ))
            })?;
            let max = limit(chd.tag);
            if chd.size > max {
                return Err(Error::decode(format!(
                    "{} chunk of {} bytes exceeds declared maximum {}",
                    chd.tag, chd.size, max
                )));
            }
            trace!(tag = %chd.tag, size = chd.size, "video sub-chunk");

            match ChunkKind::from(chd.tag) {
                ChunkKind::CodebookFull => self.stage_full(body)?,
                ChunkKind::CodebookPartial => self.stage_partial(body)?,
                ChunkKind::BlockPointers => vptr = Some(start..start + body.len()),
                _ => warn!(tag = %chd.tag, "skipping unknown video sub-chunk"),
            }
            pos = (start as u64 + padded(chd.size)).min(payload.len() as u64) as usize;
        }

        let vptr = vptr.ok_or_else(|| Error::decode("video frame without VPTR block pointers"))?;

        let mut replaced = 0;
        for (first, range) in &self.updates {
            self.codebook.write_blocks(*first, &self.staging[range.clone()])?;
            replaced += range.len() / self.block_bytes;
        }
        self.vptr.clear();
        self.vptr.extend_from_slice(&payload[vptr]);
        self.pending = true;
        Ok(replaced)
    }

    fn stage_full(&mut self, body: &[u8]) -> Result<()> {
        let len = self.codebook.byte_len();
        let range = self.stage(body, len)?;
        self.updates.push((0, range));
        Ok(())
    }

    fn stage_partial(&mut self, body: &[u8]) -> Result<()> {
        if body.len() < 4 {
            return Err(Error::decode(format!(
                "partial codebook update of {} bytes has no block range",
                body.len()
            )));
        }
        let first = LittleEndian::read_u16(&body[0..2]) as usize;
        let count = LittleEndian::read_u16(&body[2..4]) as usize;
        if first + count > self.codebook.capacity() {
            return Err(Error::decode(format!(
                "partial codebook update of blocks {}..{} exceeds capacity {}",
                first,
                first + count,
                self.codebook.capacity()
            )));
        }
        let range = self.stage(&body[4..], count * self.block_bytes)?;
        self.updates.push((first, range));
        Ok(())
    }

    fn stage(&mut self, compressed: &[u8], len: usize) -> Result<Range<usize>> {
        let start = self.staging.len();
        self.staging.resize(start + len, 0);
        lcw::decompress(compressed, &mut self.staging[start..])?;
        Ok(start..start + len)
    }

    /// Expand the buffered block pointers into the raster.
    ///
    /// The pointers are consumed either way; on error the raster is left as
    /// it was.
    pub fn expand(&mut self) -> Result<()> {
        if !self.pending {
            return Err(Error::decode("no video frame has been read"));
        }
        self.pending = false;
        vptr::expand(&self.vptr, &self.codebook, &mut self.raster, &mut self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> VqaHeader {
        VqaHeader {
            version: 2,
            frame_count: 1,
            width: 4,
            height: 2,
            block_w: 2,
            block_h: 2,
            max_blocks: 2,
            max_vptr_size: 16,
            max_cbfz_size: 64,
            ..Default::default()
        }
    }

    fn sub(tag: Tag, body: &[u8]) -> Vec<u8> {
        let mut v = ChunkHeader::new(tag, body.len() as u32).to_bytes().to_vec();
        v.extend_from_slice(body);
        if body.len() % 2 == 1 {
            v.push(0);
        }
        v
    }

    fn block_bytes(px: u16) -> Vec<u8> {
        [px; 4].iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    fn no_limit(_: Tag) -> u32 {
        u32::MAX
    }

    #[test]
    fn test_full_then_partial() {
        let mut v = VideoState::new(&header());
        let mut full = block_bytes(1);
        full.extend(block_bytes(2));
        let mut frame = sub(Tag::CBFZ, &lcw::compress(&full));
        // block 1 to (0,0), block 0 to (1,0)
        frame.extend(sub(Tag::VPTR, &[0x01, 0x60, 0x00, 0x60]));
        assert_eq!(v.load_frame(&frame, no_limit).unwrap(), 2);
        v.expand().unwrap();
        assert_eq!(v.raster.pixels(), &[2, 2, 1, 1, 2, 2, 1, 1]);

        let mut partial = vec![1, 0, 1, 0];
        partial.extend(lcw::compress(&block_bytes(7)));
        let mut frame = sub(Tag::CBPZ, &partial);
        frame.extend(sub(Tag::VPTR, &[0x01, 0x60]));
        assert_eq!(v.load_frame(&frame, no_limit).unwrap(), 1);
        v.expand().unwrap();
        assert_eq!(v.raster.pixels(), &[7, 7, 1, 1, 7, 7, 1, 1]);
        assert_eq!(v.codebook.block(0).unwrap(), &[1; 4]);
    }

    #[test]
    fn test_structure_errors_apply_nothing() {
        let mut v = VideoState::new(&header());
        let mut full = block_bytes(3);
        full.extend(block_bytes(3));
        let cbfz = sub(Tag::CBFZ, &lcw::compress(&full));

        // no VPTR
        assert!(v.load_frame(&cbfz, no_limit).is_err());
        // bytes after VPTR
        let mut frame = cbfz.clone();
        frame.extend(sub(Tag::VPTR, &[0, 0]));
        frame.extend(sub(Tag(*b"JUNK"), &[0, 0]));
        assert!(v.load_frame(&frame, no_limit).is_err());
        // over the VPTR limit
        let mut frame = cbfz.clone();
        frame.extend(sub(Tag::VPTR, &[0; 18]));
        assert!(v
            .load_frame(&frame, |t| if t == Tag::VPTR { 16 } else { u32::MAX })
            .is_err());
        // partial update past capacity
        let mut partial = vec![1, 0, 2, 0];
        partial.extend(lcw::compress(&full));
        let mut frame = sub(Tag::CBPZ, &partial);
        frame.extend(sub(Tag::VPTR, &[0, 0]));
        assert!(v.load_frame(&frame, no_limit).is_err());

        assert_eq!(v.codebook.block(0).unwrap(), &[0; 4]);
        assert!(!v.is_pending());
        assert!(v.expand().is_err());
    }

    #[test]
    fn test_unknown_sub_chunk_skipped() {
        let mut v = VideoState::new(&header());
        let mut frame = sub(Tag(*b"CBF0"), &[1, 2, 3]);
        frame.extend(sub(Tag::VPTR, &[0x02, 0x00]));
        assert_eq!(v.load_frame(&frame, no_limit).unwrap(), 0);
        v.expand().unwrap();
        assert_eq!(v.raster.pixels(), &[0; 8]);
    }
}
