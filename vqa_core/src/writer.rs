use std::io::{Seek, SeekFrom, Write};

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::format::{ChunkHeader, Tag, VqaHeader, CHUNK_HEADER_SIZE, FRAME_OFFSET_MASK, FRAME_OFFSET_UNIT};
use crate::index::{CodebookInfo, LoopInfo};

/// Optional descriptor chunks written between `VQHD` and `FINF`.
#[derive(Debug, Clone, Default)]
pub struct Descriptors {
    pub loops: Vec<LoopInfo>,
    pub loop_flags: u32,
    pub codebook_info: Vec<CodebookInfo>,
    /// Entries of the `MFCI` max-chunk-size table.
    pub limits: Vec<(Tag, u32)>,
}

/// Muxer for WVQA containers built from already-encoded chunk payloads.
///
/// It lays out chunks and maintains the frame-offset table; it never encodes
/// video or audio itself.
///
/// # Layout written
/// ```text
/// FORM <size placeholder> WVQA
/// VQHD [LINF] [LNIN] [CINF] [MFCI]
/// FINF <frame_count × u32 placeholder>
/// [packet 0] [packet 1] ... [packet N-1]
/// ← seek back, fill in FINF entries and the FORM size
/// ```
pub struct Writer<W: Write + Seek> {
    out: W,
    frame_count: usize,
    /// Absolute position of the FINF payload.
    finf_offset: u64,
    /// Packet offsets in FRAME_OFFSET_UNITs, one per `begin_frame`.
    offsets: Vec<u32>,
    /// Current write position (mirrors the stream cursor).
    current_offset: u64,
}

impl<W: Write + Seek> Writer<W> {
    /// Start a container: wrapper, header and descriptors.
    ///
    /// The header is written as given, unvalidated, so malformed containers
    /// can be produced on purpose.
    pub fn create(mut out: W, header: &VqaHeader, descriptors: &Descriptors) -> Result<Self> {
        let start = out.stream_position()?;
        if start != 0 {
            return Err(Error::format("writer must start at stream offset 0"));
        }
        ChunkHeader::new(Tag::FORM, 0).write_to(&mut out)?;
        out.write_all(&Tag::WVQA.0)?;

        let mut w = Self {
            out,
            frame_count: header.frame_count as usize,
            finf_offset: 0,
            offsets: Vec::with_capacity(header.frame_count as usize),
            current_offset: CHUNK_HEADER_SIZE + 4,
        };

        w.write_chunk(Tag::VQHD, &header.to_bytes())?;

        if !descriptors.loops.is_empty() {
            w.write_loops(&descriptors.loops, descriptors.loop_flags)?;
        }
        if !descriptors.codebook_info.is_empty() {
            let mut cinh = Vec::with_capacity(8);
            cinh.write_u16::<LittleEndian>(descriptors.codebook_info.len() as u16)?;
            cinh.extend_from_slice(&[0u8; 6]);
            let mut cind = Vec::new();
            for info in &descriptors.codebook_info {
                cind.write_u16::<LittleEndian>(info.frame)?;
                cind.write_u32::<LittleEndian>(info.size)?;
            }
            w.write_container(Tag::CINF, &[(Tag::CINH, &cinh), (Tag::CIND, &cind)])?;
        }
        if !descriptors.limits.is_empty() {
            let mfhd = (descriptors.limits.len() as u32).to_le_bytes();
            let mut mfct = Vec::new();
            for (tag, max) in &descriptors.limits {
                mfct.extend_from_slice(&tag.0);
                mfct.write_u32::<LittleEndian>(*max)?;
            }
            w.write_container(Tag::MFCI, &[(Tag::MFHD, &mfhd), (Tag::MFCT, &mfct)])?;
        }

        // Placeholder frame table, filled in by finish()
        let table = vec![0u8; w.frame_count * 4];
        w.finf_offset = w.current_offset + CHUNK_HEADER_SIZE;
        w.write_chunk(Tag::FINF, &table)?;

        Ok(w)
    }

    fn write_loops(&mut self, loops: &[LoopInfo], flags: u32) -> Result<()> {
        let mut linh = Vec::with_capacity(6);
        linh.write_u16::<LittleEndian>(loops.len() as u16)?;
        linh.write_u32::<LittleEndian>(flags)?;
        let mut lind = Vec::with_capacity(loops.len() * 4);
        for l in loops {
            lind.write_u16::<LittleEndian>(l.begin)?;
            lind.write_u16::<LittleEndian>(l.end)?;
        }
        self.write_container(Tag::LINF, &[(Tag::LINH, &linh), (Tag::LIND, &lind)])?;

        if loops.iter().any(|l| !l.name.is_empty()) {
            let lnhd = (loops.len() as u16).to_le_bytes();
            let mut lnof = Vec::with_capacity(loops.len() * 4);
            let mut lntx = Vec::new();
            for l in loops {
                lnof.write_u32::<LittleEndian>(lntx.len() as u32)?;
                lntx.extend_from_slice(l.name.as_bytes());
                lntx.push(0);
            }
            self.write_container(
                Tag::LNIN,
                &[(Tag::LNHD, &lnhd), (Tag::LNOF, &lnof), (Tag::LNTX, &lntx)],
            )?;
        }
        Ok(())
    }

    /// Mark the current position as the start of the next frame's packet.
    ///
    /// Returns the frame number.
    pub fn begin_frame(&mut self) -> Result<usize> {
        if self.offsets.len() == self.frame_count {
            return Err(Error::format(format!(
                "header declares {} frames; cannot begin another",
                self.frame_count
            )));
        }
        let units = self.current_offset / FRAME_OFFSET_UNIT;
        if units > FRAME_OFFSET_MASK as u64 {
            return Err(Error::format("container too large for the frame table"));
        }
        self.offsets.push(units as u32);
        Ok(self.offsets.len() - 1)
    }

    /// Write one chunk, padding its payload to an even length.
    pub fn write_chunk(&mut self, tag: Tag, payload: &[u8]) -> Result<()> {
        let chd = ChunkHeader::new(tag, payload.len() as u32);
        chd.write_to(&mut self.out)?;
        self.out.write_all(payload)?;
        if payload.len() % 2 == 1 {
            self.out.write_u8(0)?;
        }
        self.current_offset += chd.total_size();
        Ok(())
    }

    /// Write a chunk whose payload is a sequence of sub-chunks.
    pub fn write_container(&mut self, tag: Tag, subs: &[(Tag, &[u8])]) -> Result<()> {
        let mut payload = Vec::new();
        for (sub_tag, body) in subs {
            payload.extend_from_slice(&ChunkHeader::new(*sub_tag, body.len() as u32).to_bytes());
            payload.extend_from_slice(body);
            if body.len() % 2 == 1 {
                payload.push(0);
            }
        }
        self.write_chunk(tag, &payload)
    }

    /// Write a `VQFR` video frame holding `subs` (codebook updates, then `VPTR`).
    pub fn write_video_frame(&mut self, subs: &[(Tag, &[u8])]) -> Result<()> {
        self.write_container(Tag::VQFR, subs)
    }

    /// Fill in the frame table and FORM size, flush, and hand back the stream.
    pub fn finish(mut self) -> Result<W> {
        if self.offsets.len() != self.frame_count {
            return Err(Error::format(format!(
                "wrote {} frames but the header declares {}",
                self.offsets.len(),
                self.frame_count
            )));
        }

        // ── Frame table ────────────────────────────────────────────────────
        self.out.seek(SeekFrom::Start(self.finf_offset))?;
        for &units in &self.offsets {
            self.out.write_u32::<LittleEndian>(units)?;
        }

        // ── FORM size: everything after the wrapper's own header ────────────
        let form_size = self.current_offset - CHUNK_HEADER_SIZE;
        self.out.seek(SeekFrom::Start(4))?;
        self.out.write_u32::<BigEndian>(form_size as u32)?;

        self.out.seek(SeekFrom::Start(self.current_offset))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::AUDIO_SAMPLE_RATE;
    use crate::reader::Reader;

    fn header(frames: u16) -> VqaHeader {
        VqaHeader {
            version: 2,
            frame_count: frames,
            width: 8,
            height: 8,
            block_w: 4,
            block_h: 4,
            frame_rate: 15,
            max_blocks: 1,
            max_vptr_size: 16,
            freq: AUDIO_SAMPLE_RATE,
            channels: 1,
            bits: 16,
            max_cbfz_size: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_count_enforced() {
        let mut w = Writer::create(Cursor::new(Vec::new()), &header(1), &Descriptors::default()).unwrap();
        w.begin_frame().unwrap();
        assert!(w.begin_frame().is_err());

        let w = Writer::create(Cursor::new(Vec::new()), &header(2), &Descriptors::default()).unwrap();
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_offsets_point_at_packets() {
        let mut w = Writer::create(Cursor::new(Vec::new()), &header(2), &Descriptors::default()).unwrap();
        for _ in 0..2 {
            w.begin_frame().unwrap();
            w.write_chunk(Tag(*b"JUNK"), b"odd").unwrap();
        }
        let bytes = w.finish().unwrap().into_inner();
        assert_eq!(&bytes[..4], b"FORM");
        let form_size = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(form_size + 8, bytes.len());

        let r = Reader::open(Cursor::new(bytes.clone())).unwrap();
        for frame in 0..2 {
            let off = r.frame_index().byte_offset(frame).unwrap() as usize;
            assert_eq!(&bytes[off..off + 4], b"JUNK");
        }
    }
}
