use std::fmt;
use std::io::{Cursor, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

// ── Tags ───────────────────────────────────────────────────────────────────

/// Four-character chunk identifier, stored big-endian on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const FORM: Tag = Tag(*b"FORM");
    pub const WVQA: Tag = Tag(*b"WVQA");

    // Descriptor chunks
    pub const VQHD: Tag = Tag(*b"VQHD");
    pub const LINF: Tag = Tag(*b"LINF");
    pub const LINH: Tag = Tag(*b"LINH");
    pub const LIND: Tag = Tag(*b"LIND");
    pub const LNIN: Tag = Tag(*b"LNIN");
    pub const LNHD: Tag = Tag(*b"LNHD");
    pub const LNOF: Tag = Tag(*b"LNOF");
    pub const LNTX: Tag = Tag(*b"LNTX");
    pub const CINF: Tag = Tag(*b"CINF");
    pub const CINH: Tag = Tag(*b"CINH");
    pub const CIND: Tag = Tag(*b"CIND");
    pub const MFCI: Tag = Tag(*b"MFCI");
    pub const MFHD: Tag = Tag(*b"MFHD");
    pub const MFCT: Tag = Tag(*b"MFCT");
    pub const CLIP: Tag = Tag(*b"CLIP");
    pub const FINF: Tag = Tag(*b"FINF");

    // Packet chunks
    pub const VQFR: Tag = Tag(*b"VQFR");
    pub const CBFZ: Tag = Tag(*b"CBFZ");
    pub const CBPZ: Tag = Tag(*b"CBPZ");
    pub const VPTR: Tag = Tag(*b"VPTR");
    pub const ZBUF: Tag = Tag(*b"ZBUF");
    pub const VIEW: Tag = Tag(*b"VIEW");
    pub const LITE: Tag = Tag(*b"LITE");
    pub const AESC: Tag = Tag(*b"AESC");
    pub const SND2: Tag = Tag(*b"SND2");
    pub const SN2J: Tag = Tag(*b"SN2J");

    pub fn from_u32(v: u32) -> Self {
        Tag(v.to_be_bytes())
    }

    pub fn as_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

// ── Packet dispatch ────────────────────────────────────────────────────────

/// What a packet-level chunk carries.
///
/// `Unknown` is part of the format contract: every chunk is length-prefixed,
/// so readers skip tags they do not understand instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    VideoFrame,
    CodebookFull,
    CodebookPartial,
    BlockPointers,
    DepthBuffer,
    View,
    Lights,
    ScreenEffects,
    AudioUnit,
    AudioReset,
    Unknown(Tag),
}

impl From<Tag> for ChunkKind {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::VQFR => ChunkKind::VideoFrame,
            Tag::CBFZ => ChunkKind::CodebookFull,
            Tag::CBPZ => ChunkKind::CodebookPartial,
            Tag::VPTR => ChunkKind::BlockPointers,
            Tag::ZBUF => ChunkKind::DepthBuffer,
            Tag::VIEW => ChunkKind::View,
            Tag::LITE => ChunkKind::Lights,
            Tag::AESC => ChunkKind::ScreenEffects,
            Tag::SND2 => ChunkKind::AudioUnit,
            Tag::SN2J => ChunkKind::AudioReset,
            other => ChunkKind::Unknown(other),
        }
    }
}

impl ChunkKind {
    /// The skip bit that suppresses this kind in `read_packet`, if any.
    pub fn skip_bit(self) -> u32 {
        match self {
            ChunkKind::VideoFrame
            | ChunkKind::CodebookFull
            | ChunkKind::CodebookPartial
            | ChunkKind::BlockPointers => SKIP_VIDEO,
            ChunkKind::DepthBuffer
            | ChunkKind::View
            | ChunkKind::Lights
            | ChunkKind::ScreenEffects => SKIP_METADATA,
            ChunkKind::AudioUnit | ChunkKind::AudioReset => SKIP_AUDIO,
            ChunkKind::Unknown(_) => 0,
        }
    }
}

/// Skip the `VQFR` video container (codebook updates and block pointers).
pub const SKIP_VIDEO: u32 = 1 << 0;
/// Skip `SND2` / `SN2J` audio chunks.
pub const SKIP_AUDIO: u32 = 1 << 1;
/// Skip view, lighting, depth-buffer and screen-effect blobs.
pub const SKIP_METADATA: u32 = 1 << 2;
pub const SKIP_NONE: u32 = 0;

// ── Constants ──────────────────────────────────────────────────────────────

/// Size of a chunk header: tag[4] + size:u32 BE.
pub const CHUNK_HEADER_SIZE: u64 = 8;

/// Frame-offset table entries count in units of this many bytes.
pub const FRAME_OFFSET_UNIT: u64 = 2;

/// Low 28 bits of a frame-offset entry are the offset; the top 4 are flags.
pub const FRAME_OFFSET_MASK: u32 = 0x0FFF_FFFF;

/// The only container version this decoder understands.
pub const SUPPORTED_VERSION: u16 = 2;

/// Fixed audio configuration of the format's audio path.
pub const AUDIO_SAMPLE_RATE: u16 = 22050;
pub const AUDIO_CHANNELS: u8 = 1;
pub const AUDIO_BITS: u8 = 16;

/// PCM samples produced by one `SND2` unit.
pub const AUDIO_UNIT_SAMPLES: usize = 735;

/// Compressed bytes in one `SND2` unit (two 4-bit codes per byte).
pub const AUDIO_UNIT_BYTES: usize = AUDIO_UNIT_SAMPLES.div_ceil(2);

/// Payload size of an `SN2J` parameter reset: step_index:u16 + predictor:i32.
pub const AUDIO_RESET_SIZE: usize = 6;

/// Bit 15 of a 16-bit pixel marks it transparent for keyed block writes.
pub const KEY_BIT: u16 = 0x8000;

/// Round a chunk size up to the even boundary chunks are padded to.
#[inline]
pub fn padded(size: u32) -> u64 {
    (size as u64 + 1) & !1
}

// ── Chunk header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub tag: Tag,
    /// Unpadded payload size.
    pub size: u32,
}

impl ChunkHeader {
    pub fn new(tag: Tag, size: u32) -> Self {
        Self { tag, size }
    }

    /// Payload size including the pad byte, if any.
    pub fn padded_size(&self) -> u64 {
        padded(self.size)
    }

    /// Header plus padded payload.
    pub fn total_size(&self) -> u64 {
        CHUNK_HEADER_SIZE + self.padded_size()
    }

    pub fn from_bytes(buf: &[u8; CHUNK_HEADER_SIZE as usize]) -> Self {
        let tag = Tag([buf[0], buf[1], buf[2], buf[3]]);
        let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Self { tag, size }
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        buf[..4].copy_from_slice(&self.tag.0);
        buf[4..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.tag.0)?;
        w.write_u32::<BigEndian>(self.size)
    }
}

// ── Header ─────────────────────────────────────────────────────────────────

/// Size of the `VQHD` record in bytes.
///   version:u16 + flags:u16 + frame_count:u16 + width:u16 + height:u16
///   + block_w:u8 + block_h:u8 + frame_rate:u8 + cb_parts:u8 + colors:u16
///   + max_blocks:u16 + offset_x:u16 + offset_y:u16 + max_vptr_size:u16
///   + freq:u16 + channels:u8 + bits:u8 + reserved0:u32 + reserved1:u16
///   + max_cbfz_size:u32 + reserved2:u32
///   = 42
pub const VQHD_SIZE: u32 = 42;

/// Decoded `VQHD` record. Immutable once the container is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VqaHeader {
    pub version: u16,
    pub flags: u16,
    pub frame_count: u16,
    pub width: u16,
    pub height: u16,
    pub block_w: u8,
    pub block_h: u8,
    pub frame_rate: u8,
    /// Number of parts a codebook is split into across frames.
    pub cb_parts: u8,
    /// Palette colors; 0 means truecolor 16-bit.
    pub colors: u16,
    /// Codebook capacity in blocks.
    pub max_blocks: u16,
    pub offset_x: u16,
    pub offset_y: u16,
    pub max_vptr_size: u16,
    pub freq: u16,
    pub channels: u8,
    pub bits: u8,
    pub reserved0: u32,
    pub reserved1: u16,
    pub max_cbfz_size: u32,
    pub reserved2: u32,
}

impl VqaHeader {
    /// Serialize to exactly `VQHD_SIZE` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VQHD_SIZE as usize);
        // Writes into a Vec cannot fail.
        let _ = self.write_record(&mut buf);
        buf
    }

    fn write_record(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.frame_count)?;
        w.write_u16::<LittleEndian>(self.width)?;
        w.write_u16::<LittleEndian>(self.height)?;
        w.write_u8(self.block_w)?;
        w.write_u8(self.block_h)?;
        w.write_u8(self.frame_rate)?;
        w.write_u8(self.cb_parts)?;
        w.write_u16::<LittleEndian>(self.colors)?;
        w.write_u16::<LittleEndian>(self.max_blocks)?;
        w.write_u16::<LittleEndian>(self.offset_x)?;
        w.write_u16::<LittleEndian>(self.offset_y)?;
        w.write_u16::<LittleEndian>(self.max_vptr_size)?;
        w.write_u16::<LittleEndian>(self.freq)?;
        w.write_u8(self.channels)?;
        w.write_u8(self.bits)?;
        w.write_u32::<LittleEndian>(self.reserved0)?;
        w.write_u16::<LittleEndian>(self.reserved1)?;
        w.write_u32::<LittleEndian>(self.max_cbfz_size)?;
        w.write_u32::<LittleEndian>(self.reserved2)
    }

    /// Deserialize a `VQHD` payload, checking its size.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != VQHD_SIZE as usize {
            return Err(Error::format(format!(
                "VQHD chunk is {} bytes, expected {}",
                buf.len(),
                VQHD_SIZE
            )));
        }
        let mut c = Cursor::new(buf);
        Ok(Self {
            version: c.read_u16::<LittleEndian>()?,
            flags: c.read_u16::<LittleEndian>()?,
            frame_count: c.read_u16::<LittleEndian>()?,
            width: c.read_u16::<LittleEndian>()?,
            height: c.read_u16::<LittleEndian>()?,
            block_w: c.read_u8()?,
            block_h: c.read_u8()?,
            frame_rate: c.read_u8()?,
            cb_parts: c.read_u8()?,
            colors: c.read_u16::<LittleEndian>()?,
            max_blocks: c.read_u16::<LittleEndian>()?,
            offset_x: c.read_u16::<LittleEndian>()?,
            offset_y: c.read_u16::<LittleEndian>()?,
            max_vptr_size: c.read_u16::<LittleEndian>()?,
            freq: c.read_u16::<LittleEndian>()?,
            channels: c.read_u8()?,
            bits: c.read_u8()?,
            reserved0: c.read_u32::<LittleEndian>()?,
            reserved1: c.read_u16::<LittleEndian>()?,
            max_cbfz_size: c.read_u32::<LittleEndian>()?,
            reserved2: c.read_u32::<LittleEndian>()?,
        })
    }

    /// Reject headers this decoder cannot play.
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(Error::format(format!(
                "unsupported VQA version {} (only version {} is supported)",
                self.version, SUPPORTED_VERSION
            )));
        }
        if self.frame_count == 0 {
            return Err(Error::format("header declares zero frames"));
        }
        if self.block_w == 0 || self.block_h == 0 {
            return Err(Error::format(format!(
                "invalid block size {}x{}",
                self.block_w, self.block_h
            )));
        }
        if self.max_blocks == 0 {
            return Err(Error::format("header declares an empty codebook"));
        }
        if self.offset_x >= self.width || self.offset_y >= self.height {
            return Err(Error::format(format!(
                "offset {}x{} outside {}x{} frame",
                self.offset_x, self.offset_y, self.width, self.height
            )));
        }
        let area_w = self.width - self.offset_x;
        let area_h = self.height - self.offset_y;
        if area_w % self.block_w as u16 != 0 || area_h % self.block_h as u16 != 0 {
            return Err(Error::format(format!(
                "{}x{} image area is not a multiple of the {}x{} block size",
                area_w, area_h, self.block_w, self.block_h
            )));
        }
        if self.colors != 0 {
            return Err(Error::format(format!(
                "paletted video ({} colors) is not supported",
                self.colors
            )));
        }
        if self.has_audio()
            && (self.freq != AUDIO_SAMPLE_RATE
                || self.channels != AUDIO_CHANNELS
                || self.bits != AUDIO_BITS)
        {
            return Err(Error::format(format!(
                "unsupported audio {} Hz / {} ch / {} bit (expected {} Hz / {} ch / {} bit)",
                self.freq,
                self.channels,
                self.bits,
                AUDIO_SAMPLE_RATE,
                AUDIO_CHANNELS,
                AUDIO_BITS
            )));
        }
        Ok(())
    }

    /// Whether the container carries an audio track.
    pub fn has_audio(&self) -> bool {
        self.channels != 0
    }

    /// Pixels per codebook block.
    pub fn block_pixels(&self) -> usize {
        self.block_w as usize * self.block_h as usize
    }

    /// Bytes per codebook block (16-bit pixels).
    pub fn block_bytes(&self) -> usize {
        self.block_pixels() * 2
    }

    /// Bytes of a fully decompressed codebook.
    pub fn codebook_bytes(&self) -> usize {
        self.max_blocks as usize * self.block_bytes()
    }

    /// Destination blocks per row.
    pub fn grid_cols(&self) -> usize {
        (self.width - self.offset_x) as usize / self.block_w as usize
    }

    /// Destination block rows.
    pub fn grid_rows(&self) -> usize {
        (self.height - self.offset_y) as usize / self.block_h as usize
    }

    /// Destination blocks per frame.
    pub fn grid_blocks(&self) -> usize {
        self.grid_cols() * self.grid_rows()
    }
}
