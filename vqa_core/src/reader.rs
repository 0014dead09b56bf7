use std::io::{self, Read, Seek, SeekFrom};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::format::{
    padded, ChunkHeader, Tag, VqaHeader, AUDIO_RESET_SIZE, AUDIO_UNIT_BYTES, CHUNK_HEADER_SIZE,
};
use crate::index::{
    parse_codebook_info, parse_loop_names, ChunkLimits, CodebookInfo, FrameIndex, LoopTable,
};

/// Fallback cap for chunks whose maximum size nothing declares: 16 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Knobs for [`Reader::open_with`].
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Upper bound for descriptor chunks and for packet chunks that have no
    /// declared maximum in the header or the `MFCI` table.
    pub max_chunk_size: u32,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Chunk-level reader for WVQA containers.
///
/// # Open sequence
/// 1. Check the `FORM` wrapper and the `WVQA` form type.
/// 2. Read descriptor chunks in file order: `VQHD`, `LINF`, `LNIN`, `CINF`,
///    `MFCI`; skip `CLIP` and anything unknown.
/// 3. Stop right after `FINF`, the frame-offset table. Everything after it is
///    frame data reached through the table, never by sequential scan.
///
/// Any malformed descriptor aborts the open; there is no partially open state.
///
/// # Access pattern
/// [`seek_to_frame`](Self::seek_to_frame) jumps straight to a packet. Packet
/// contents are pulled one chunk at a time with [`next_chunk`](Self::next_chunk)
/// and then either [`read_payload`](Self::read_payload) or
/// [`skip_payload`](Self::skip_payload).
pub struct Reader<R> {
    stream: R,
    header: VqaHeader,
    index: FrameIndex,
    loops: LoopTable,
    codebook_info: Vec<CodebookInfo>,
    limits: ChunkLimits,
    options: ReaderOptions,
    stream_len: u64,
}

impl<R: Read + Seek> Reader<R> {
    /// Open a container with default options.
    pub fn open(stream: R) -> Result<Self> {
        Self::open_with(stream, ReaderOptions::default())
    }

    pub fn open_with(mut stream: R, options: ReaderOptions) -> Result<Self> {
        let stream_len = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;

        // ── FORM wrapper ────────────────────────────────────────────────────
        let form = read_header_exact(&mut stream, Tag::FORM)?;
        if form.tag != Tag::FORM {
            return Err(Error::format(format!(
                "expected FORM wrapper, found {}",
                form.tag
            )));
        }
        if CHUNK_HEADER_SIZE + form.size as u64 > stream_len {
            return Err(Error::Truncated {
                tag: Tag::FORM,
                need: form.size as u64,
                have: stream_len.saturating_sub(CHUNK_HEADER_SIZE),
            });
        }
        let mut form_type = [0u8; 4];
        read_exact_or_truncated(&mut stream, &mut form_type, Tag::FORM, stream_len)?;
        if Tag(form_type) != Tag::WVQA {
            return Err(Error::format(format!(
                "expected WVQA form type, found {}",
                Tag(form_type)
            )));
        }

        // ── Descriptor chunks ───────────────────────────────────────────────
        let mut header: Option<VqaHeader> = None;
        let mut loops: Option<LoopTable> = None;
        let mut loop_names: Option<Vec<String>> = None;
        let mut codebook_info: Option<Vec<CodebookInfo>> = None;
        let mut limits: Option<ChunkLimits> = None;

        let index = loop {
            let chd = read_header_exact(&mut stream, Tag::FINF).map_err(|e| match e {
                Error::Truncated { .. } => {
                    Error::format("end of container before the FINF frame table")
                }
                other => other,
            })?;
            let pos = stream.stream_position()?;
            if pos + chd.size as u64 > stream_len {
                return Err(Error::Truncated {
                    tag: chd.tag,
                    need: chd.size as u64,
                    have: stream_len - pos,
                });
            }
            trace!(tag = %chd.tag, size = chd.size, "descriptor chunk");

            match chd.tag {
                Tag::VQHD => {
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    let h = VqaHeader::from_bytes(&payload)?;
                    h.validate()?;
                    set_once(&mut header, h, Tag::VQHD)?;
                }
                Tag::LINF => {
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    let subs = SubChunks::parse(Tag::LINF, &payload)?;
                    let table = LoopTable::from_records(
                        subs.require(Tag::LINH)?,
                        subs.require(Tag::LIND)?,
                    )?;
                    set_once(&mut loops, table, Tag::LINF)?;
                }
                Tag::LNIN => {
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    let subs = SubChunks::parse(Tag::LNIN, &payload)?;
                    let names = parse_loop_names(
                        subs.require(Tag::LNHD)?,
                        subs.require(Tag::LNOF)?,
                        subs.require(Tag::LNTX)?,
                    )?;
                    set_once(&mut loop_names, names, Tag::LNIN)?;
                }
                Tag::CINF => {
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    let subs = SubChunks::parse(Tag::CINF, &payload)?;
                    let infos =
                        parse_codebook_info(subs.require(Tag::CINH)?, subs.require(Tag::CIND)?)?;
                    set_once(&mut codebook_info, infos, Tag::CINF)?;
                }
                Tag::MFCI => {
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    let subs = SubChunks::parse(Tag::MFCI, &payload)?;
                    let table =
                        ChunkLimits::from_records(subs.require(Tag::MFHD)?, subs.require(Tag::MFCT)?)?;
                    set_once(&mut limits, table, Tag::MFCI)?;
                }
                Tag::FINF => {
                    let h = header
                        .as_ref()
                        .ok_or_else(|| Error::format("FINF frame table before the VQHD header"))?;
                    let payload = read_descriptor(&mut stream, &chd, &options)?;
                    break FrameIndex::from_bytes(&payload, h.frame_count as usize)?;
                }
                other => {
                    debug!(tag = %other, size = chd.size, "skipping descriptor chunk");
                    stream.seek(SeekFrom::Current(chd.padded_size() as i64))?;
                }
            }
        };

        // FINF is terminal, so the header is known to be present here.
        let header = header.ok_or_else(|| Error::format("missing VQHD header"))?;
        let frame_count = header.frame_count as usize;

        let mut loops = loops.unwrap_or_default();
        if let Some(names) = loop_names {
            loops.set_names(names)?;
        }
        loops.validate(frame_count)?;

        for frame in 0..frame_count {
            let offset = index.byte_offset(frame)?;
            if offset + CHUNK_HEADER_SIZE > stream_len {
                return Err(Error::format(format!(
                    "frame {} offset {} beyond end of stream ({} bytes)",
                    frame, offset, stream_len
                )));
            }
        }

        let mut limits = limits.unwrap_or_default();
        limits.set_default(Tag::VPTR, header.max_vptr_size as u32);
        limits.set_default(Tag::CBFZ, header.max_cbfz_size);
        // Partial updates carry a 4-byte block range ahead of the LCW stream.
        limits.set_default(Tag::CBPZ, header.max_cbfz_size.saturating_add(4));
        limits.set(Tag::SND2, AUDIO_UNIT_BYTES as u32);
        limits.set(Tag::SN2J, AUDIO_RESET_SIZE as u32);

        debug!(
            frames = header.frame_count,
            width = header.width,
            height = header.height,
            block_w = header.block_w,
            block_h = header.block_h,
            fps = header.frame_rate,
            loops = loops.len(),
            audio = header.has_audio(),
            "opened WVQA container"
        );

        Ok(Self {
            stream,
            header,
            index,
            loops,
            codebook_info: codebook_info.unwrap_or_default(),
            limits,
            options,
            stream_len,
        })
    }

    pub fn header(&self) -> &VqaHeader {
        &self.header
    }

    pub fn frame_index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn loops(&self) -> &LoopTable {
        &self.loops
    }

    pub fn codebook_info(&self) -> &[CodebookInfo] {
        &self.codebook_info
    }

    pub fn limits(&self) -> &ChunkLimits {
        &self.limits
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.header.frame_count as usize
    }

    pub fn stream_len(&self) -> u64 {
        self.stream_len
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.stream.stream_position()?)
    }

    /// Maximum accepted payload size for packet chunks tagged `tag`.
    pub fn limit_for(&self, tag: Tag) -> u32 {
        self.limits.get(tag).unwrap_or(self.options.max_chunk_size)
    }

    /// Position the stream at the packet for `frame`.
    ///
    /// Only the stream moves; no decoder state is checked or reset.
    pub fn seek_to_frame(&mut self, frame: usize) -> Result<()> {
        let offset = self.index.byte_offset(frame)?;
        self.stream.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Position the stream at its end, so the next read reports end of stream.
    pub fn seek_to_end(&mut self) -> Result<()> {
        self.stream.seek(SeekFrom::Start(self.stream_len))?;
        Ok(())
    }

    /// Read the next chunk header at the current position.
    ///
    /// Returns `None` at a clean end of stream. A header cut short, or a
    /// payload reaching past the end of the stream, is `Truncated`.
    pub fn next_chunk(&mut self) -> Result<Option<ChunkHeader>> {
        let pos = self.stream.stream_position()?;
        if pos >= self.stream_len {
            return Ok(None);
        }
        let chd = read_header_exact(&mut self.stream, Tag(*b"????"))?;
        let have = self.stream_len - (pos + CHUNK_HEADER_SIZE);
        if chd.size as u64 > have {
            return Err(Error::Truncated {
                tag: chd.tag,
                need: chd.size as u64,
                have,
            });
        }
        trace!(tag = %chd.tag, size = chd.size, offset = pos, "chunk");
        Ok(Some(chd))
    }

    /// Read the payload of `chd` into `buf`, enforcing the tag's size limit.
    ///
    /// `buf` is resized to the payload and reused across calls, so
    /// steady-state playback stops allocating once it has seen the largest
    /// chunk of its kind.
    pub fn read_payload(&mut self, chd: &ChunkHeader, buf: &mut Vec<u8>) -> Result<()> {
        let limit = self.limit_for(chd.tag);
        if chd.size > limit {
            // Keep the stream on a chunk boundary before reporting.
            self.skip_payload(chd)?;
            return Err(Error::decode(format!(
                "{} chunk of {} bytes exceeds declared maximum {}",
                chd.tag, chd.size, limit
            )));
        }
        buf.clear();
        buf.resize(chd.size as usize, 0);
        let stream_len = self.stream_len;
        read_exact_or_truncated(&mut self.stream, buf, chd.tag, stream_len)?;
        self.skip_pad(chd)
    }

    /// Seek past the payload of `chd` without reading it.
    pub fn skip_payload(&mut self, chd: &ChunkHeader) -> Result<()> {
        self.stream
            .seek(SeekFrom::Current(chd.padded_size() as i64))?;
        Ok(())
    }

    fn skip_pad(&mut self, chd: &ChunkHeader) -> Result<()> {
        if chd.size % 2 == 1 {
            self.stream.seek(SeekFrom::Current(1))?;
        }
        Ok(())
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> R {
        self.stream
    }
}

// ── helpers ────────────────────────────────────────────────────────────────

fn set_once<T>(slot: &mut Option<T>, value: T, tag: Tag) -> Result<()> {
    if slot.is_some() {
        return Err(Error::format(format!("duplicate {} chunk", tag)));
    }
    *slot = Some(value);
    Ok(())
}

fn read_header_exact<R: Read>(stream: &mut R, expected: Tag) -> Result<ChunkHeader> {
    let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Truncated {
                    tag: expected,
                    need: CHUNK_HEADER_SIZE,
                    have: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ChunkHeader::from_bytes(&buf))
}

fn read_exact_or_truncated<R: Read + Seek>(
    stream: &mut R,
    buf: &mut [u8],
    tag: Tag,
    stream_len: u64,
) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            let pos = stream.stream_position().unwrap_or(stream_len);
            Err(Error::Truncated {
                tag,
                need: buf.len() as u64,
                have: stream_len.saturating_sub(pos),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn read_descriptor<R: Read + Seek>(
    stream: &mut R,
    chd: &ChunkHeader,
    options: &ReaderOptions,
) -> Result<Vec<u8>> {
    if chd.size > options.max_chunk_size {
        return Err(Error::format(format!(
            "{} descriptor of {} bytes exceeds the {} byte limit",
            chd.tag, chd.size, options.max_chunk_size
        )));
    }
    let mut payload = vec![0u8; chd.size as usize];
    stream.read_exact(&mut payload)?;
    if chd.size % 2 == 1 {
        stream.seek(SeekFrom::Current(1))?;
    }
    Ok(payload)
}

/// Sub-chunks of a descriptor container, which must fill it exactly.
struct SubChunks<'a> {
    parent: Tag,
    chunks: Vec<(Tag, &'a [u8])>,
}

impl<'a> SubChunks<'a> {
    fn parse(parent: Tag, payload: &'a [u8]) -> Result<Self> {
        let mut chunks = Vec::new();
        let mut pos = 0usize;
        while pos < payload.len() {
            let head: &[u8; CHUNK_HEADER_SIZE as usize] = payload
                .get(pos..pos + CHUNK_HEADER_SIZE as usize)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| {
                    Error::format(format!("{} ends inside a sub-chunk header", parent))
                })?;
            let chd = ChunkHeader::from_bytes(head);
            let start = pos + CHUNK_HEADER_SIZE as usize;
            let end = start + chd.size as usize;
            let body = payload.get(start..end).ok_or_else(|| {
                Error::format(format!(
                    "{} sub-chunk {} of {} bytes overruns its container",
                    parent, chd.tag, chd.size
                ))
            })?;
            if chunks.iter().any(|(t, _)| *t == chd.tag) {
                return Err(Error::format(format!(
                    "duplicate {} sub-chunk in {}",
                    chd.tag, parent
                )));
            }
            chunks.push((chd.tag, body));
            // The final sub-chunk may omit its pad byte.
            pos = (start as u64 + padded(chd.size)).min(payload.len() as u64) as usize;
        }
        Ok(Self { parent, chunks })
    }

    fn require(&self, tag: Tag) -> Result<&'a [u8]> {
        self.chunks
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, body)| *body)
            .ok_or_else(|| Error::format(format!("{} is missing its {} sub-chunk", self.parent, tag)))
    }
}
