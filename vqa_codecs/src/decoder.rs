//! Pull-based playback of a WVQA container.
//!
//! The [`Decoder`] owns the stream and all codec state. Each call moves the
//! stream forward by at most one packet:
//!
//! ```text
//! read_packet ──► codebook updates applied, VPTR / SND2 / metadata buffered
//! decode_video_frame ──► VPTR expanded into the raster
//! decode_audio_unit  ──► SND2 decoded to 735 samples
//! decode_view / decode_lights / ... ──► buffered blob parsed and freed
//! ```
//!
//! A frame-local error (see [`Error::is_frame_local`]) leaves the raster,
//! codebook, audio state and metadata as they were and repositions the
//! stream at the next frame, so playback can simply continue.

use std::io::{Read, Seek};

use tracing::{debug, trace, warn};
use vqa_core::format::{ChunkKind, AUDIO_RESET_SIZE, SKIP_METADATA, SKIP_NONE, SKIP_VIDEO};
use vqa_core::{
    ChunkHeader, CodebookInfo, Error, FrameMeta, LoopTable, Reader, ReaderOptions, Result, Tag,
    VqaHeader,
};

use crate::adpcm::AdpcmState;
use crate::audio::AudioState;
use crate::block::{Codebook, Raster};
use crate::meta::{DepthBuffer, Lights, ScreenEffects, ViewParams};
use crate::video::VideoState;

/// What one [`Decoder::read_packet`] call took in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketSummary {
    /// Frame the packet belongs to.
    pub frame: usize,
    /// A video frame was read and its block pointers are pending.
    pub video: bool,
    /// Codebook blocks replaced by this packet.
    pub codebook_blocks: usize,
    pub audio_unit: bool,
    pub audio_reset: bool,
    pub view: bool,
    pub lights: bool,
    pub depth_buffer: bool,
    pub screen_effects: bool,
    /// Chunks seeked past because of the skip mask or an unknown tag.
    pub skipped: usize,
}

/// Latest undecoded blob of each metadata kind.
#[derive(Default)]
struct MetaSlots {
    slots: [Option<Vec<u8>>; 4],
}

impl MetaSlots {
    fn index(tag: Tag) -> Option<usize> {
        match tag {
            Tag::VIEW => Some(0),
            Tag::LITE => Some(1),
            Tag::ZBUF => Some(2),
            Tag::AESC => Some(3),
            _ => None,
        }
    }

    fn take(&mut self, tag: Tag) -> Option<Vec<u8>> {
        Self::index(tag).and_then(|i| self.slots[i].take())
    }

    /// Store `blob` for `tag`, handing back the blob it replaces.
    fn replace(&mut self, tag: Tag, blob: Vec<u8>) -> Option<Vec<u8>> {
        Self::index(tag).and_then(|i| self.slots[i].replace(blob))
    }
}

pub struct Decoder<R> {
    reader: Reader<R>,
    video: VideoState,
    audio: AudioState,
    meta: MetaSlots,
    /// Scratch buffer for `VQFR` payloads.
    frame_buf: Vec<u8>,
    /// Incoming metadata blob; swapped into `meta` once fully read.
    meta_buf: Vec<u8>,
    next_frame: usize,
}

impl<R: Read + Seek> Decoder<R> {
    /// Open a container and position it at frame 0.
    pub fn open(stream: R) -> Result<Self> {
        Self::open_with(stream, ReaderOptions::default())
    }

    pub fn open_with(stream: R, options: ReaderOptions) -> Result<Self> {
        let mut reader = Reader::open_with(stream, options)?;
        reader.seek_to_frame(0)?;
        let header = reader.header();
        Ok(Self {
            video: VideoState::new(header),
            audio: AudioState::new(),
            meta: MetaSlots::default(),
            frame_buf: Vec::new(),
            meta_buf: Vec::new(),
            next_frame: 0,
            reader,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn header(&self) -> &VqaHeader {
        self.reader.header()
    }

    pub fn frame_count(&self) -> usize {
        self.reader.frame_count()
    }

    /// Nominal playback rate in frames per second.
    pub fn frame_rate(&self) -> u32 {
        self.reader.header().frame_rate as u32
    }

    pub fn loops(&self) -> &LoopTable {
        self.reader.loops()
    }

    pub fn loop_bounds(&self, index: usize) -> Result<(u16, u16)> {
        self.reader.loops().bounds(index)
    }

    pub fn codebook_info(&self) -> &[CodebookInfo] {
        self.reader.codebook_info()
    }

    /// Frame whose packet the next read will consume.
    pub fn next_frame(&self) -> usize {
        self.next_frame
    }

    pub fn raster(&self) -> &Raster {
        &self.video.raster
    }

    pub fn codebook(&self) -> &Codebook {
        &self.video.codebook
    }

    /// ADPCM predictor and step index after the last decoded unit.
    pub fn audio_state(&self) -> AdpcmState {
        self.audio.adpcm
    }

    pub fn reader(&self) -> &Reader<R> {
        &self.reader
    }

    // ── Seeking ────────────────────────────────────────────────────────────

    /// Jump to the packet of `frame`.
    ///
    /// Buffered video and audio are dropped. Codebook and ADPCM state carry
    /// over untouched; the container is expected to restore them at seek
    /// targets such as loop starts.
    pub fn seek_to_frame(&mut self, frame: usize) -> Result<()> {
        self.reader.seek_to_frame(frame)?;
        debug!(frame, "seek");
        self.next_frame = frame;
        self.video.discard_pending();
        self.audio.discard_pending();
        Ok(())
    }

    /// Jump to the first frame of loop `index`; returns its inclusive bounds.
    pub fn seek_to_loop(&mut self, index: usize) -> Result<(u16, u16)> {
        let (begin, end) = self.reader.loops().bounds(index)?;
        self.seek_to_frame(begin as usize)?;
        Ok((begin, end))
    }

    // ── Packets ────────────────────────────────────────────────────────────

    /// Read the next packet, up to and including its video frame.
    ///
    /// `skip` is a mask of `SKIP_VIDEO`, `SKIP_AUDIO` and `SKIP_METADATA`;
    /// skipped chunks are seeked past unread. Codebook updates are applied
    /// here; block pointers, audio and metadata are buffered for the
    /// `decode_*` calls.
    pub fn read_packet(&mut self, skip: u32) -> Result<PacketSummary> {
        let frame = self.next_frame;
        let mut summary = PacketSummary {
            frame,
            ..Default::default()
        };
        match self.read_packet_chunks(skip, &mut summary) {
            Ok(()) => Ok(summary),
            Err(e) if e.is_frame_local() => {
                warn!(frame, error = %e, "dropping packet");
                self.resync(frame + 1)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn read_packet_chunks(&mut self, skip: u32, summary: &mut PacketSummary) -> Result<()> {
        let mut chunks = 0usize;
        loop {
            let Some(chd) = self.reader.next_chunk()? else {
                if chunks == 0 {
                    return Err(Error::EndOfStream);
                }
                // Trailing packet with no video frame.
                return Ok(());
            };
            chunks += 1;

            let kind = ChunkKind::from(chd.tag);
            if skip & kind.skip_bit() != 0 {
                trace!(tag = %chd.tag, "skipped by mask");
                self.reader.skip_payload(&chd)?;
                summary.skipped += 1;
                if kind == ChunkKind::VideoFrame {
                    self.next_frame += 1;
                    return Ok(());
                }
                continue;
            }

            match kind {
                ChunkKind::VideoFrame => {
                    let mut buf = std::mem::take(&mut self.frame_buf);
                    let loaded = self.read_video_frame(&chd, &mut buf);
                    self.frame_buf = buf;
                    summary.codebook_blocks = loaded?;
                    summary.video = true;
                    self.next_frame += 1;
                    return Ok(());
                }
                ChunkKind::AudioUnit => {
                    if !self.header().has_audio() {
                        warn!("audio unit in a container without audio");
                        self.reader.skip_payload(&chd)?;
                        summary.skipped += 1;
                        continue;
                    }
                    self.reader.read_payload(&chd, self.audio.unit_buf())?;
                    self.audio.mark_unit();
                    summary.audio_unit = true;
                }
                ChunkKind::AudioReset => {
                    let mut payload = Vec::with_capacity(AUDIO_RESET_SIZE);
                    self.reader.read_payload(&chd, &mut payload)?;
                    self.audio.set_reset(&payload)?;
                    summary.audio_reset = true;
                }
                ChunkKind::View
                | ChunkKind::Lights
                | ChunkKind::DepthBuffer
                | ChunkKind::ScreenEffects => {
                    // A failed read leaves the previous blob in place.
                    self.reader.read_payload(&chd, &mut self.meta_buf)?;
                    let blob = std::mem::take(&mut self.meta_buf);
                    self.meta_buf = self.meta.replace(chd.tag, blob).unwrap_or_default();
                    match kind {
                        ChunkKind::View => summary.view = true,
                        ChunkKind::Lights => summary.lights = true,
                        ChunkKind::DepthBuffer => summary.depth_buffer = true,
                        _ => summary.screen_effects = true,
                    }
                }
                ChunkKind::CodebookFull | ChunkKind::CodebookPartial | ChunkKind::BlockPointers => {
                    warn!(tag = %chd.tag, "skipping video sub-chunk outside a video frame");
                    self.reader.skip_payload(&chd)?;
                    summary.skipped += 1;
                }
                ChunkKind::Unknown(tag) => {
                    warn!(tag = %tag, size = chd.size, "skipping unknown chunk");
                    self.reader.skip_payload(&chd)?;
                    summary.skipped += 1;
                }
            }
        }
    }

    fn read_video_frame(&mut self, chd: &ChunkHeader, buf: &mut Vec<u8>) -> Result<usize> {
        self.reader.read_payload(chd, buf)?;
        let reader = &self.reader;
        self.video.load_frame(buf, |tag| reader.limit_for(tag))
    }

    /// Put the stream at the start of `frame`, or at the end if there is no
    /// such frame.
    fn resync(&mut self, frame: usize) -> Result<()> {
        self.next_frame = frame;
        if frame < self.frame_count() {
            self.reader.seek_to_frame(frame)
        } else {
            self.reader.seek_to_end()
        }
    }

    // ── Video ──────────────────────────────────────────────────────────────

    /// Expand the pending block pointers into the raster.
    pub fn decode_video_frame(&mut self) -> Result<&Raster> {
        if let Err(e) = self.video.expand() {
            warn!(frame = self.next_frame.saturating_sub(1), error = %e, "video frame dropped");
            return Err(e);
        }
        Ok(&self.video.raster)
    }

    /// Read the next packet and decode its video frame.
    ///
    /// Audio and metadata in the packet stay buffered for the matching
    /// `decode_*` calls.
    pub fn decode_next_video_frame(&mut self) -> Result<&Raster> {
        if self.next_frame >= self.frame_count() {
            return Err(Error::EndOfStream);
        }
        let summary = self.read_packet(SKIP_NONE)?;
        if !summary.video {
            return Err(Error::EndOfStream);
        }
        self.decode_video_frame()
    }

    // ── Audio ──────────────────────────────────────────────────────────────

    /// Decode the pending audio unit.
    pub fn decode_audio_unit(&mut self) -> Result<&[i16]> {
        match self.audio.decode() {
            Ok(samples) => Ok(samples),
            Err(e) => {
                warn!(error = %e, "audio unit dropped");
                Err(e)
            }
        }
    }

    /// Decode the pending audio unit, or read packets (skipping video and
    /// metadata) until one arrives.
    pub fn decode_next_audio_unit(&mut self) -> Result<&[i16]> {
        if !self.header().has_audio() {
            return Err(Error::decode("container has no audio track"));
        }
        while !self.audio.has_unit() {
            self.read_packet(SKIP_VIDEO | SKIP_METADATA)?;
        }
        self.decode_audio_unit()
    }

    // ── Metadata ───────────────────────────────────────────────────────────

    pub fn decode_view(&mut self, dest: &mut ViewParams) -> Result<bool> {
        self.decode_meta(dest, |_| Ok(()))
    }

    pub fn decode_lights(&mut self, dest: &mut Lights) -> Result<bool> {
        self.decode_meta(dest, |_| Ok(()))
    }

    /// Parse the pending depth update into `dest`; its dimensions must match
    /// the video.
    pub fn decode_depth_buffer(&mut self, dest: &mut DepthBuffer) -> Result<bool> {
        let expected = (self.header().width as u32, self.header().height as u32);
        self.decode_meta(dest, |blob| {
            let dims = DepthBuffer::peek_dimensions(blob)?;
            if dims != expected {
                return Err(Error::decode(format!(
                    "depth buffer is {}x{}, video is {}x{}",
                    dims.0, dims.1, expected.0, expected.1
                )));
            }
            Ok(())
        })
    }

    pub fn decode_screen_effects(&mut self, dest: &mut ScreenEffects) -> Result<bool> {
        self.decode_meta(dest, |_| Ok(()))
    }

    /// Take the buffered blob for `M`, check it, and parse it into `dest`.
    fn decode_meta<M: FrameMeta>(
        &mut self,
        dest: &mut M,
        check: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<bool> {
        let Some(blob) = self.meta.take(M::TAG) else {
            return Ok(false);
        };
        check(&blob)
            .and_then(|()| dest.decode_into(&blob))
            .map(|()| true)
            .inspect_err(|e| warn!(kind = M::NAME, error = %e, "metadata dropped"))
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}
