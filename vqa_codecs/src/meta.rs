//! Per-frame metadata carried alongside the video: camera, lights, depth
//! buffer and screen effects.
//!
//! Each structure implements [`FrameMeta`] and is filled in place from the
//! latest buffered blob of its kind.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use vqa_core::{Error, FrameMeta, Result, Tag};

use crate::lcw;

fn short(what: &str, have: usize, need: usize) -> Error {
    Error::decode(format!("{} blob of {} bytes, expected {}", what, have, need))
}

fn read_f32s<const N: usize>(cur: &mut Cursor<&[u8]>) -> Result<[f32; N]> {
    let mut out = [0f32; N];
    cur.read_f32_into::<LittleEndian>(&mut out)?;
    Ok(out)
}

// ── VIEW ───────────────────────────────────────────────────────────────────

pub const VIEW_SIZE: usize = 56;

/// Camera parameters for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewParams {
    pub frame: u32,
    /// Row-major 3×4 camera matrix: rotation in columns 0..3, translation in
    /// column 3.
    pub matrix: [[f32; 4]; 3],
    /// Horizontal field of view in radians.
    pub fov_x: f32,
}

impl ViewParams {
    /// World-space camera position, `-Rᵀ t`.
    pub fn camera_position(&self) -> [f32; 3] {
        let m = &self.matrix;
        let mut pos = [0f32; 3];
        for (i, p) in pos.iter_mut().enumerate() {
            *p = -(m[0][i] * m[0][3] + m[1][i] * m[1][3] + m[2][i] * m[2][3]);
        }
        pos
    }
}

impl FrameMeta for ViewParams {
    const TAG: Tag = Tag::VIEW;
    const NAME: &'static str = "view";

    fn decode_into(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() != VIEW_SIZE {
            return Err(short(Self::NAME, blob.len(), VIEW_SIZE));
        }
        let mut cur = Cursor::new(blob);
        let frame = cur.read_u32::<LittleEndian>()?;
        let mut matrix = [[0f32; 4]; 3];
        for row in &mut matrix {
            *row = read_f32s::<4>(&mut cur)?;
        }
        let fov_x = cur.read_f32::<LittleEndian>()?;
        *self = Self {
            frame,
            matrix,
            fov_x,
        };
        Ok(())
    }
}

// ── LITE ───────────────────────────────────────────────────────────────────

pub const LIGHT_RECORD_SIZE: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Spot,
    Directional,
    Ambient,
}

impl TryFrom<u32> for LightKind {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(LightKind::Point),
            2 => Ok(LightKind::Spot),
            3 => Ok(LightKind::Directional),
            4 => Ok(LightKind::Ambient),
            other => Err(Error::decode(format!("unknown light kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: [f32; 3],
    pub position: [f32; 3],
    pub falloff_start: f32,
    pub falloff_end: f32,
    pub angle_start: f32,
    pub angle_end: f32,
}

/// Scene lights for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lights {
    pub lights: Vec<Light>,
}

impl FrameMeta for Lights {
    const TAG: Tag = Tag::LITE;
    const NAME: &'static str = "lights";

    fn decode_into(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() < 4 {
            return Err(short(Self::NAME, blob.len(), 4));
        }
        let mut cur = Cursor::new(blob);
        let count = cur.read_u32::<LittleEndian>()? as usize;
        let need = count
            .checked_mul(LIGHT_RECORD_SIZE)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::decode(format!("light count {} overflows", count)))?;
        if blob.len() != need {
            return Err(short(Self::NAME, blob.len(), need));
        }

        let mut lights = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = LightKind::try_from(cur.read_u32::<LittleEndian>()?)?;
            let color = read_f32s::<3>(&mut cur)?;
            let position = read_f32s::<3>(&mut cur)?;
            let [falloff_start, falloff_end, angle_start, angle_end] = read_f32s::<4>(&mut cur)?;
            lights.push(Light {
                kind,
                color,
                position,
                falloff_start,
                falloff_end,
                angle_start,
                angle_end,
            });
        }
        self.lights = lights;
        Ok(())
    }
}

// ── ZBUF ───────────────────────────────────────────────────────────────────

pub const DEPTH_HEADER_SIZE: usize = 16;

/// Per-pixel depth, updated either wholesale or by run-length patches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthBuffer {
    pub width: u32,
    pub height: u32,
    pub depths: Vec<u16>,
}

impl DepthBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depths: vec![0; width as usize * height as usize],
        }
    }

    /// Dimensions declared by a `ZBUF` blob, without decoding it.
    pub fn peek_dimensions(blob: &[u8]) -> Result<(u32, u32)> {
        if blob.len() < DEPTH_HEADER_SIZE {
            return Err(short(Self::NAME, blob.len(), DEPTH_HEADER_SIZE));
        }
        let mut cur = Cursor::new(blob);
        Ok((cur.read_u32::<LittleEndian>()?, cur.read_u32::<LittleEndian>()?))
    }
}

/// Walk a partial depth update, writing into `depths` only when `write`.
fn walk_partial(words: &[u16], depths: &mut [u16], write: bool) -> Result<()> {
    let len = depths.len();
    let overrun = |at: usize, n: usize| {
        Error::decode(format!(
            "depth update writes {}..{} past {} values",
            at,
            at + n,
            len
        ))
    };
    let mut words = words.iter().copied();
    let mut at = 0usize;
    while let Some(count) = words.next() {
        if count & 0x8000 != 0 {
            let n = (count & 0x7FFF) as usize;
            if at + n > len {
                return Err(overrun(at, n));
            }
            for i in 0..n {
                let v = words
                    .next()
                    .ok_or_else(|| Error::decode("depth update ends inside a literal run"))?;
                // 0 keeps the previous depth
                if write && v != 0 {
                    depths[at + i] = v;
                }
            }
            at += n;
        } else {
            let n = count as usize;
            let v = words
                .next()
                .ok_or_else(|| Error::decode("depth update ends before a run value"))?;
            if at + n > len {
                return Err(overrun(at, n));
            }
            if write && v != 0 {
                depths[at..at + n].fill(v);
            }
            at += n;
        }
    }
    Ok(())
}

impl FrameMeta for DepthBuffer {
    const TAG: Tag = Tag::ZBUF;
    const NAME: &'static str = "depth buffer";

    fn decode_into(&mut self, blob: &[u8]) -> Result<()> {
        let (width, height) = Self::peek_dimensions(blob)?;
        let mut cur = Cursor::new(&blob[8..DEPTH_HEADER_SIZE]);
        let complete = cur.read_u32::<LittleEndian>()? != 0;
        let body = &blob[DEPTH_HEADER_SIZE..];
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .filter(|&n| n.checked_mul(2).is_some())
            .ok_or_else(|| {
                Error::decode(format!("depth buffer of {}x{} is too large", width, height))
            })?;

        if complete {
            if pixels * 2 > lcw::max_output_len(body.len()) {
                return Err(Error::decode(format!(
                    "{} compressed bytes cannot hold a {}x{} depth buffer",
                    body.len(),
                    width,
                    height
                )));
            }
            let mut staging = vec![0u8; pixels * 2];
            lcw::decompress(body, &mut staging)?;
            let mut depths = vec![0u16; pixels];
            Cursor::new(&staging[..]).read_u16_into::<LittleEndian>(&mut depths)?;
            *self = Self {
                width,
                height,
                depths,
            };
            return Ok(());
        }

        if (width, height) != (self.width, self.height) || self.depths.len() != pixels {
            return Err(Error::decode(format!(
                "partial depth update for {}x{} applied to a {}x{} buffer",
                width, height, self.width, self.height
            )));
        }
        if body.len() % 2 != 0 {
            return Err(Error::decode("partial depth update has an odd byte count"));
        }
        let mut words = vec![0u16; body.len() / 2];
        Cursor::new(body).read_u16_into::<LittleEndian>(&mut words)?;
        walk_partial(&words, &mut self.depths, false)?;
        walk_partial(&words, &mut self.depths, true)
    }
}

// ── AESC ───────────────────────────────────────────────────────────────────

pub const EFFECT_PALETTE_SIZE: usize = 16;
pub const EFFECT_HEADER_SIZE: usize = EFFECT_PALETTE_SIZE * 3 + 6 * 2;

/// One palettized overlay composited over the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenEffect {
    pub palette: [[u8; 3]; EFFECT_PALETTE_SIZE],
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub z: u16,
    /// Palette indices, `width * height`, row-major.
    pub pixels: Vec<u8>,
}

/// Screen effects active for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenEffects {
    pub effects: Vec<ScreenEffect>,
}

/// Expand nibble RLE into exactly `need` indices; one trailing pad nibble is
/// tolerated.
fn unpack_nibbles(data: &[u8], need: usize) -> Result<Vec<u8>> {
    // A run byte pair yields at most 256 nibbles.
    let mut out = Vec::with_capacity((need + 1).min(data.len().saturating_mul(128)));
    let push = |out: &mut Vec<u8>, byte: u8| -> Result<()> {
        if out.len() + 2 > need + 1 {
            return Err(Error::decode(format!(
                "screen effect data overruns {} pixels",
                need
            )));
        }
        out.push(byte & 0x0F);
        out.push(byte >> 4);
        Ok(())
    };
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        i += 1;
        if b & 0x80 != 0 {
            let v = *data
                .get(i)
                .ok_or_else(|| Error::decode("screen effect run without a value"))?;
            i += 1;
            for _ in 0..=(b & 0x7F) {
                push(&mut out, v)?;
            }
        } else {
            let n = b as usize + 1;
            let lits = data
                .get(i..i + n)
                .ok_or_else(|| Error::decode("screen effect literals cut short"))?;
            i += n;
            for &v in lits {
                push(&mut out, v)?;
            }
        }
    }
    if out.len() < need {
        return Err(Error::decode(format!(
            "screen effect data produced {} pixels, expected {}",
            out.len(),
            need
        )));
    }
    out.truncate(need);
    Ok(out)
}

impl FrameMeta for ScreenEffects {
    const TAG: Tag = Tag::AESC;
    const NAME: &'static str = "screen effects";

    fn decode_into(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() < 4 {
            return Err(short(Self::NAME, blob.len(), 4));
        }
        let mut cur = Cursor::new(blob);
        let count = cur.read_u32::<LittleEndian>()? as usize;
        let mut effects = Vec::with_capacity(count.min(blob.len() / EFFECT_HEADER_SIZE));
        for n in 0..count {
            let at = cur.position() as usize;
            if blob.len() - at < EFFECT_HEADER_SIZE {
                return Err(Error::decode(format!(
                    "screen effect {} header cut short at byte {}",
                    n, at
                )));
            }
            let mut palette = [[0u8; 3]; EFFECT_PALETTE_SIZE];
            for rgb in &mut palette {
                cur.read_exact(rgb)?;
            }
            let x = cur.read_u16::<LittleEndian>()?;
            let y = cur.read_u16::<LittleEndian>()?;
            let width = cur.read_u16::<LittleEndian>()?;
            let height = cur.read_u16::<LittleEndian>()?;
            let z = cur.read_u16::<LittleEndian>()?;
            let data_size = cur.read_u16::<LittleEndian>()? as usize;
            let start = cur.position() as usize;
            let data = blob.get(start..start + data_size).ok_or_else(|| {
                Error::decode(format!("screen effect {} data cut short", n))
            })?;
            cur.set_position((start + data_size) as u64);
            let pixels = unpack_nibbles(data, width as usize * height as usize)?;
            effects.push(ScreenEffect {
                palette,
                x,
                y,
                width,
                height,
                z,
                pixels,
            });
        }
        if cur.position() as usize != blob.len() {
            return Err(Error::decode(format!(
                "{} trailing bytes after screen effects",
                blob.len() - cur.position() as usize
            )));
        }
        self.effects = effects;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_f32s(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn depth_blob(w: u32, h: u32, complete: bool, body: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        for v in [w, h, complete as u32, 0] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        blob.extend_from_slice(body);
        blob
    }

    fn words(ws: &[u16]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_view_camera_position() {
        let mut blob = 7u32.to_le_bytes().to_vec();
        // identity rotation, translation (1, 2, 3)
        blob.extend(le_f32s(&[
            1.0, 0.0, 0.0, 1.0, //
            0.0, 1.0, 0.0, 2.0, //
            0.0, 0.0, 1.0, 3.0, //
            0.5,
        ]));
        let mut view = ViewParams::default();
        view.decode_into(&blob).unwrap();
        assert_eq!(view.frame, 7);
        assert_eq!(view.fov_x, 0.5);
        assert_eq!(view.camera_position(), [-1.0, -2.0, -3.0]);

        assert!(view.decode_into(&blob[..55]).is_err());
        assert_eq!(view.frame, 7);
    }

    #[test]
    fn test_lights() {
        let mut blob = 2u32.to_le_bytes().to_vec();
        for kind in [2u32, 4] {
            blob.extend_from_slice(&kind.to_le_bytes());
            blob.extend(le_f32s(&[1.0, 0.5, 0.25, 10.0, 20.0, 30.0, 1.0, 5.0, 0.1, 0.2]));
        }
        let mut lights = Lights::default();
        lights.decode_into(&blob).unwrap();
        assert_eq!(lights.lights.len(), 2);
        assert_eq!(lights.lights[0].kind, LightKind::Spot);
        assert_eq!(lights.lights[1].kind, LightKind::Ambient);
        assert_eq!(lights.lights[0].position, [10.0, 20.0, 30.0]);
        assert_eq!(lights.lights[1].angle_end, 0.2);

        let mut bad = blob.clone();
        bad[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(lights.decode_into(&bad).is_err());
        assert!(lights.decode_into(&blob[..blob.len() - 1]).is_err());
        assert_eq!(lights.lights.len(), 2);
    }

    #[test]
    fn test_depth_complete_then_partial() {
        let raw: Vec<u16> = (1..=6).collect();
        let body = lcw::compress(&words(&raw));
        let mut depth = DepthBuffer::default();
        depth.decode_into(&depth_blob(3, 2, true, &body)).unwrap();
        assert_eq!((depth.width, depth.height), (3, 2));
        assert_eq!(depth.depths, raw);

        // two literals (second keeps its value), then run of 3 × 9, then skip
        let patch = words(&[0x8002, 50, 0, 3, 9, 1, 0]);
        depth.decode_into(&depth_blob(3, 2, false, &patch)).unwrap();
        assert_eq!(depth.depths, vec![50, 2, 9, 9, 9, 6]);
    }

    #[test]
    fn test_depth_errors_keep_buffer() {
        let mut depth = DepthBuffer::new(2, 2);
        depth.depths = vec![1, 2, 3, 4];

        // literal run overruns after a valid run
        let overrun = words(&[2, 7, 0x8003, 1, 1, 1]);
        assert!(depth.decode_into(&depth_blob(2, 2, false, &overrun)).is_err());
        assert_eq!(depth.depths, vec![1, 2, 3, 4]);

        // dimensions differ from the destination
        let patch = words(&[1, 5]);
        assert!(depth.decode_into(&depth_blob(4, 1, false, &patch)).is_err());

        // complete update decompressing to the wrong size
        let body = lcw::compress(&[0u8; 6]);
        assert!(depth.decode_into(&depth_blob(2, 2, true, &body)).is_err());
        assert_eq!(depth.depths, vec![1, 2, 3, 4]);

        assert!(depth.decode_into(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_depth_oversized_dimensions_rejected() {
        let mut depth = DepthBuffer::default();
        let huge = depth_blob(u32::MAX, u32::MAX, true, &[0x80]);
        assert!(matches!(depth.decode_into(&huge), Err(Error::Decode(_))));

        // fits in memory arithmetic, but far more than the stream can expand to
        let wide = depth_blob(60_000, 60_000, true, &[0xFE, 0xFF, 0xFF, 0x00, 0x80]);
        assert!(matches!(depth.decode_into(&wide), Err(Error::Decode(_))));
        assert_eq!(depth, DepthBuffer::default());
    }

    fn effect_entry(w: u16, h: u16, data: &[u8]) -> Vec<u8> {
        let mut e = Vec::new();
        for i in 0..EFFECT_PALETTE_SIZE as u8 {
            e.extend_from_slice(&[i, i, i]);
        }
        for v in [4u16, 5, w, h, 2, data.len() as u16] {
            e.extend_from_slice(&v.to_le_bytes());
        }
        e.extend_from_slice(data);
        e
    }

    #[test]
    fn test_screen_effects() {
        // 3×3 = 9 indices: run of 2 × 0x21, then 3 literal bytes; the last
        // high nibble pads
        let data = [0x81, 0x21, 0x02, 0x43, 0x65, 0x07];
        let mut blob = 1u32.to_le_bytes().to_vec();
        blob.extend(effect_entry(3, 3, &data));

        let mut fx = ScreenEffects::default();
        fx.decode_into(&blob).unwrap();
        assert_eq!(fx.effects.len(), 1);
        let e = &fx.effects[0];
        assert_eq!((e.x, e.y, e.width, e.height, e.z), (4, 5, 3, 3, 2));
        assert_eq!(e.palette[15], [15, 15, 15]);
        assert_eq!(e.pixels, vec![1, 2, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_screen_effect_size_errors() {
        let mut fx = ScreenEffects::default();

        // 2×2 needs 4 nibbles; 3 bytes give 6
        let mut blob = 1u32.to_le_bytes().to_vec();
        blob.extend(effect_entry(2, 2, &[0x82, 0x11]));
        assert!(fx.decode_into(&blob).is_err());

        // too few
        let mut blob = 1u32.to_le_bytes().to_vec();
        blob.extend(effect_entry(2, 2, &[0x00, 0x11]));
        assert!(fx.decode_into(&blob).is_err());

        // count says two entries, only one present
        let mut blob = 2u32.to_le_bytes().to_vec();
        blob.extend(effect_entry(1, 2, &[0x00, 0x11]));
        assert!(fx.decode_into(&blob).is_err());
        assert!(fx.effects.is_empty());

        // a huge area from a two-byte stream fails without allocating it
        let mut blob = 1u32.to_le_bytes().to_vec();
        blob.extend(effect_entry(u16::MAX, u16::MAX, &[0x80, 0x11]));
        assert!(fx.decode_into(&blob).is_err());
    }
}
