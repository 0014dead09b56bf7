//! Builders for in-memory WVQA containers used by the integration suites.
#![allow(dead_code)]

use std::io::Cursor;

use vqa_codecs::lcw;
use vqa_core::format::{AUDIO_SAMPLE_RATE, AUDIO_UNIT_BYTES, KEY_BIT};
use vqa_core::{Descriptors, Tag, VqaHeader, Writer};

pub const BLOCK_PIXELS: usize = 16;

/// One top-level chunk of a packet.
pub enum Item {
    Chunk(Tag, Vec<u8>),
    Video(Vec<(Tag, Vec<u8>)>),
}

/// 8×8 frames of 4×4 blocks (a 2×2 grid), four codebook blocks, with audio.
pub fn header(frames: u16) -> VqaHeader {
    VqaHeader {
        version: 2,
        frame_count: frames,
        width: 8,
        height: 8,
        block_w: 4,
        block_h: 4,
        frame_rate: 15,
        max_blocks: 4,
        max_vptr_size: 64,
        freq: AUDIO_SAMPLE_RATE,
        channels: 1,
        bits: 16,
        max_cbfz_size: 512,
        ..Default::default()
    }
}

/// Lay out `packets` (one per frame, plus optional trailing ones) and return
/// the container bytes.
pub fn build(header: &VqaHeader, descriptors: &Descriptors, packets: &[Vec<Item>]) -> Vec<u8> {
    let mut w = Writer::create(Cursor::new(Vec::new()), header, descriptors).unwrap();
    for (i, packet) in packets.iter().enumerate() {
        if i < header.frame_count as usize {
            w.begin_frame().unwrap();
        }
        for item in packet {
            match item {
                Item::Chunk(tag, body) => w.write_chunk(*tag, body).unwrap(),
                Item::Video(subs) => {
                    let refs: Vec<(Tag, &[u8])> =
                        subs.iter().map(|(t, b)| (*t, b.as_slice())).collect();
                    w.write_video_frame(&refs).unwrap();
                }
            }
        }
    }
    w.finish().unwrap().into_inner()
}

pub fn block(pixels: [u16; BLOCK_PIXELS]) -> Vec<u8> {
    pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
}

pub fn solid(color: u16) -> Vec<u8> {
    block([color; BLOCK_PIXELS])
}

/// Left half keyed, right half `color`.
pub fn half_keyed(color: u16) -> Vec<u8> {
    let mut px = [color; BLOCK_PIXELS];
    for row in 0..4 {
        px[row * 4] = KEY_BIT;
        px[row * 4 + 1] = KEY_BIT;
    }
    block(px)
}

/// Full codebook update: `blocks` followed by zero blocks up to capacity.
pub fn cbfz(header: &VqaHeader, blocks: &[Vec<u8>]) -> (Tag, Vec<u8>) {
    let mut raw = blocks.concat();
    raw.resize(header.codebook_bytes(), 0);
    (Tag::CBFZ, lcw::compress(&raw))
}

pub fn cbpz(first: u16, blocks: &[Vec<u8>]) -> (Tag, Vec<u8>) {
    let mut body = first.to_le_bytes().to_vec();
    body.extend_from_slice(&(blocks.len() as u16).to_le_bytes());
    body.extend(lcw::compress(&blocks.concat()));
    (Tag::CBPZ, body)
}

pub fn vptr(bytes: &[u8]) -> (Tag, Vec<u8>) {
    (Tag::VPTR, bytes.to_vec())
}

pub fn words(ws: &[u16]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Block pointers that skip the whole 2×2 grid.
pub fn skip_all() -> (Tag, Vec<u8>) {
    vptr(&words(&[0x0004]))
}

/// Deterministic ADPCM payload.
pub fn snd2(seed: u8) -> Item {
    let body = (0..AUDIO_UNIT_BYTES)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    Item::Chunk(Tag::SND2, body)
}

pub fn sn2j(step_index: u16, predictor: i32) -> Item {
    let mut body = step_index.to_le_bytes().to_vec();
    body.extend_from_slice(&predictor.to_le_bytes());
    Item::Chunk(Tag::SN2J, body)
}
