//! Westwood/IMA 4-bit ADPCM.
//!
//! Nibbles are consumed low nibble first. The decoder state carries over
//! from one audio unit to the next and is only changed by decoding or by an
//! explicit reset.

use byteorder::{ByteOrder, LittleEndian};
use vqa_core::{Error, Result};

pub const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

const INDEX_TABLE: [i32; 8] = [-1, -1, -1, -1, 2, 4, 6, 8];

pub const MAX_STEP_INDEX: u16 = 88;

/// Predictor and step index carried between audio units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdpcmState {
    pub step_index: u16,
    pub predictor: i16,
}

impl AdpcmState {
    /// Build a state from a reset record, rejecting out-of-range values.
    pub fn new(step_index: u16, predictor: i32) -> Result<Self> {
        if step_index > MAX_STEP_INDEX {
            return Err(Error::decode(format!(
                "ADPCM step index {} above {}",
                step_index, MAX_STEP_INDEX
            )));
        }
        let predictor = i16::try_from(predictor).map_err(|_| {
            Error::decode(format!("ADPCM predictor {} outside 16-bit range", predictor))
        })?;
        Ok(Self {
            step_index,
            predictor,
        })
    }

    /// Parse a 6-byte reset payload: `step_index: u16`, `predictor: i32`.
    pub fn from_reset(payload: &[u8]) -> Result<Self> {
        if payload.len() != vqa_core::format::AUDIO_RESET_SIZE {
            return Err(Error::decode(format!(
                "ADPCM reset of {} bytes, expected {}",
                payload.len(),
                vqa_core::format::AUDIO_RESET_SIZE
            )));
        }
        Self::new(
            LittleEndian::read_u16(&payload[0..2]),
            LittleEndian::read_i32(&payload[2..6]),
        )
    }

    #[inline]
    fn step(&mut self, nibble: u8) -> i16 {
        let step = STEP_TABLE[self.step_index as usize];
        let code = nibble & 7;
        let mut diff = step >> 3;
        if code & 4 != 0 {
            diff += step;
        }
        if code & 2 != 0 {
            diff += step >> 1;
        }
        if code & 1 != 0 {
            diff += step >> 2;
        }
        let predictor = if nibble & 8 != 0 {
            self.predictor as i32 - diff
        } else {
            self.predictor as i32 + diff
        };
        self.predictor = predictor.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        self.step_index =
            (self.step_index as i32 + INDEX_TABLE[code as usize]).clamp(0, MAX_STEP_INDEX as i32) as u16;
        self.predictor
    }

    /// Decode `samples` samples from `input` into `out`.
    ///
    /// `input` must hold exactly `samples.div_ceil(2)` bytes; with an odd
    /// sample count the final high nibble is padding and is ignored.
    pub fn decode(&mut self, input: &[u8], samples: usize, out: &mut Vec<i16>) -> Result<()> {
        let expected = samples.div_ceil(2);
        if input.len() != expected {
            return Err(Error::decode(format!(
                "ADPCM unit of {} bytes, expected {} for {} samples",
                input.len(),
                expected,
                samples
            )));
        }
        out.clear();
        out.reserve(samples);
        for &byte in input {
            out.push(self.step(byte & 0x0F));
            if out.len() == samples {
                break;
            }
            out.push(self.step(byte >> 4));
        }
        Ok(())
    }
}
