use vqa_core::format::AUDIO_UNIT_SAMPLES;
use vqa_core::{Error, Result};

use crate::adpcm::AdpcmState;

/// ADPCM state plus the audio chunks read but not yet decoded.
#[derive(Default)]
pub(crate) struct AudioState {
    pub adpcm: AdpcmState,
    pending_reset: Option<AdpcmState>,
    unit: Vec<u8>,
    /// Incoming `SND2` payload; becomes `unit` once fully read.
    incoming: Vec<u8>,
    has_unit: bool,
    samples: Vec<i16>,
}

impl AudioState {
    pub fn new() -> Self {
        Self {
            unit: Vec::with_capacity(AUDIO_UNIT_SAMPLES.div_ceil(2)),
            incoming: Vec::with_capacity(AUDIO_UNIT_SAMPLES.div_ceil(2)),
            samples: Vec::with_capacity(AUDIO_UNIT_SAMPLES),
            ..Default::default()
        }
    }

    pub fn has_unit(&self) -> bool {
        self.has_unit
    }

    /// Buffer for the next `SND2` payload. Until `mark_unit` is called the
    /// previously pending unit stays pending.
    pub fn unit_buf(&mut self) -> &mut Vec<u8> {
        &mut self.incoming
    }

    /// Promote the filled `unit_buf` to the pending unit.
    pub fn mark_unit(&mut self) {
        std::mem::swap(&mut self.unit, &mut self.incoming);
        self.has_unit = true;
    }

    pub fn set_reset(&mut self, payload: &[u8]) -> Result<()> {
        self.pending_reset = Some(AdpcmState::from_reset(payload)?);
        Ok(())
    }

    pub fn discard_pending(&mut self) {
        self.has_unit = false;
        self.pending_reset = None;
    }

    /// Decode the pending unit, applying a pending reset first.
    pub fn decode(&mut self) -> Result<&[i16]> {
        if !self.has_unit {
            return Err(Error::decode("no audio unit has been read"));
        }
        self.has_unit = false;
        if let Some(reset) = self.pending_reset.take() {
            self.adpcm = reset;
        }
        self.adpcm
            .decode(&self.unit, AUDIO_UNIT_SAMPLES, &mut self.samples)?;
        Ok(&self.samples)
    }
}
