//! Volume scaling for signed 16-bit little-endian samples.

use crate::element::{Progress, Stage, StageCommand, StageIo, StageType};
use crate::error::{Error, Result};

const CHUNK: usize = 1024;

/// Scales `i16` LE samples by a percentage (100 = unity).
///
/// The level is adjustable while streaming through
/// [`StageCommand::SetVolume`]. An odd trailing byte is held until its
/// other half arrives, so sample alignment survives arbitrary chunking.
pub struct Gain {
    volume: i32,
    carry: Option<u8>,
    buf: Vec<u8>,
}

impl Gain {
    /// Gain filter at `volume` percent.
    pub fn new(volume: i32) -> Self {
        Self {
            volume,
            carry: None,
            buf: Vec::with_capacity(CHUNK + 1),
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Stage for Gain {
    fn stage_type(&self) -> StageType {
        StageType::Filter
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let mut chunk = [0u8; CHUNK];
        let n = io.read(&mut chunk)?;
        if n == 0 {
            // A dangling byte at end-of-stream is passed through as-is.
            if let Some(byte) = self.carry.take() {
                io.write_all(&[byte])?;
            }
            return Ok(Progress::Done);
        }

        self.buf.clear();
        if let Some(byte) = self.carry.take() {
            self.buf.push(byte);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        if self.buf.len() % 2 != 0 {
            self.carry = self.buf.pop();
        }

        for sample in self.buf.chunks_exact_mut(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]) as i64;
            // Widen before multiplying: any non-negative i32 volume is
            // representable without overflow.
            let scaled =
                (value * self.volume as i64 / 100).clamp(i16::MIN as i64, i16::MAX as i64);
            sample.copy_from_slice(&(scaled as i16).to_le_bytes());
        }
        io.write_all(&self.buf)?;
        Ok(Progress::Continue)
    }

    fn handle_command(&mut self, command: StageCommand) -> Result<()> {
        match command {
            StageCommand::SetVolume(volume) if volume >= 0 => {
                self.volume = volume;
                Ok(())
            }
            StageCommand::SetVolume(_) => {
                Err(Error::Stage("volume must be non-negative".into()))
            }
            _ => Err(Error::UnsupportedCommand("gain only handles SetVolume")),
        }
    }

    fn name(&self) -> &str {
        "gain"
    }
}
