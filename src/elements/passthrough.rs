//! Byte-chunk passthrough filter.

use crate::element::{Progress, Stage, StageIo, StageType};
use crate::error::Result;

const CHUNK: usize = 1024;

/// Copies input to output unchanged, one chunk per process step.
///
/// Useful as a pipeline placeholder and as the minimal filter for
/// wiring and ordering tests.
#[derive(Default)]
pub struct PassThrough {
    buf: Vec<u8>,
}

impl Stage for PassThrough {
    fn stage_type(&self) -> StageType {
        StageType::Filter
    }

    fn init(&mut self) -> Result<()> {
        self.buf.resize(CHUNK, 0);
        Ok(())
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let n = io.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        io.write_all(&self.buf[..n])?;
        Ok(Progress::Continue)
    }

    fn name(&self) -> &str {
        "pass_through"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuf::RingBuffer;

    #[test]
    fn test_copies_bytes_and_forwards_eos() {
        let input = RingBuffer::new(64);
        let output = RingBuffer::new(64);
        input.write(b"stream me", None).unwrap();
        input.mark_done();

        let mut stage = PassThrough::default();
        stage.init().unwrap();
        let mut io = StageIo::new(Some(&input), Some(&output), None);
        assert_eq!(stage.process(&mut io).unwrap(), Progress::Continue);
        assert_eq!(stage.process(&mut io).unwrap(), Progress::Done);

        let mut got = [0u8; 9];
        output.read(&mut got, None).unwrap();
        assert_eq!(&got, b"stream me");
    }
}
