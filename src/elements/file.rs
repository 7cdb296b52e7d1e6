//! File-backed source and sink stages.

use crate::element::{Progress, Stage, StageCommand, StageIo, StageType};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

const CHUNK: usize = 4096;

/// Reads a file and streams its bytes downstream.
///
/// The path can be set at construction or later through
/// [`StageCommand::SetLocation`]; setting it mid-stream switches to the
/// new file at the next process step. An optional container header is
/// emitted once, before any payload bytes.
pub struct FileSrc {
    path: Option<PathBuf>,
    file: Option<File>,
    header: Option<Vec<u8>>,
    header_sent: bool,
    buf: Box<[u8]>,
}

impl FileSrc {
    /// Source for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: None,
            header: None,
            header_sent: false,
            buf: vec![0u8; CHUNK].into_boxed_slice(),
        }
    }

    /// Source with no location yet.
    ///
    /// The stage idles until a path arrives via
    /// [`StageCommand::SetLocation`], then opens it and starts
    /// streaming.
    pub fn unlocated() -> Self {
        Self {
            path: None,
            file: None,
            header: None,
            header_sent: false,
            buf: vec![0u8; CHUNK].into_boxed_slice(),
        }
    }

    /// Emit `header` once before the payload bytes.
    pub fn with_header(mut self, header: Vec<u8>) -> Self {
        self.header = Some(header);
        self
    }

    fn open(&mut self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Stage("file source has no location".into()))?;
        self.file = Some(File::open(path)?);
        Ok(())
    }
}

impl Stage for FileSrc {
    fn stage_type(&self) -> StageType {
        StageType::Source
    }

    fn init(&mut self) -> Result<()> {
        // The location may still be on its way via SetLocation;
        // open lazily in that case.
        match self.path {
            Some(_) => self.open(),
            None => Ok(()),
        }
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if self.file.is_none() {
            match self.path {
                Some(_) => self.open()?,
                None => return Ok(Progress::Idle),
            }
        }
        if !self.header_sent {
            if let Some(header) = self.header.take() {
                io.write_all(&header)?;
            }
            self.header_sent = true;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Stage("file source has no open file".into()));
        };
        let n = file.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        io.write_all(&self.buf[..n])?;
        Ok(Progress::Continue)
    }

    fn deinit(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn handle_command(&mut self, command: StageCommand) -> Result<()> {
        match command {
            StageCommand::SetLocation(path) => {
                self.path = Some(PathBuf::from(path));
                // Switch immediately if already streaming.
                if self.file.is_some() {
                    self.open()?;
                }
                Ok(())
            }
            _ => Err(Error::UnsupportedCommand(
                "file source only handles SetLocation",
            )),
        }
    }

    fn name(&self) -> &str {
        "file_src"
    }
}

/// Writes everything it receives into a file.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    buf: Box<[u8]>,
}

impl FileSink {
    /// Sink writing to the file at `path` (created or truncated).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            buf: vec![0u8; CHUNK].into_boxed_slice(),
        }
    }
}

impl Stage for FileSink {
    fn stage_type(&self) -> StageType {
        StageType::Sink
    }

    fn init(&mut self) -> Result<()> {
        self.file = Some(File::create(&self.path)?);
        Ok(())
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let n = io.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Stage("file sink has no open file".into()));
        };
        file.write_all(&self.buf[..n])?;
        Ok(Progress::Continue)
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn handle_command(&mut self, command: StageCommand) -> Result<()> {
        match command {
            StageCommand::SetLocation(path) => {
                self.path = PathBuf::from(path);
                if self.file.is_some() {
                    self.init()?;
                }
                Ok(())
            }
            _ => Err(Error::UnsupportedCommand(
                "file sink only handles SetLocation",
            )),
        }
    }

    fn name(&self) -> &str {
        "file_sink"
    }
}
