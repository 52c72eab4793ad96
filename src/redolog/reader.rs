//! Sequential reader for active and archived redo log files

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{RedoError, Result};
use super::op::{RedoableOp, FRAME_PREFIX_LEN, MAX_FRAME_LEN};
use super::writer::FileHeader;

enum Frame {
    Body(Vec<u8>),
    /// Clean end of file at a frame boundary
    End,
    /// File ends partway through a frame (crash during append)
    Torn,
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; FRAME_PREFIX_LEN];
    let mut filled = 0;
    while filled < FRAME_PREFIX_LEN {
        match input.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Frame::End),
            Ok(0) => return Ok(Frame::Torn),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    match input.read_exact(&mut body) {
        Ok(()) => Ok(Frame::Body(body)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Frame::Torn),
        Err(e) => Err(e),
    }
}

/// Reads a redo log file front to back.
///
/// A frame cut short at the end of the file ends the stream (the writer
/// crashed mid-append). Frames whose body does not decode are skipped.
pub struct FileLogReader {
    path: PathBuf,
    input: BufReader<File>,
    header: FileHeader,
    finished: bool,
}

impl FileLogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        let header = match read_frame(&mut input)? {
            Frame::Body(body) => FileHeader::decode(&body)?,
            Frame::End | Frame::Torn => {
                return Err(RedoError::Serialization(format!(
                    "redo log {} has no header",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            input,
            header,
            finished: false,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next record, or `None` at end of stream
    pub fn next_op(&mut self) -> Result<Option<RedoableOp>> {
        while !self.finished {
            match read_frame(&mut self.input)? {
                Frame::Body(body) => match RedoableOp::deserialize(&body) {
                    Ok(op) => return Ok(Some(op)),
                    Err(e) => {
                        log::warn!("Skipping malformed redo record in {}: {}", self.path.display(), e);
                    }
                },
                Frame::End => self.finished = true,
                Frame::Torn => {
                    log::warn!(
                        "Redo log {} ends with a partial record; ignoring it",
                        self.path.display()
                    );
                    self.finished = true;
                }
            }
        }
        Ok(None)
    }
}
