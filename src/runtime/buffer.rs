//! Fixed-length frame buffers.
//!
//! Every message on the wire is exactly one buffer's capacity long; there is
//! no length prefix or delimiter. A `FrameBuffer` tracks how much of the
//! current frame has been transferred so that partial reads and writes on a
//! non-blocking socket resume where they stopped.

use std::io::{self, Read, Write};

/// Outcome of a non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The frame is now fully transferred.
    Complete,
    /// The socket would block before the frame was done.
    Blocked,
}

/// Error from a frame transfer.
#[derive(Debug)]
pub enum TransferError {
    /// Zero-length read: the peer closed the stream.
    Closed,
    Io(io::Error),
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

/// A single frame with a transfer offset.
///
/// For receiving, the offset is the fill level; for sending, it is the
/// number of bytes already written.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
    offset: usize,
}

impl FrameBuffer {
    /// Create a zeroed frame of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the whole frame has been transferred.
    pub fn is_complete(&self) -> bool {
        self.offset == self.data.len()
    }

    /// The whole frame, regardless of offset.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The whole frame, for filling before a send.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Rewind for the next frame.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Copy `frame` in and rewind.
    ///
    /// # Panics
    /// Panics if `frame` is not exactly `capacity` bytes.
    pub fn load(&mut self, frame: &[u8]) {
        self.data.copy_from_slice(frame);
        self.offset = 0;
    }

    fn advance(&mut self, n: usize) {
        debug_assert!(self.offset + n <= self.data.len());
        self.offset += n;
    }

    /// Read until the frame is full or the source would block.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<Progress, TransferError> {
        while !self.is_complete() {
            match src.read(&mut self.data[self.offset..]) {
                Ok(0) => return Err(TransferError::Closed),
                Ok(n) => self.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Complete)
    }

    /// Write until the frame is drained or the sink would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<Progress, TransferError> {
        while !self.is_complete() {
            match dst.write(&self.data[self.offset..]) {
                Ok(0) => {
                    return Err(TransferError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )))
                }
                Ok(n) => self.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Complete)
    }
}
