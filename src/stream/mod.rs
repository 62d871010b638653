/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

pub mod tee;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Random-access byte supplier backing a [`Stream`].
///
/// This is the seam the mailbox storage implements: a message is exposed as
/// a contiguous range of bytes addressed from 0, whether it lives in an
/// mmap'd mbox, a maildir file or a memory buffer. `Ok(0)` at an offset
/// inside the requested window means the supplier has no more data (EOF);
/// `ErrorKind::WouldBlock` is reported to the caller as a retryable
/// condition rather than an error.
pub trait Source {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl Source for &[u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = match usize::try_from(offset) {
            Ok(offset) if offset < self.len() => &self[offset..],
            _ => return Ok(0),
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

impl Source for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read(buf)
    }
}

impl<S: Source + ?Sized> Source for &mut S {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Outcome of a read that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// The buffered window grew by this many bytes.
    Data(usize),
    /// No data available right now; retry later.
    WouldBlock,
    /// End of the stream (or of the limited view).
    Eof,
}

/// Stream failures are sticky: once one is returned, every subsequent
/// call returns the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error("stream read failed: {0:?}")]
    Io(io::ErrorKind),
}

const READ_BLOCK_SIZE: usize = 8192;

/// Buffered, seekable cursor over a [`Source`].
///
/// A stream exposes a window of already-read bytes through [`peek`] that
/// the caller consumes with [`skip`]; [`read`] and [`fill`] grow the
/// window. [`limit`] carves out a child view that starts at offset 0 and
/// ends after a fixed number of bytes, borrowing the parent's source so
/// only one view can be active at a time.
///
/// [`peek`]: Stream::peek
/// [`skip`]: Stream::skip
/// [`read`]: Stream::read
/// [`fill`]: Stream::fill
/// [`limit`]: Stream::limit
pub struct Stream<S> {
    source: S,
    buf: Vec<u8>,
    // consumed and valid byte counts within buf
    skip: usize,
    pos: usize,
    // view-relative offset of buf[skip]
    offset: u64,
    // absolute offset of the view within the source, and its length
    start: u64,
    window: Option<u64>,
    error: Option<StreamError>,
    closed: bool,
}

impl<S: Source> Stream<S> {
    pub fn new(source: S) -> Stream<S> {
        Stream {
            source,
            buf: Vec::new(),
            skip: 0,
            pos: 0,
            offset: 0,
            start: 0,
            window: None,
            error: None,
            closed: false,
        }
    }

    /// Current offset within the view, i.e. the position of `peek()[0]`.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The bytes read but not yet consumed.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.skip..self.pos]
    }

    /// Extends the readable window by at least one byte when `Data(n)` is
    /// returned with `n > 0`.
    pub fn read(&mut self) -> Result<ReadState, StreamError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if self.closed {
            self.error = Some(StreamError::Closed);
            return Err(StreamError::Closed);
        }

        if self.skip == self.pos {
            self.skip = 0;
            self.pos = 0;
        } else if self.pos == self.buf.len() && self.skip > 0 {
            self.buf.copy_within(self.skip..self.pos, 0);
            self.pos -= self.skip;
            self.skip = 0;
        }
        if self.pos == self.buf.len() {
            let grow = (self.buf.len()).max(READ_BLOCK_SIZE);
            self.buf.resize(self.buf.len() + grow, 0);
        }

        let buffered = (self.pos - self.skip) as u64;
        let mut read_len = self.buf.len() - self.pos;
        if let Some(window) = self.window {
            let left = window.saturating_sub(self.offset + buffered);
            if left == 0 {
                return Ok(ReadState::Eof);
            }
            read_len = read_len.min(left.min(usize::MAX as u64) as usize);
        }

        let read_offset = self.start + self.offset + buffered;
        match self.source.read_at(read_offset, &mut self.buf[self.pos..self.pos + read_len]) {
            Ok(0) => Ok(ReadState::Eof),
            Ok(n) => {
                self.pos += n;
                Ok(ReadState::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadState::WouldBlock),
            Err(e) => {
                let error = StreamError::Io(e.kind());
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Reads until more than `threshold` bytes are buffered. Returns `Eof`
    /// or `WouldBlock` as soon as the window can no longer grow.
    pub fn fill(&mut self, threshold: usize) -> Result<ReadState, StreamError> {
        while self.pos - self.skip <= threshold {
            match self.read()? {
                ReadState::Data(_) => (),
                state => return Ok(state),
            }
        }
        Ok(ReadState::Data(self.pos - self.skip))
    }

    /// Consumes `count` bytes. Skipping past the buffered window is
    /// allowed; the next read continues from the new offset.
    pub fn skip(&mut self, count: u64) {
        let buffered = (self.pos - self.skip) as u64;
        if count <= buffered {
            self.skip += count as usize;
        } else {
            self.skip = 0;
            self.pos = 0;
        }
        self.offset += count;
    }

    /// Repositions the view cursor, discarding the buffered window.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
        self.skip = 0;
        self.pos = 0;
    }

    /// A child view of `length` bytes starting at `start`, addressed from
    /// 0. Reads past the end of the view return `Eof`; the parent's cursor
    /// is untouched.
    pub fn limit(&mut self, start: u64, length: u64) -> Stream<&mut S> {
        Stream {
            source: &mut self.source,
            buf: Vec::new(),
            skip: 0,
            pos: 0,
            offset: 0,
            start: self.start + start,
            window: Some(length),
            error: self.error.clone(),
            closed: self.closed,
        }
    }

    /// Releases the stream; subsequent reads observe `StreamError::Closed`.
    pub fn close(&mut self) {
        self.closed = true;
    }
}
