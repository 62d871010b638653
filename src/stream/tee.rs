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

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use super::{ReadState, Source, Stream};

const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Fans a single upstream out to multiple independent cursors.
///
/// The tee keeps exactly the bytes between the slowest and the fastest
/// cursor buffered. A cursor that runs too far ahead of the others would
/// grow that window past the configured ceiling; instead of failing, its
/// reads report `WouldBlock` until the slower cursors advance.
///
/// Cursors implement [`Source`], so each one is driven through its own
/// [`Stream`].
pub struct Tee<S> {
    inner: Rc<RefCell<TeeInner<S>>>,
}

struct TeeInner<S> {
    upstream: Stream<S>,
    // window of upstream bytes [window_start, window_start + window.len())
    window: Vec<u8>,
    window_start: u64,
    max_buffer: usize,
    // per-cursor consumed offset; None once the cursor is dropped
    cursors: Vec<Option<u64>>,
    eof: u64,
    eof_known: bool,
}

impl<S: Source> Tee<S> {
    pub fn new(source: S) -> Tee<S> {
        Tee::with_max_buffer(source, DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(source: S, max_buffer: usize) -> Tee<S> {
        Tee {
            inner: Rc::new(RefCell::new(TeeInner {
                upstream: Stream::new(source),
                window: Vec::new(),
                window_start: 0,
                max_buffer,
                cursors: Vec::new(),
                eof: 0,
                eof_known: false,
            })),
        }
    }

    /// Issues a new independent cursor positioned at offset 0.
    pub fn child(&self) -> TeeSource<S> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.cursors.len();
        inner.cursors.push(Some(0));
        TeeSource {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl<S: Source> TeeInner<S> {
    fn trim(&mut self) {
        let min_offset = self
            .cursors
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(self.window_start + self.window.len() as u64);
        if min_offset > self.window_start {
            let drop = (min_offset - self.window_start).min(self.window.len() as u64) as usize;
            self.window.drain(..drop);
            self.window_start += drop as u64;
        }
    }

    fn read_child(&mut self, id: usize, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.cursors[id] = Some(offset);
        self.trim();

        if offset < self.window_start {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tee cursor rewound past the shared window",
            ));
        }

        while offset >= self.window_start + self.window.len() as u64 {
            if self.eof_known && self.window_start + self.window.len() as u64 >= self.eof {
                return Ok(0);
            }
            if self.window.len() >= self.max_buffer {
                // busy: the slowest cursor is holding the window back
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "tee window at capacity",
                ));
            }
            match self
                .upstream
                .fill(0)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            {
                ReadState::Data(_) => {
                    let data = self.upstream.peek();
                    let take = data.len().min(self.max_buffer - self.window.len());
                    self.window.extend_from_slice(&data[..take]);
                    self.upstream.skip(take as u64);
                }
                ReadState::Eof => {
                    self.eof = self.window_start + self.window.len() as u64;
                    self.eof_known = true;
                    return Ok(0);
                }
                ReadState::WouldBlock => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "tee upstream not ready",
                    ));
                }
            }
        }

        let at = (offset - self.window_start) as usize;
        let len = (self.window.len() - at).min(buf.len());
        buf[..len].copy_from_slice(&self.window[at..at + len]);
        Ok(len)
    }
}

/// One cursor of a [`Tee`].
pub struct TeeSource<S> {
    inner: Rc<RefCell<TeeInner<S>>>,
    id: usize,
}

impl<S: Source> Source for TeeSource<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.borrow_mut().read_child(self.id, offset, buf)
    }
}

impl<S> Drop for TeeSource<S> {
    fn drop(&mut self) {
        self.inner.borrow_mut().cursors[self.id] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ReadState, Stream};

    #[test]
    fn independent_cursors() {
        let tee = Tee::new(b"one shared upstream".as_ref());
        let mut a = Stream::new(tee.child());
        let mut b = Stream::new(tee.child());

        assert!(matches!(a.fill(0), Ok(ReadState::Data(_))));
        assert_eq!(&a.peek()[..3], b"one");
        a.skip(4);

        assert!(matches!(b.fill(0), Ok(ReadState::Data(_))));
        assert_eq!(&b.peek()[..3], b"one");

        assert!(matches!(a.fill(0), Ok(ReadState::Data(_))));
        assert_eq!(&a.peek()[..6], b"shared");
    }

    #[test]
    fn fast_cursor_blocks_at_ceiling() {
        let tee = Tee::with_max_buffer(b"0123456789".as_ref(), 4);
        let mut fast = Stream::new(tee.child());
        let mut slow = Stream::new(tee.child());

        assert!(matches!(slow.fill(0), Ok(ReadState::Data(_))));

        // the fast cursor may consume at most the window ceiling ahead
        fast.skip(4);
        assert!(matches!(fast.fill(0), Ok(ReadState::WouldBlock)));

        // once the slow cursor advances, the window slides forward
        slow.skip(4);
        assert!(matches!(slow.fill(0), Ok(ReadState::Data(_))));
        assert!(matches!(fast.fill(0), Ok(ReadState::Data(_))));
        assert_eq!(&fast.peek()[..4], b"4567");
    }

    #[test]
    fn dropped_cursor_releases_window() {
        let tee = Tee::with_max_buffer(b"abcdefgh".as_ref(), 4);
        let slow = Stream::new(tee.child());
        let mut fast = Stream::new(tee.child());

        fast.skip(4);
        assert!(matches!(fast.fill(0), Ok(ReadState::WouldBlock)));

        drop(slow);
        assert!(matches!(fast.fill(0), Ok(ReadState::Data(_))));
        assert_eq!(fast.peek(), b"efgh");
    }
}
