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

use memchr::memchr;

use crate::stream::{ReadState, Source, Stream, StreamError};
use crate::{MessagePart, MessageSize, PartFlags, PartId, PartKind, PartTree};

use super::header::{parse_content_type, parse_header_fields};

// RFC 2046 bounds boundaries at 70 characters; lines longer than this
// cannot be delimiters
const BOUNDARY_LINE_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message stream failed: {0}")]
    Stream(#[from] StreamError),
}

/// Parses the message at the stream's offset 0 into its part tree.
///
/// The parse is a single forward pass that never copies body data; it
/// counts physical bytes, bare LFs and lines per region. Structural
/// damage (bad boundaries, truncated headers) degrades to a best-effort
/// tree; only stream I/O failures are errors.
pub fn parse<S: Source>(stream: &mut Stream<S>) -> Result<PartTree, ParseError> {
    let mut parser = Parser {
        stream,
        parts: Vec::new(),
        boundaries: Vec::new(),
    };
    parser.parse_part(None)?;

    Ok(PartTree {
        parts: parser.parts,
    })
}

/// Byte accounting for a scanned region.
#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    physical: u64,
    bare_lfs: u64,
    lfs: u32,
}

impl Totals {
    fn add(&mut self, other: Totals) {
        self.physical += other.physical;
        self.bare_lfs += other.bare_lfs;
        self.lfs = self.lfs.saturating_add(other.lfs);
    }

    fn to_size(self, count_lines: bool) -> MessageSize {
        MessageSize {
            physical_size: self.physical,
            virtual_size: self.physical + self.bare_lfs,
            lines: if count_lines { self.lfs } else { 0 },
        }
    }
}

/// What ended a region scan.
#[derive(Debug, Clone, Copy)]
enum Delim {
    /// A line matching the boundary at this stack depth; the line itself
    /// has not been consumed.
    Boundary { depth: usize, closing: bool },
    /// End of the data.
    End,
}

struct Parser<'a, S> {
    stream: &'a mut Stream<S>,
    parts: Vec<MessagePart>,
    boundaries: Vec<Vec<u8>>,
}

impl<S: Source> Parser<'_, S> {
    fn parse_part(&mut self, parent: Option<PartId>) -> Result<(PartId, Totals, Delim), ParseError> {
        let physical_pos = self.stream.offset();
        let id = self.parts.len();
        self.parts.push(MessagePart {
            physical_pos,
            parent,
            ..Default::default()
        });

        let mut content_type = None;
        let region = parse_header_fields(self.stream, |name, value| {
            if content_type.is_none() && name.eq_ignore_ascii_case(b"Content-Type") {
                content_type = Some(parse_content_type(value));
            }
        })?;

        let mut flags = PartFlags::default();
        let mut boundary = None;
        match &content_type {
            Some(ct) if !ct.ctype.is_empty() => match ct.main_type() {
                "multipart" => {
                    flags.insert(PartFlags::MULTIPART);
                    if ct.subtype() == Some("signed") {
                        flags.insert(PartFlags::MULTIPART_SIGNED);
                    }
                    match ct.attribute("boundary") {
                        Some(value) if !value.is_empty() => {
                            flags.insert(PartFlags::HAS_BOUNDARY);
                            boundary = Some(value.as_bytes().to_vec());
                        }
                        _ => (),
                    }
                }
                "message" if ct.subtype() == Some("rfc822") => {
                    flags.insert(PartFlags::MESSAGE_RFC822);
                }
                "text" => flags.insert(PartFlags::TEXT),
                _ => (),
            },
            _ => flags.insert(PartFlags::TEXT),
        }

        let mut body = Totals::default();
        let mut kind = PartKind::Leaf;
        let ending;

        if flags.contains(PartFlags::MULTIPART) {
            // a boundary already claimed by an ancestor wins; the inner
            // multipart then has no children of its own
            let usable = boundary
                .filter(|value| !self.boundaries.contains(value));
            let mut children = Vec::new();

            if let Some(value) = usable {
                self.boundaries.push(value);
                let depth = self.boundaries.len() - 1;

                let mut next = self.scan_region(&mut body)?;
                ending = loop {
                    match next {
                        Delim::Boundary { depth: at, closing } if at == depth => {
                            self.consume_line(&mut body)?;
                            if closing {
                                self.boundaries.pop();
                                // the epilogue stays with this part
                                break self.scan_region(&mut body)?;
                            }
                            let (child, span, delim) = self.parse_part(Some(id))?;
                            children.push(child);
                            body.add(span);
                            next = delim;
                        }
                        delim => {
                            self.boundaries.pop();
                            break delim;
                        }
                    }
                };
            } else {
                ending = self.scan_region(&mut body)?;
            }
            kind = PartKind::Multipart(children);
        } else if flags.contains(PartFlags::MESSAGE_RFC822) {
            let (child, span, delim) = self.parse_part(Some(id))?;
            kind = PartKind::Message(child);
            body.add(span);
            ending = delim;
        } else {
            ending = self.scan_region(&mut body)?;
        }

        let part = &mut self.parts[id];
        part.flags = flags;
        part.header_size = region.size;
        part.body_size = body.to_size(flags.has_lines_field());
        part.kind = kind;

        let mut span = Totals {
            physical: region.size.physical_size,
            bare_lfs: region.size.virtual_size - region.size.physical_size,
            lfs: region.lines,
        };
        span.add(body);

        Ok((id, span, ending))
    }

    /// Consumes lines until a boundary line or the end of the data. The
    /// matched boundary line is left unconsumed.
    fn scan_region(&mut self, totals: &mut Totals) -> Result<Delim, ParseError> {
        loop {
            if self.stream.peek().is_empty() {
                match self.stream.fill(0)? {
                    ReadState::Data(_) => (),
                    ReadState::Eof | ReadState::WouldBlock => return Ok(Delim::End),
                }
            }

            if !self.boundaries.is_empty() && self.stream.peek()[0] == b'-' {
                if let Some((depth, closing)) = self.match_boundary_line()? {
                    return Ok(Delim::Boundary { depth, closing });
                }
            }

            self.consume_line(totals)?;
        }
    }

    /// Tests whether the line at the cursor delimits one of the stacked
    /// boundaries, innermost first. Does not consume.
    fn match_boundary_line(&mut self) -> Result<Option<(usize, bool)>, ParseError> {
        loop {
            let buffered = self.stream.peek().len();
            if memchr(b'\n', self.stream.peek()).is_some() || buffered >= BOUNDARY_LINE_MAX {
                break;
            }
            match self.stream.fill(buffered)? {
                ReadState::Data(_) => (),
                ReadState::Eof | ReadState::WouldBlock => break,
            }
        }

        let window = self.stream.peek();
        let line = match memchr(b'\n', window) {
            Some(at) => &window[..at],
            None => &window[..window.len().min(BOUNDARY_LINE_MAX)],
        };
        if !line.starts_with(b"--") {
            return Ok(None);
        }

        for depth in (0..self.boundaries.len()).rev() {
            let boundary = &self.boundaries[depth];
            if line.len() >= 2 + boundary.len() && &line[2..2 + boundary.len()] == &boundary[..] {
                let mut rest = &line[2 + boundary.len()..];
                let closing = rest.starts_with(b"--");
                if closing {
                    rest = &rest[2..];
                }
                if rest.iter().all(|ch| matches!(ch, b' ' | b'\t' | b'\r')) {
                    return Ok(Some((depth, closing)));
                }
            }
        }

        Ok(None)
    }

    /// Consumes one line including its newline, updating the byte counts.
    fn consume_line(&mut self, totals: &mut Totals) -> Result<(), ParseError> {
        let mut last = 0u8;

        loop {
            if self.stream.peek().is_empty() {
                match self.stream.fill(0)? {
                    ReadState::Data(_) => (),
                    ReadState::Eof | ReadState::WouldBlock => return Ok(()),
                }
            }

            let window = self.stream.peek();
            match memchr(b'\n', window) {
                Some(at) => {
                    totals.physical += at as u64 + 1;
                    totals.lfs = totals.lfs.saturating_add(1);
                    let prev = if at > 0 { window[at - 1] } else { last };
                    if prev != b'\r' {
                        totals.bare_lfs += 1;
                    }
                    self.stream.skip(at as u64 + 1);
                    return Ok(());
                }
                None => {
                    totals.physical += window.len() as u64;
                    last = window[window.len() - 1];
                    self.stream.skip(window.len() as u64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::stream::Stream;
    use crate::{MessageSize, PartFlags, PartKind};

    fn parse_bytes(raw: &[u8]) -> crate::PartTree {
        parse(&mut Stream::new(raw)).unwrap()
    }

    #[test]
    fn single_part_sizes() {
        let tree = parse_bytes(b"Subject: hi\r\n\r\nhello world");
        assert_eq!(tree.len(), 1);

        let root = tree.root();
        assert_eq!(root.flags, PartFlags::TEXT);
        assert_eq!(root.header_size, MessageSize::new(15, 15, 0));
        assert_eq!(root.body_size, MessageSize::new(11, 11, 0));
        assert_eq!(root.kind, PartKind::Leaf);
    }

    #[test]
    fn bare_lf_virtual_sizes() {
        let tree = parse_bytes(b"A: b\n\nline1\nline2\n");

        let root = tree.root();
        assert_eq!(root.header_size, MessageSize::new(6, 8, 0));
        assert_eq!(root.body_size, MessageSize::new(12, 14, 2));
    }

    #[test]
    fn empty_message() {
        let tree = parse_bytes(b"");

        let root = tree.root();
        assert_eq!(root.header_size, MessageSize::default());
        assert_eq!(root.body_size, MessageSize::default());
        assert_eq!(root.flags, PartFlags::TEXT);
    }

    #[test]
    fn multipart_structure() {
        let tree = parse_bytes(
            b"Content-Type: multipart/mixed; boundary=X\r\n\r\n\
              preamble\r\n\
              --X\r\n\
              Content-Type: text/plain\r\n\r\n\
              first part\r\n\
              --X\r\n\
              Content-Type: text/plain\r\n\r\n\
              needle here\r\n\
              --X--\r\n\
              epilogue\r\n",
        );

        assert_eq!(tree.len(), 3);
        let root = tree.root();
        assert!(root.flags.contains(PartFlags::MULTIPART));
        assert!(root.flags.contains(PartFlags::HAS_BOUNDARY));
        assert_eq!(root.kind, PartKind::Multipart(vec![1, 2]));
        assert_eq!(root.header_size, MessageSize::new(45, 45, 0));
        // prologue, boundary lines, children and epilogue
        assert_eq!(root.body_size, MessageSize::new(118, 118, 0));

        let first = tree.part(1);
        assert_eq!(first.physical_pos, 60);
        assert_eq!(first.parent, Some(0));
        assert_eq!(first.flags, PartFlags::TEXT);
        assert_eq!(first.header_size, MessageSize::new(28, 28, 0));
        assert_eq!(first.body_size, MessageSize::new(12, 12, 1));

        let second = tree.part(2);
        assert_eq!(second.physical_pos, 105);
        assert_eq!(second.body_size, MessageSize::new(13, 13, 1));
        assert_eq!(second.end_pos(), 146);
    }

    #[test]
    fn nested_message_counts_inner_lines() {
        let tree =
            parse_bytes(b"Content-Type: message/rfc822\r\n\r\nSubject: inner\r\n\r\ninner body");

        assert_eq!(tree.len(), 2);
        let root = tree.root();
        assert_eq!(root.flags, PartFlags::MESSAGE_RFC822);
        assert_eq!(root.kind, PartKind::Message(1));
        assert_eq!(root.header_size, MessageSize::new(32, 32, 0));
        // body lines span the nested message's headers too
        assert_eq!(root.body_size, MessageSize::new(28, 28, 2));

        let inner = tree.part(1);
        assert_eq!(inner.physical_pos, 32);
        assert_eq!(inner.flags, PartFlags::TEXT);
        assert_eq!(inner.header_size, MessageSize::new(18, 18, 0));
        assert_eq!(inner.body_size, MessageSize::new(10, 10, 0));
    }

    #[test]
    fn ancestor_boundary_wins() {
        let tree = parse_bytes(
            b"Content-Type: multipart/mixed; boundary=X\n\n\
              --X\n\
              Content-Type: multipart/mixed; boundary=X\n\n\
              inner prologue\n\
              --X\n\
              Content-Type: text/plain\n\n\
              leaf\n\
              --X--\n",
        );

        assert_eq!(tree.len(), 3);
        let root = tree.root();
        assert_eq!(root.kind, PartKind::Multipart(vec![1, 2]));

        // the nested multipart reuses the ancestor's boundary: no children
        let inner = tree.part(1);
        assert!(inner.flags.contains(PartFlags::MULTIPART));
        assert_eq!(inner.kind, PartKind::Multipart(vec![]));
        assert_eq!(inner.body_size.physical_size, 15);

        assert_eq!(tree.part(2).flags, PartFlags::TEXT);
        assert_eq!(tree.part(2).body_size.lines, 1);
    }

    #[test]
    fn missing_final_boundary() {
        let tree = parse_bytes(
            b"Content-Type: multipart/mixed; boundary=B\n\n--B\n\nbody till end",
        );

        assert_eq!(tree.len(), 2);
        let root = tree.root();
        assert_eq!(root.kind, PartKind::Multipart(vec![1]));

        // the last child's body runs to the end of the parent's body
        let child = tree.part(1);
        assert_eq!(child.header_size, MessageSize::new(1, 2, 0));
        assert_eq!(child.body_size.physical_size, 13);
        assert_eq!(child.end_pos(), tree.root().end_pos());
    }

    #[test]
    fn multipart_signed_flag() {
        let tree = parse_bytes(
            b"Content-Type: multipart/signed; boundary=S\n\n--S\n\ndata\n--S--\n",
        );

        assert!(tree.root().flags.contains(PartFlags::MULTIPART));
        assert!(tree.root().flags.contains(PartFlags::MULTIPART_SIGNED));
    }

    #[test]
    fn children_fit_within_parent() {
        let tree = parse_bytes(
            b"Content-Type: multipart/mixed; boundary=o\n\n\
              --o\n\
              Content-Type: multipart/alternative; boundary=i\n\n\
              --i\n\
              Content-Type: text/plain\n\ninner a\n\
              --i\n\
              Content-Type: text/html\n\n<p>inner b</p>\n\
              --i--\n\
              --o--\n",
        );

        for part in tree.iter() {
            if let Some(parent) = part.parent {
                let parent = tree.part(parent);
                assert!(part.physical_pos >= parent.physical_pos);
                assert!(part.end_pos() <= parent.end_pos());
            }
        }
        assert_eq!(tree.total_size(), 190);
    }
}
