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

pub mod header;

pub use header::{decode_header, HeaderSearch};

use crate::decoders::base64;
use crate::decoders::charsets::{to_ucase_utf8_string, CharsetError, Convert, Translation};
use crate::decoders::quoted_printable;
use crate::parsers::header::{
    parse_content_type, parse_header_fields, parse_transfer_encoding, ContentType,
    TransferEncoding,
};
use crate::stream::{ReadState, Source, Stream};
use crate::{MessagePart, PartId, PartTree};

const DECODE_BLOCK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    /// The key's declared charset cannot be interpreted. Charsets found
    /// inside the message never raise this; they fall back to ASCII.
    #[error("unknown search key charset")]
    UnknownCharset,
    /// The key is empty, too long, or not valid in its declared charset.
    #[error("invalid search key")]
    InvalidKey,
    /// The stream and the part tree describe different bytes; the caller
    /// should re-parse the message.
    #[error("message part is broken")]
    PartBroken,
}

/// Decides whether `key` occurs in the message, walking the part tree
/// depth-first over the raw message stream.
///
/// Every part's header block is read to pick the part's transfer decoder
/// and charset; header text itself is matched for every part except,
/// when `include_headers` is false, the root's. Leaf bodies are streamed
/// through the transfer decoder and the charset converter in blocks.
/// Parts that cannot be decoded (unknown transfer encoding, corrupt
/// base64, bytes invalid in their charset) simply cannot match; the
/// search moves on.
pub fn search<S: Source>(
    key: &str,
    key_charset: Option<&str>,
    stream: &mut Stream<S>,
    tree: &PartTree,
    include_headers: bool,
) -> Result<bool, SearchError> {
    if key.is_empty() {
        return Err(SearchError::InvalidKey);
    }
    let key = to_ucase_utf8_string(key_charset, key.as_bytes()).map_err(|error| match error {
        CharsetError::UnknownCharset => SearchError::UnknownCharset,
        CharsetError::InvalidInput => SearchError::InvalidKey,
    })?;
    if key.len() > i32::MAX as usize {
        return Err(SearchError::InvalidKey);
    }

    // the key is UTF-8 from here on, whatever charset it arrived in
    let header_search =
        HeaderSearch::new(&key, Some("utf-8")).map_err(|_| SearchError::InvalidKey)?;

    if tree.is_empty() {
        return Ok(false);
    }

    let mut ctx = BodySearch {
        key,
        header_search,
        include_headers,
    };
    ctx.search_part(stream, tree, 0)
}

/// Per-part header facts the body scan is configured from.
#[derive(Default)]
struct PartHeader {
    content_type: Option<ContentType>,
    encoding: TransferEncoding,
}

struct BodySearch {
    key: Vec<u8>,
    header_search: HeaderSearch,
    include_headers: bool,
}

impl BodySearch {
    fn search_part<S: Source>(
        &mut self,
        stream: &mut Stream<S>,
        tree: &PartTree,
        id: PartId,
    ) -> Result<bool, SearchError> {
        let part = tree.part(id);
        let ignore_header = part.parent.is_none() && !self.include_headers;

        // scan the header block; even when matching is skipped it still
        // yields the content headers that configure the body scan
        let mut info = PartHeader::default();
        self.header_search.reset();

        let consumed = {
            let mut view = stream.limit(part.physical_pos, part.header_size.physical_size);
            let header_search = &mut self.header_search;
            let region = parse_header_fields(&mut view, |name, value| {
                if !ignore_header && !header_search.found() {
                    if header_search.search_block(value) {
                        return;
                    }
                    header_search.search_block(b"\n");
                }

                if name.eq_ignore_ascii_case(b"Content-Type") {
                    if info.content_type.is_none() {
                        info.content_type = Some(parse_content_type(value));
                    }
                } else if name.eq_ignore_ascii_case(b"Content-Transfer-Encoding") {
                    info.encoding = parse_transfer_encoding(value);
                }
            })
            .map_err(|_| SearchError::PartBroken)?;
            region.size.physical_size
        };
        if !ignore_header && self.header_search.found() {
            return Ok(true);
        }
        if consumed != part.header_size.physical_size {
            // the stream disagrees with the cached tree
            return Err(SearchError::PartBroken);
        }

        match &part.kind {
            crate::PartKind::Multipart(children) => {
                // a multipart's own body holds only boundary lines and
                // the epilogue; scan the children
                for &child in children {
                    if self.search_part(stream, tree, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            crate::PartKind::Message(child) => self.search_part(stream, tree, *child),
            crate::PartKind::Leaf => self.search_body(stream, part, &info),
        }
    }

    fn search_body<S: Source>(
        &mut self,
        stream: &mut Stream<S>,
        part: &MessagePart,
        info: &PartHeader,
    ) -> Result<bool, SearchError> {
        if info.encoding == TransferEncoding::Unknown {
            // nothing sensible to decode
            return Ok(false);
        }
        let is_text = info
            .content_type
            .as_ref()
            .map_or(true, |ct| matches!(ct.main_type(), "text" | "message"));
        if !is_text {
            return Ok(false);
        }

        // an unknown or missing body charset falls back to ASCII rather
        // than failing the search
        let charset = info
            .content_type
            .as_ref()
            .and_then(|ct| ct.attribute("charset"));
        let mut translation = charset
            .and_then(|label| Translation::new(Some(label)).ok())
            .unwrap_or_else(|| Translation::new(Some("ascii")).unwrap());

        let mut scanner = BlockScanner::new(&self.key);
        let mut carry: Vec<u8> = Vec::new();
        let mut view = stream.limit(part.body_pos(), part.body_size.physical_size);
        let mut leftover = 0usize;

        loop {
            match view.fill(leftover) {
                Ok(ReadState::Data(_)) => (),
                Ok(ReadState::Eof) | Ok(ReadState::WouldBlock) => break,
                Err(_) => return Err(SearchError::PartBroken),
            }

            let (consumed, decoded) = {
                let data = view.peek();
                let block = &data[..data.len().min(DECODE_BLOCK_SIZE.max(leftover + 1))];
                match info.encoding {
                    TransferEncoding::Identity => (block.len(), block.to_vec()),
                    TransferEncoding::QuotedPrintable => {
                        let mut out = Vec::with_capacity(block.len());
                        let consumed = quoted_printable::decode(block, &mut out);
                        (consumed, out)
                    }
                    TransferEncoding::Base64 => {
                        let mut out = Vec::with_capacity(block.len() / 4 * 3 + 3);
                        match base64::decode(block, &mut out) {
                            Ok(consumed) => (consumed, out),
                            Err(error) => {
                                // corrupt base64: this part cannot match
                                log::debug!(
                                    "broken base64 data in message part at {}: {error}",
                                    part.physical_pos,
                                );
                                return Ok(false);
                            }
                        }
                    }
                    TransferEncoding::Unknown => unreachable!(),
                }
            };

            view.skip(consumed as u64);
            leftover = view.peek().len();

            match scan_decoded(&mut translation, &mut carry, &mut scanner, &decoded) {
                Ok(true) => return Ok(true),
                Ok(false) => (),
                Err(()) => {
                    log::debug!(
                        "message part at {} is not valid in its declared charset",
                        part.physical_pos,
                    );
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }
}

/// Converts one transfer-decoded block and runs the substring scan,
/// carrying incomplete multi-byte tails to the next call. `Err` means
/// the block is invalid in the part's charset.
fn scan_decoded(
    translation: &mut Translation,
    carry: &mut Vec<u8>,
    scanner: &mut BlockScanner,
    decoded: &[u8],
) -> Result<bool, ()> {
    let joined;
    let mut data: &[u8] = if carry.is_empty() {
        decoded
    } else {
        carry.extend_from_slice(decoded);
        joined = std::mem::take(carry);
        &joined
    };

    let mut out = Vec::with_capacity(DECODE_BLOCK_SIZE);
    loop {
        out.clear();
        let (consumed, state) = translation
            .to_ucase_utf8(data, &mut out, DECODE_BLOCK_SIZE)
            .map_err(|_| ())?;
        if scanner.scan(&out) {
            return Ok(true);
        }

        data = &data[consumed..];
        match state {
            Convert::Full => return Ok(false),
            Convert::OutputFull => (),
            Convert::Incomplete { .. } => {
                carry.extend_from_slice(data);
                return Ok(false);
            }
        }
    }
}

/// Byte-level substring scanner over upper-cased UTF-8 blocks. Partial
/// matches span block boundaries; blocks of one part are one contiguous
/// text as far as matching is concerned.
struct BlockScanner<'k> {
    key: &'k [u8],
    matches: Vec<usize>,
}

impl<'k> BlockScanner<'k> {
    fn new(key: &'k [u8]) -> BlockScanner<'k> {
        BlockScanner {
            key,
            matches: Vec::with_capacity(key.len()),
        }
    }

    fn scan(&mut self, data: &[u8]) -> bool {
        for &chr in data {
            let mut at = self.matches.len();
            while at > 0 {
                at -= 1;
                if self.key[self.matches[at]] == chr {
                    self.matches[at] += 1;
                    if self.matches[at] == self.key.len() {
                        return true;
                    }
                } else {
                    self.matches.swap_remove(at);
                }
            }

            if chr == self.key[0] {
                if self.key.len() == 1 {
                    return true;
                }
                self.matches.push(1);
            }
        }

        false
    }
}
