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

use crate::decoders::base64;
use crate::decoders::charsets::{to_ucase_utf8_string, CharsetError};
use crate::decoders::quoted_printable;

/// Walks a header block and reports each run of bytes to `f` as
/// `(bytes, charset)`: RFC 2047 encoded words are decoded and labeled
/// with their charset, everything else is passed through with `None`.
///
/// Invalid encoded-word syntax and corrupt encoded text are emitted
/// verbatim. Adjacent encoded words are reported separately even when
/// their charsets match; joining is the caller's business. `f` returns
/// `false` to stop the walk.
pub fn decode_header(data: &[u8], mut f: impl FnMut(&[u8], Option<&str>) -> bool) {
    let mut start = 0;
    let mut pos = 0;

    while pos < data.len() {
        if data[pos] == b'=' && data.get(pos + 1) == Some(&b'?') {
            if let Some(word) = EncodedWord::split(&data[pos + 2..]) {
                if let Some(decoded) = word.decode() {
                    if pos != start && !f(&data[start..pos], None) {
                        return;
                    }
                    if !f(&decoded, Some(word.charset)) {
                        return;
                    }
                    pos += 2 + word.consumed;
                    start = pos;
                    continue;
                }
            }
        }
        pos += 1;
    }

    if start < data.len() {
        f(&data[start..], None);
    }
}

struct EncodedWord<'a> {
    charset: &'a str,
    encoding: u8,
    text: &'a [u8],
    // bytes after "=?" up to and including the final "?="
    consumed: usize,
}

impl<'a> EncodedWord<'a> {
    /// Splits `charset?encoding?text?=` at the start of `data`.
    fn split(data: &'a [u8]) -> Option<EncodedWord<'a>> {
        let charset_end = data.iter().position(|&ch| ch == b'?')?;
        let charset = std::str::from_utf8(&data[..charset_end]).ok()?;
        // strip an RFC 2231 language suffix
        let charset = charset.split('*').next().unwrap_or(charset);
        if charset.is_empty() {
            return None;
        }

        let encoding = *data.get(charset_end + 1)?;
        if data.get(charset_end + 2) != Some(&b'?') {
            return None;
        }
        let encoding = match encoding {
            b'Q' | b'q' => b'Q',
            b'B' | b'b' => b'B',
            _ => return None,
        };

        let text_start = charset_end + 3;
        let text_len = data[text_start..].iter().position(|&ch| ch == b'?')?;
        if data.get(text_start + text_len + 1) != Some(&b'=') {
            return None;
        }

        Some(EncodedWord {
            charset,
            encoding,
            text: &data[text_start..text_start + text_len],
            consumed: text_start + text_len + 2,
        })
    }

    fn decode(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.text.len());
        if self.encoding == b'Q' {
            quoted_printable::decode_q_word(self.text, &mut out);
        } else {
            match base64::decode(self.text, &mut out) {
                Ok(consumed) if consumed == self.text.len() => (),
                // corrupt or partial base64 text: emit the word verbatim
                _ => return None,
            }
        }
        Some(out)
    }
}

/// Substring search over decoded header text.
///
/// The context is built once per search key and reused across header
/// blocks and message parts; [`reset`] clears the found flag and the
/// partial-match state between parts. Matching follows the header
/// layout: folded lines unfold to a single space, a new logical header
/// resets partial matches so a match never spans two headers, and CR/LF
/// bytes themselves never participate in a match.
///
/// [`reset`]: HeaderSearch::reset
pub struct HeaderSearch {
    key: Vec<u8>,
    key_charset: Option<String>,
    key_ascii: bool,
    unknown_charset: bool,
    matches: Vec<usize>,
    found: bool,
    last_newline: bool,
    submatch: bool,
}

impl HeaderSearch {
    /// Builds a context for `key` as written in `charset` (`None` for
    /// UTF-8). The key is upper-cased through the charset converter, so
    /// an unknown charset or a key invalid in it fails here.
    pub fn new(key: &[u8], charset: Option<&str>) -> Result<HeaderSearch, CharsetError> {
        let key = to_ucase_utf8_string(charset, key)?;
        let key_ascii = key.iter().all(|ch| ch & 0x80 == 0);
        let matches = Vec::with_capacity(key.len());

        Ok(HeaderSearch {
            key,
            key_charset: charset.map(str::to_string),
            key_ascii,
            unknown_charset: charset.is_none(),
            matches,
            found: false,
            last_newline: false,
            submatch: false,
        })
    }

    #[inline(always)]
    pub fn found(&self) -> bool {
        self.found
    }

    /// Clears the found flag and all partial matches, so one context can
    /// serve many parts.
    pub fn reset(&mut self) {
        self.matches.clear();
        self.found = false;
        self.last_newline = false;
    }

    /// Feeds the next block of raw header bytes. Returns the sticky
    /// found flag; once set, further blocks are not inspected.
    pub fn search_block(&mut self, data: &[u8]) -> bool {
        if !self.found {
            decode_header(data, |bytes, charset| {
                match charset {
                    Some(_) => self.search_with_charset(bytes, charset),
                    None => self.search_loop(bytes),
                }
                !self.found
            });
        }
        self.found
    }

    fn search_with_charset(&mut self, data: &[u8], charset: Option<&str>) {
        let charset = if self.unknown_charset {
            // the key's charset is unknown, so assume we want to match
            // using the same charsets
            None
        } else if matches!(charset, Some(label) if label.eq_ignore_ascii_case("x-unknown")) {
            self.key_charset.clone()
        } else {
            charset.map(str::to_string)
        };

        if let Ok(converted) = to_ucase_utf8_string(charset.as_deref(), data) {
            self.submatch = true;
            self.search_loop(&converted);
            self.submatch = false;
        }
    }

    fn search_loop(&mut self, data: &[u8]) {
        let mut last_newline = self.last_newline;
        let mut pos = 0;

        while pos < data.len() {
            let mut chr = data[pos];

            if !self.submatch {
                if chr & 0x80 == 0 {
                    chr = chr.to_ascii_uppercase();
                } else if !self.key_ascii && !self.unknown_charset {
                    // non-ascii in the header and in the key: treat the
                    // rest of the header as the key's charset
                    let key_charset = self.key_charset.clone();
                    self.search_with_charset(&data[pos..], key_charset.as_deref());
                    break;
                }
            }

            if last_newline && !self.submatch {
                if !matches!(chr, b' ' | b'\t') {
                    // start of a new header, matches do not span it
                    self.matches.clear();
                }
                chr = b' ';
            }
            last_newline = chr == b'\n';

            if chr == b'\r' || chr == b'\n' {
                pos += 1;
                continue;
            }

            let mut at = self.matches.len();
            while at > 0 {
                at -= 1;
                if self.key[self.matches[at]] == chr {
                    self.matches[at] += 1;
                    if self.matches[at] == self.key.len() {
                        self.found = true;
                        return;
                    }
                } else {
                    self.matches.swap_remove(at);
                }
            }

            if chr == self.key[0] {
                if self.key.len() == 1 {
                    self.found = true;
                    return;
                }
                self.matches.push(1);
            }

            pos += 1;
        }

        self.last_newline = last_newline;
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_header, HeaderSearch};

    fn decode_all(data: &[u8]) -> Vec<(Vec<u8>, Option<String>)> {
        let mut chunks = Vec::new();
        decode_header(data, |bytes, charset| {
            chunks.push((bytes.to_vec(), charset.map(str::to_string)));
            true
        });
        chunks
    }

    #[test]
    fn decode_literal_and_words() {
        let chunks = decode_all(b"Hello =?utf-8?q?w=C3=B6rld?= and =?utf-8?b?bW9yZQ==?= tail");

        assert_eq!(
            chunks,
            [
                (b"Hello ".to_vec(), None),
                ("wörld".as_bytes().to_vec(), Some("utf-8".to_string())),
                (b" and ".to_vec(), None),
                (b"more".to_vec(), Some("utf-8".to_string())),
                (b" tail".to_vec(), None),
            ]
        );
    }

    #[test]
    fn adjacent_words_are_not_joined() {
        let chunks = decode_all(b"=?utf-8?q?ab?==?utf-8?q?cd?=");

        assert_eq!(
            chunks,
            [
                (b"ab".to_vec(), Some("utf-8".to_string())),
                (b"cd".to_vec(), Some("utf-8".to_string())),
            ]
        );
    }

    #[test]
    fn invalid_words_pass_verbatim() {
        for input in [
            &b"=?utf-8?q?unterminated"[..],
            b"=?utf-8?x?bad-encoding?=",
            b"=??q?empty-charset?=",
            b"=?utf-8?b?@@corrupt@@?=",
            b"= ?not a word",
        ] {
            let chunks = decode_all(input);
            assert_eq!(
                chunks,
                [(input.to_vec(), None)],
                "Failed for {input:?}"
            );
        }
    }

    #[test]
    fn q_word_underscores_are_spaces() {
        let chunks = decode_all(b"=?US-ASCII?Q?Keith_Moore?=");
        assert_eq!(chunks[0].0, b"Keith Moore");
    }

    fn search_in(key: &str, charset: Option<&str>, header: &[u8]) -> bool {
        let mut search = HeaderSearch::new(key.as_bytes(), charset).unwrap();
        search.search_block(header)
    }

    #[test]
    fn matches_are_case_insensitive() {
        assert!(search_in("WORLD", None, b"Subject header says hello world here"));
        assert!(search_in("hello", None, b"HELLO"));
        assert!(!search_in("absent", None, b"nothing to see"));
    }

    #[test]
    fn single_byte_key() {
        assert!(search_in("x", None, b"ax"));
        assert!(!search_in("x", None, b"abc"));
    }

    #[test]
    fn folded_headers_unfold_to_one_space() {
        assert!(search_in("hello world", None, b"hello\r\n world"));
        assert!(search_in("hello world", None, b"hello\n\tworld"));
    }

    #[test]
    fn matches_do_not_span_headers() {
        // "ab" ends one header, "cd" starts the next
        assert!(!search_in("abcd", None, b"X: zab\nY: cdz\n"));
        assert!(search_in("cdz", None, b"X: zab\nY: cdz\n"));
    }

    #[test]
    fn encoded_words_match_against_utf8_key() {
        assert!(search_in(
            "JØRN",
            Some("utf-8"),
            b"From: =?iso-8859-1?Q?Keld_J=F8rn_Simonsen?= <keld@dkuug.dk>"
        ));
        assert!(search_in(
            "CAFÉ",
            Some("utf-8"),
            b"Subject: =?utf-8?b?Y2Fmw6k=?="
        ));
    }

    #[test]
    fn unknown_key_charset_matches_decoded_words_as_utf8() {
        // a key without a declared charset compares in the same charset;
        // the decoded word is upper-cased as UTF-8, not passed through raw
        assert!(search_in("CAFÉ", None, b"Subject: =?utf-8?q?caf=C3=A9?="));
        assert!(!search_in("CAFÉ", None, b"Subject: =?utf-8?q?tea?="));
    }

    #[test]
    fn blocks_accumulate_partial_matches() {
        let mut search = HeaderSearch::new(b"needle", None).unwrap();
        assert!(!search.search_block(b"a nee"));
        assert!(search.search_block(b"dle b"));
        assert!(search.found());
    }

    #[test]
    fn reset_clears_state() {
        let mut search = HeaderSearch::new(b"key", None).unwrap();
        assert!(search.search_block(b"the key"));
        search.reset();
        assert!(!search.found());
        assert!(!search.search_block(b"nothing"));
    }

    #[test]
    fn unknown_key_charset_fails() {
        assert!(HeaderSearch::new(b"abc", Some("x-weird")).is_err());
    }
}
