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

use crate::stream::{Source, Stream, StreamError};
use crate::MessageSize;

use super::{read_line_into, Terminator};

/// Consumed size of a header region. `lines` is the LF count of the
/// region, which the message parser needs for nested rfc822 accounting;
/// the reported [`MessageSize`] carries `lines == 0` since line counts
/// only ever describe bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRegion {
    pub size: MessageSize,
    pub lines: u32,
}

/// Walks the header section of a part, reporting each logical field to
/// `on_field` as `(name, full_value)`.
///
/// Folded continuation lines are stitched into the value with their line
/// breaks normalized to a single `\n` and the continuation whitespace
/// preserved, so consumers can both unfold (header search) and parse
/// parameters spanning folds (Content-Type). The walk ends after the
/// blank separator line, which is included in the returned size, or at
/// the end of the view.
pub fn parse_header_fields<S: Source>(
    stream: &mut Stream<S>,
    mut on_field: impl FnMut(&[u8], &[u8]),
) -> Result<HeaderRegion, StreamError> {
    let mut physical = 0u64;
    let mut bare_lfs = 0u64;
    let mut lines = 0u32;

    let mut line = Vec::new();
    let mut name = Vec::new();
    let mut value = Vec::new();
    let mut have_field = false;

    loop {
        let terminator = match read_line_into(stream, &mut line)? {
            Some(terminator) => terminator,
            None => break,
        };

        physical += line.len() as u64 + terminator.len();
        match terminator {
            Terminator::Lf => {
                bare_lfs += 1;
                lines += 1;
            }
            Terminator::CrLf => lines += 1,
            Terminator::None => (),
        }

        if line.is_empty() && terminator != Terminator::None {
            // blank separator, end of headers
            break;
        }

        if matches!(line.first(), Some(b' ' | b'\t')) && have_field {
            value.push(b'\n');
            value.extend_from_slice(&line);
        } else {
            if have_field {
                on_field(&name, &value);
                have_field = false;
            }
            if let Some(colon) = memchr(b':', &line) {
                name.clear();
                name.extend_from_slice(trim_end(&line[..colon]));
                value.clear();
                value.extend_from_slice(trim_start(&line[colon + 1..]));
                have_field = true;
            }
        }

        if terminator == Terminator::None {
            break;
        }
    }

    if have_field {
        on_field(&name, &value);
    }

    Ok(HeaderRegion {
        size: MessageSize {
            physical_size: physical,
            virtual_size: physical + bare_lfs,
            lines: 0,
        },
        lines,
    })
}

fn trim_start(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|ch| !ch.is_ascii_whitespace())
        .unwrap_or(value.len());
    &value[start..]
}

fn trim_end(value: &[u8]) -> &[u8] {
    let end = value
        .iter()
        .rposition(|ch| !ch.is_ascii_whitespace())
        .map_or(0, |at| at + 1);
    &value[..end]
}

/// Parsed Content-Type (or Content-Disposition) value: the lower-cased
/// `type/subtype` token and its parameters with lower-cased names.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ContentType {
    pub ctype: String,
    pub attributes: Vec<(String, String)>,
}

impl ContentType {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn main_type(&self) -> &str {
        self.ctype
            .split_once('/')
            .map_or(self.ctype.as_str(), |(main, _)| main)
    }

    pub fn subtype(&self) -> Option<&str> {
        self.ctype.split_once('/').map(|(_, sub)| sub)
    }
}

/// Parses a Content-Type header value. Best effort: unparsable
/// parameters are dropped, an empty value yields an empty type.
pub fn parse_content_type(value: &[u8]) -> ContentType {
    let mut sections = split_params(value).into_iter();

    let ctype = sections
        .next()
        .map(|token| {
            token
                .iter()
                .filter(|ch| !ch.is_ascii_whitespace())
                .map(|ch| ch.to_ascii_lowercase() as char)
                .collect::<String>()
        })
        .unwrap_or_default();

    let mut attributes = Vec::new();
    for param in sections {
        if let Some(eq) = memchr(b'=', &param) {
            let name = trim_end(trim_start(&param[..eq]));
            let value = unquote(trim_end(trim_start(&param[eq + 1..])));
            if !name.is_empty() {
                attributes.push((
                    name.iter().map(|ch| ch.to_ascii_lowercase() as char).collect(),
                    value,
                ));
            }
        }
    }

    ContentType { ctype, attributes }
}

// Splits on ';' outside of quoted strings.
fn split_params(value: &[u8]) -> Vec<Vec<u8>> {
    let mut params = Vec::new();
    let mut current = Vec::new();
    let mut quoted = false;
    let mut escaped = false;

    for &ch in value {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if quoted && ch == b'\\' {
            current.push(ch);
            escaped = true;
        } else if ch == b'"' {
            current.push(ch);
            quoted = !quoted;
        } else if ch == b';' && !quoted {
            params.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    params.push(current);
    params
}

fn unquote(value: &[u8]) -> String {
    let inner = if value.len() >= 2 && value.first() == Some(&b'"') && value.last() == Some(&b'"')
    {
        &value[1..value.len() - 1]
    } else {
        value
    };

    let mut out = Vec::with_capacity(inner.len());
    let mut escaped = false;
    for &ch in inner {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == b'\\' {
            escaped = true;
        } else if ch != b'\n' && ch != b'\r' {
            out.push(ch);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Body decoder selected by Content-Transfer-Encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7bit, 8bit or binary: bytes pass through untouched.
    #[default]
    Identity,
    QuotedPrintable,
    Base64,
    /// Recognized header with an unsupported encoding; the body cannot be
    /// decoded and is skipped by the search.
    Unknown,
}

pub fn parse_transfer_encoding(value: &[u8]) -> TransferEncoding {
    let token = trim_end(trim_start(value));
    if token.eq_ignore_ascii_case(b"7bit")
        || token.eq_ignore_ascii_case(b"8bit")
        || token.eq_ignore_ascii_case(b"binary")
    {
        TransferEncoding::Identity
    } else if token.eq_ignore_ascii_case(b"base64") {
        TransferEncoding::Base64
    } else if token.eq_ignore_ascii_case(b"quoted-printable") {
        TransferEncoding::QuotedPrintable
    } else {
        TransferEncoding::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;

    fn fields_of(raw: &[u8]) -> (Vec<(String, String)>, HeaderRegion) {
        let mut stream = Stream::new(raw);
        let mut fields = Vec::new();
        let region = parse_header_fields(&mut stream, |name, value| {
            fields.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        })
        .unwrap();
        (fields, region)
    }

    #[test]
    fn parse_fields() {
        let (fields, region) = fields_of(
            b"Subject: hello\r\nContent-Type: text/plain;\r\n charset=utf-8\r\nX-Odd:\r\n\r\nbody",
        );

        assert_eq!(
            fields,
            [
                ("Subject".to_string(), "hello".to_string()),
                (
                    "Content-Type".to_string(),
                    "text/plain;\n charset=utf-8".to_string()
                ),
                ("X-Odd".to_string(), "".to_string()),
            ]
        );
        // everything up to and including the blank line
        assert_eq!(region.size.physical_size, 69);
        assert_eq!(region.size.virtual_size, 69);
        assert_eq!(region.lines, 5);
    }

    #[test]
    fn bare_lf_sizes() {
        let (_, region) = fields_of(b"A: b\nC: d\n\nrest");

        assert_eq!(region.size.physical_size, 11);
        assert_eq!(region.size.virtual_size, 14);
        assert_eq!(region.size.lines, 0);
        assert_eq!(region.lines, 3);
    }

    #[test]
    fn headers_without_separator_run_to_eof() {
        let (fields, region) = fields_of(b"A: b\nC: d");

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1], ("C".to_string(), "d".to_string()));
        assert_eq!(region.size.physical_size, 9);
        assert_eq!(region.size.virtual_size, 10);
    }

    #[test]
    fn empty_input() {
        let (fields, region) = fields_of(b"");

        assert!(fields.is_empty());
        assert_eq!(region.size, MessageSize::default());
    }

    #[test]
    fn content_type_values() {
        let ct = parse_content_type(b"multipart/mixed; boundary=\"simple boundary\"");
        assert_eq!(ct.ctype, "multipart/mixed");
        assert_eq!(ct.main_type(), "multipart");
        assert_eq!(ct.subtype(), Some("mixed"));
        assert_eq!(ct.attribute("boundary"), Some("simple boundary"));

        let ct = parse_content_type(b"Text/Plain;\n CHARSET=ISO-8859-1");
        assert_eq!(ct.ctype, "text/plain");
        assert_eq!(ct.attribute("charset"), Some("ISO-8859-1"));

        let ct = parse_content_type(b"text/plain; note=\"semi;colon\"; charset=x");
        assert_eq!(ct.attribute("note"), Some("semi;colon"));
        assert_eq!(ct.attribute("charset"), Some("x"));

        // quoted parameter values decode as UTF-8
        let ct = parse_content_type(b"image/gif; name=\"caf\xc3\xa9 tables.gif\"");
        assert_eq!(ct.attribute("name"), Some("café tables.gif"));

        let ct = parse_content_type(b"");
        assert_eq!(ct.ctype, "");
        assert!(ct.attributes.is_empty());
    }

    #[test]
    fn transfer_encodings() {
        for (value, expected) in [
            (&b"7bit"[..], TransferEncoding::Identity),
            (b"8BIT", TransferEncoding::Identity),
            (b"binary", TransferEncoding::Identity),
            (b" Base64 ", TransferEncoding::Base64),
            (b"Quoted-Printable", TransferEncoding::QuotedPrintable),
            (b"uuencode", TransferEncoding::Unknown),
            (b"x-token", TransferEncoding::Unknown),
        ] {
            assert_eq!(
                parse_transfer_encoding(value),
                expected,
                "Failed for {value:?}"
            );
        }
    }
}
