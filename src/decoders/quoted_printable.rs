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

#[inline(always)]
fn hex_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}

/// Decodes quoted-printable input into `out` and returns the number of
/// input bytes consumed.
///
/// Soft line breaks (`=\n`, `=\r\n`) are dropped; `=XX` sequences that are
/// not valid hex pass through verbatim, matching widely-deployed
/// permissive behavior. An escape split at the end of the input is left
/// unconsumed so streaming callers can retry with more data.
pub fn decode(input: &[u8], out: &mut Vec<u8>) -> usize {
    let mut pos = 0;

    while pos < input.len() {
        let ch = input[pos];
        if ch != b'=' {
            out.push(ch);
            pos += 1;
            continue;
        }

        match input.get(pos + 1) {
            None => break,
            Some(b'\n') => {
                pos += 2;
            }
            Some(b'\r') => match input.get(pos + 2) {
                None => break,
                Some(b'\n') => pos += 3,
                Some(_) => {
                    out.push(b'=');
                    pos += 1;
                }
            },
            Some(&hex1) => match input.get(pos + 2) {
                None => break,
                Some(&hex2) => match (hex_digit(hex1), hex_digit(hex2)) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        pos += 3;
                    }
                    _ => {
                        out.push(b'=');
                        pos += 1;
                    }
                },
            },
        }
    }

    pos
}

/// Decodes the text of an RFC 2047 Q encoded word, where `_` stands for a
/// space. Trailing partial escapes pass through verbatim.
pub fn decode_q_word(input: &[u8], out: &mut Vec<u8>) {
    let mut pos = 0;
    while pos < input.len() {
        let ch = input[pos];
        if ch == b'_' {
            out.push(b' ');
            pos += 1;
        } else if ch == b'=' {
            match (
                input.get(pos + 1).copied().and_then(hex_digit),
                input.get(pos + 2).copied().and_then(hex_digit),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push((hi << 4) | lo);
                    pos += 3;
                }
                _ => {
                    out.push(b'=');
                    pos += 1;
                }
            }
        } else {
            out.push(ch);
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn decode_quoted_printable() {
        for (encoded_str, expected_result, expected_consumed) in [
            ("=68=65=6Clo", "hello", 11),
            (
                "J'interdis aux marchands de vanter trop leurs marchandises. Car ils se font=\nvite p=C3=A9dagogues",
                "J'interdis aux marchands de vanter trop leurs marchandises. Car ils se fontvite pédagogues",
                97,
            ),
            (
                "=E2=80=94=E2=80=89Antoine de Saint-Exup=C3=A9ry",
                "\u{2014}\u{2009}Antoine de Saint-Exupéry",
                47,
            ),
            ("soft=\r\nbreak", "softbreak", 12),
            ("soft=\nbreak", "softbreak", 11),
            // malformed escapes pass through verbatim
            ("=XYtail", "=XYtail", 7),
            ("=A", "", 0),
            ("=", "", 0),
            ("tail=", "tail", 4),
            ("tail=\r", "tail", 4),
            ("keep=3", "keep", 4),
            ("", "", 0),
        ] {
            let mut out = Vec::new();
            let consumed = super::decode(encoded_str.as_bytes(), &mut out);

            assert_eq!(
                out,
                expected_result.as_bytes(),
                "Failed for {encoded_str:?}"
            );
            assert_eq!(consumed, expected_consumed, "Failed for {encoded_str:?}");
        }
    }

    #[test]
    fn decode_q_encoded_word() {
        for (encoded_str, expected_result) in [
            (&b"this=20is=20some=20text"[..], &b"this is some text"[..]),
            (b"Keith_Moore", b"Keith Moore"),
            (b"Patrik_F=E4ltstr=F6m", b"Patrik F\xe4ltstr\xf6m"),
            (b"bad=Zescape", b"bad=Zescape"),
            (b"trailing=", b"trailing="),
        ] {
            let mut out = Vec::new();
            super::decode_q_word(encoded_str, &mut out);

            assert_eq!(out, expected_result, "Failed for {encoded_str:?}");
        }
    }
}
