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

use encoding_rs::{DecoderResult, Encoding};

/// Outcome of one conversion call that made progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    /// All input was consumed.
    Full,
    /// The output budget ran out; retry with the unconsumed input.
    OutputFull,
    /// The final `tail` input bytes are the prefix of a multi-byte
    /// sequence; carry them over and resume with the next block.
    Incomplete { tail: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CharsetError {
    #[error("unknown charset")]
    UnknownCharset,
    #[error("input not valid in its declared charset")]
    InvalidInput,
}

enum Kind {
    /// Input is already UTF-8 (or claimed to be); validate and uppercase.
    Utf8,
    /// Uppercase ASCII, pass everything else through untouched.
    Ascii,
    /// Streaming conversion through encoding_rs.
    Multi(encoding_rs::Decoder),
}

/// Converts bytes of one declared charset into upper-cased UTF-8.
///
/// Conversions are block-oriented: the caller feeds consecutive slices of
/// the input and an output budget per call. A translation holds no state
/// other than the multi-byte decoder position, so creating one per message
/// part is cheap.
pub struct Translation {
    kind: Kind,
}

impl Translation {
    /// `None` means the input is assumed UTF-8 and is only uppercased.
    pub fn new(charset: Option<&str>) -> Result<Translation, CharsetError> {
        let kind = match charset {
            None => Kind::Utf8,
            Some(name) => {
                let name = name.trim();
                if name.eq_ignore_ascii_case("utf-8") || name.eq_ignore_ascii_case("utf8") {
                    Kind::Utf8
                } else if name.eq_ignore_ascii_case("us-ascii")
                    || name.eq_ignore_ascii_case("ascii")
                {
                    Kind::Ascii
                } else {
                    match Encoding::for_label(name.as_bytes()) {
                        Some(encoding) if encoding == encoding_rs::UTF_8 => Kind::Utf8,
                        Some(encoding) => Kind::Multi(encoding.new_decoder()),
                        None => return Err(CharsetError::UnknownCharset),
                    }
                }
            }
        };
        Ok(Translation { kind })
    }

    /// Converts a block of `input`, appending upper-cased UTF-8 to `out`,
    /// and returns how many input bytes were consumed. `cap` bounds how
    /// much input is processed per call so callers can keep their scan
    /// buffers small.
    pub fn to_ucase_utf8(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        cap: usize,
    ) -> Result<(usize, Convert), CharsetError> {
        match &mut self.kind {
            Kind::Utf8 => {
                let chunk = input.len().min(cap.max(4));
                match std::str::from_utf8(&input[..chunk]) {
                    Ok(text) => {
                        push_upper(text, out);
                        if chunk < input.len() {
                            Ok((chunk, Convert::OutputFull))
                        } else {
                            Ok((chunk, Convert::Full))
                        }
                    }
                    Err(error) => {
                        let valid = error.valid_up_to();
                        if error.error_len().is_some() {
                            return Err(CharsetError::InvalidInput);
                        }
                        // incomplete sequence at the end of the chunk
                        push_upper(
                            std::str::from_utf8(&input[..valid]).unwrap_or_default(),
                            out,
                        );
                        if chunk < input.len() {
                            Ok((valid, Convert::OutputFull))
                        } else {
                            Ok((
                                valid,
                                Convert::Incomplete {
                                    tail: input.len() - valid,
                                },
                            ))
                        }
                    }
                }
            }
            Kind::Ascii => {
                let chunk = input.len().min(cap.max(1));
                out.extend(input[..chunk].iter().map(|ch| ch.to_ascii_uppercase()));
                if chunk < input.len() {
                    Ok((chunk, Convert::OutputFull))
                } else {
                    Ok((chunk, Convert::Full))
                }
            }
            Kind::Multi(decoder) => {
                let mut text = String::with_capacity(cap.max(16));
                let (result, read) =
                    decoder.decode_to_string_without_replacement(input, &mut text, false);
                push_upper(&text, out);
                match result {
                    DecoderResult::InputEmpty => Ok((read, Convert::Full)),
                    DecoderResult::OutputFull => Ok((read, Convert::OutputFull)),
                    DecoderResult::Malformed(..) => Err(CharsetError::InvalidInput),
                }
            }
        }
    }

    /// Signals the end of the input; an incomplete trailing sequence held
    /// by a multi-byte decoder becomes an error here.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), CharsetError> {
        if let Kind::Multi(decoder) = &mut self.kind {
            let mut text = String::with_capacity(16);
            let (result, _) = decoder.decode_to_string_without_replacement(b"", &mut text, true);
            push_upper(&text, out);
            if matches!(result, DecoderResult::Malformed(..)) {
                return Err(CharsetError::InvalidInput);
            }
        }
        Ok(())
    }
}

fn push_upper(text: &str, out: &mut Vec<u8>) {
    let mut scratch = [0u8; 4];
    for ch in text.chars() {
        if ch.is_ascii() {
            out.push(ch.to_ascii_uppercase() as u8);
        } else {
            for upper in ch.to_uppercase() {
                out.extend_from_slice(upper.encode_utf8(&mut scratch).as_bytes());
            }
        }
    }
}

/// One-shot conversion used to prepare search keys. An incomplete
/// trailing sequence is invalid input here.
pub fn to_ucase_utf8_string(
    charset: Option<&str>,
    input: &[u8],
) -> Result<Vec<u8>, CharsetError> {
    let mut translation = Translation::new(charset)?;
    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;

    while pos < input.len() {
        let (consumed, state) =
            translation.to_ucase_utf8(&input[pos..], &mut out, input.len())?;
        pos += consumed;
        match state {
            Convert::Full => break,
            Convert::OutputFull => continue,
            Convert::Incomplete { .. } => return Err(CharsetError::InvalidInput),
        }
    }
    translation.finish(&mut out)?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{to_ucase_utf8_string, CharsetError, Convert, Translation};

    #[test]
    fn ucase_utf8_string() {
        for (charset, input, expected) in [
            (None, &b"hello world"[..], &b"HELLO WORLD"[..]),
            (None, "café".as_bytes(), "CAFÉ".as_bytes()),
            (Some("utf-8"), "straße".as_bytes(), "STRASSE".as_bytes()),
            (Some("us-ascii"), b"MiXeD case", b"MIXED CASE"),
            (
                Some("iso-8859-1"),
                &b"caf\xe9"[..],
                "CAFÉ".as_bytes(),
            ),
            (
                Some("windows-1251"),
                &b"\xef\xf0\xe8\xe2\xe5\xf2"[..],
                "ПРИВЕТ".as_bytes(),
            ),
            (Some("ascii"), &b"high \xffbyte"[..], &b"HIGH \xffBYTE"[..]),
        ] {
            assert_eq!(
                to_ucase_utf8_string(charset, input).unwrap(),
                expected,
                "Failed for {charset:?} {input:?}"
            );
        }
    }

    #[test]
    fn unknown_and_invalid() {
        assert_eq!(
            to_ucase_utf8_string(Some("x-wat"), b"abc"),
            Err(CharsetError::UnknownCharset)
        );
        assert_eq!(
            to_ucase_utf8_string(None, b"broken \xff utf8"),
            Err(CharsetError::InvalidInput)
        );
        // truncated multi-byte tail is invalid in a one-shot conversion
        assert_eq!(
            to_ucase_utf8_string(None, &"café".as_bytes()[..4]),
            Err(CharsetError::InvalidInput)
        );
    }

    #[test]
    fn incomplete_tail_is_reported() {
        let input = "motörhead".as_bytes();
        let cut = 4; // inside the ö sequence

        let mut translation = Translation::new(None).unwrap();
        let mut out = Vec::new();
        let (consumed, state) = translation
            .to_ucase_utf8(&input[..cut], &mut out, 8192)
            .unwrap();

        assert_eq!(consumed, 3);
        assert_eq!(state, Convert::Incomplete { tail: 1 });
        assert_eq!(out, b"MOT");

        // carry the tail and resume
        let mut carry = input[consumed..cut].to_vec();
        carry.extend_from_slice(&input[cut..]);
        let (consumed, state) = translation.to_ucase_utf8(&carry, &mut out, 8192).unwrap();

        assert_eq!(consumed, carry.len());
        assert_eq!(state, Convert::Full);
        assert_eq!(out, "MOTÖRHEAD".as_bytes());
    }

    #[test]
    fn output_budget_is_respected() {
        let mut translation = Translation::new(None).unwrap();
        let mut out = Vec::new();
        let input = b"abcdefgh";

        let (consumed, state) = translation.to_ucase_utf8(input, &mut out, 4).unwrap();
        assert_eq!((consumed, state), (4, Convert::OutputFull));
        let (consumed, state) = translation.to_ucase_utf8(&input[4..], &mut out, 4).unwrap();
        assert_eq!((consumed, state), (4, Convert::Full));
        assert_eq!(out, b"ABCDEFGH");
    }
}
