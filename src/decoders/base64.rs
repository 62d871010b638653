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

/// The input contained a quartet that cannot be base64; `offset` is the
/// position of its first character, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("corrupt base64 quartet at offset {offset}")]
pub struct Base64Error {
    pub offset: usize,
}

const INVALID: i8 = -1;

const BASE64_REV: [i8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0u8;
    while i < 26 {
        table[(b'A' + i) as usize] = i as i8;
        table[(b'a' + i) as usize] = (i + 26) as i8;
        i += 1;
    }
    let mut i = 0u8;
    while i < 10 {
        table[(b'0' + i) as usize] = (i + 52) as i8;
        i += 1;
    }
    table[b'+' as usize] = 62;
    table[b'/' as usize] = 63;
    table
};

/// Decodes base64 input into `out`, four characters at a time after
/// discarding whitespace.
///
/// Returns the number of input bytes consumed; a partial quartet at the
/// end of the input is not consumed, so streaming callers retry with more
/// input appended. Padding (`=`) completes a quartet early.
pub fn decode(input: &[u8], out: &mut Vec<u8>) -> Result<usize, Base64Error> {
    let mut quartet = [0u8; 4];
    let mut len = 0;
    let mut pads = 0;
    let mut quartet_start = 0;
    let mut consumed = 0;

    for (pos, &ch) in input.iter().enumerate() {
        if ch.is_ascii_whitespace() {
            if len == 0 {
                consumed = pos + 1;
            }
            continue;
        }
        if len == 0 {
            quartet_start = pos;
        }

        if ch == b'=' {
            if len < 2 {
                return Err(Base64Error {
                    offset: quartet_start,
                });
            }
            pads += 1;
            len += 1;
        } else {
            let val = BASE64_REV[ch as usize];
            if val == INVALID || pads > 0 {
                return Err(Base64Error {
                    offset: quartet_start,
                });
            }
            quartet[len] = val as u8;
            len += 1;
        }

        if len == 4 {
            let chunk = (u32::from(quartet[0]) << 18)
                | (u32::from(quartet[1]) << 12)
                | (u32::from(quartet[2]) << 6)
                | u32::from(quartet[3]);
            out.push((chunk >> 16) as u8);
            if pads < 2 {
                out.push((chunk >> 8) as u8);
            }
            if pads == 0 {
                out.push(chunk as u8);
            }
            quartet = [0; 4];
            len = 0;
            pads = 0;
            consumed = pos + 1;
        }
    }

    Ok(consumed)
}

#[cfg(test)]
mod tests {
    #[test]
    fn decode_base64() {
        for (encoded_str, expected_result, expected_consumed) in [
            ("VGVzdA==", "Test", 8),
            ("WWU=", "Ye", 4),
            ("QQ==", "A", 4),
            ("cm8=", "ro", 4),
            (
                "QXJlIHlvdSBhIFNoaW1hbm8gb3IgQ2FtcGFnbm9sbyBwZXJzb24/",
                "Are you a Shimano or Campagnolo person?",
                52,
            ),
            ("w6HDqcOtw7PDug==", "áéíóú", 16),
            ("w6 HD qcOt", "áéí", 10),
            ("w\n6\nH\nD\nq\nc\nO\nt\nw\n7\n P\tD u g\n==", "áéíóú", 31),
            // partial tails stay unconsumed
            ("VGVzdA==V", "Test", 8),
            ("VGVzdA==VG\n", "Test", 8),
            ("VGV", "", 0),
            ("", "", 0),
            // whitespace outside a quartet counts as consumed
            ("VGVzdA==\r\n", "Test", 10),
            ("  \t\n", "", 4),
        ] {
            let mut out = Vec::new();
            let consumed = super::decode(encoded_str.as_bytes(), &mut out)
                .unwrap_or_else(|e| panic!("Failed for {encoded_str:?}: {e}"));

            assert_eq!(out, expected_result.as_bytes(), "Failed for {encoded_str:?}");
            assert_eq!(consumed, expected_consumed, "Failed for {encoded_str:?}");
        }
    }

    #[test]
    fn decode_base64_corrupt() {
        for (encoded_str, expected_offset) in [
            ("w6HD!cOt", 4),
            ("!", 0),
            ("AB=A", 0),
            ("A===", 0),
            ("áé", 0),
            ("VGVzdA==cm!!", 8),
        ] {
            let mut out = Vec::new();
            let err = super::decode(encoded_str.as_bytes(), &mut out)
                .expect_err(&format!("Expected corruption for {encoded_str:?}"));
            assert_eq!(
                err.offset, expected_offset,
                "Failed for {encoded_str:?}"
            );
        }
    }
}
