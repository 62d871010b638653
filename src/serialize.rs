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

//! Cache-blob serialization of the part tree.
//!
//! The format is a fixed-layout, host-endian, packed encoding intended as
//! a local cache, not an interchange format. Per part, depth-first with
//! parents before children:
//!
//! ```text
//! flags            : u32
//! physical_pos     : u64   (omitted for the root)
//! hdr_physical     : u64
//! hdr_virtual      : u64
//! body_physical    : u64
//! body_virtual     : u64
//! body_lines       : u32   (iff TEXT or MESSAGE_RFC822)
//! children_count   : u32   (iff MULTIPART or MESSAGE_RFC822)
//! <child records>
//! ```
//!
//! No version tag is embedded; the caller invalidates cached blobs when
//! the host or software changes.

use crate::{MessagePart, MessageSize, PartFlags, PartId, PartKind, PartTree};

// smallest possible record: root flags plus four sizes
const MINIMUM_SERIALIZED_SIZE: usize = 4 + 8 * 4;

/// A blob that does not describe a valid part tree; each variant names
/// the violated constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeserializeError {
    #[error("not enough data")]
    Truncated,
    #[error("too much data")]
    TrailingData,
    #[error("physical position less than expected")]
    PositionBeforeParent,
    #[error("header virtual size smaller than physical size")]
    HeaderVirtualTooSmall,
    #[error("body virtual size smaller than physical size")]
    BodyVirtualTooSmall,
    #[error("message/rfc822 part has no children")]
    Rfc822NoChild,
    #[error("message/rfc822 part has multiple children")]
    Rfc822ManyChildren,
    #[error("child part location exceeds parent size")]
    ChildExceedsParent,
    #[error("part sizes overflow the offset range")]
    SizeOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("not enough data")]
    Truncated,
    #[error("header size exceeds the signed offset range")]
    HeaderTooLarge,
    #[error("stored physical position is invalid")]
    InvalidOffset,
    #[error("patched physical position exceeds the signed offset range")]
    OffsetOverflow,
    #[error("blob layout does not match its record sizes")]
    InvalidLayout,
}

fn record_size(flags: PartFlags) -> usize {
    let mut size = 4 + 8 * 5;
    if flags.has_lines_field() {
        size += 4;
    }
    if flags.has_children_field() {
        size += 4;
    }
    size
}

/// Packs the tree into its cache-blob form.
pub fn serialize(tree: &PartTree) -> Vec<u8> {
    let mut out = Vec::with_capacity(tree.len() * record_size(PartFlags::default()));
    serialize_part(tree, 0, true, &mut out);
    out
}

fn serialize_part(tree: &PartTree, id: PartId, root: bool, out: &mut Vec<u8>) {
    let part = tree.part(id);

    out.extend_from_slice(&part.flags.bits().to_ne_bytes());
    if !root {
        out.extend_from_slice(&part.physical_pos.to_ne_bytes());
    }
    out.extend_from_slice(&part.header_size.physical_size.to_ne_bytes());
    out.extend_from_slice(&part.header_size.virtual_size.to_ne_bytes());
    out.extend_from_slice(&part.body_size.physical_size.to_ne_bytes());
    out.extend_from_slice(&part.body_size.virtual_size.to_ne_bytes());

    if part.flags.has_lines_field() {
        out.extend_from_slice(&part.body_size.lines.to_ne_bytes());
    }

    if part.flags.has_children_field() {
        // backpatched once the children are emitted
        let count_at = out.len();
        out.extend_from_slice(&0u32.to_ne_bytes());

        let mut count = 0u32;
        for &child in part.children() {
            serialize_part(tree, child, false, out);
            count += 1;
        }
        out[count_at..count_at + 4].copy_from_slice(&count.to_ne_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_u32(&mut self) -> Result<u32, DeserializeError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(DeserializeError::Truncated)?;
        self.pos += 4;
        Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, DeserializeError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 8)
            .ok_or(DeserializeError::Truncated)?;
        self.pos += 8;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }
}

/// Unpacks a cache blob, validating every structural invariant of the
/// part tree along the way. Trailing bytes are rejected.
pub fn deserialize(data: &[u8]) -> Result<PartTree, DeserializeError> {
    let mut reader = Reader { data, pos: 0 };
    let mut parts = Vec::new();

    read_part(&mut reader, &mut parts, None, 0)?;
    if reader.pos != data.len() {
        return Err(DeserializeError::TrailingData);
    }

    Ok(PartTree { parts })
}

fn read_part(
    reader: &mut Reader,
    parts: &mut Vec<MessagePart>,
    parent: Option<PartId>,
    min_pos: u64,
) -> Result<PartId, DeserializeError> {
    let flags = PartFlags::from_bits(reader.read_u32()?);
    let physical_pos = if parent.is_none() {
        0
    } else {
        reader.read_u64()?
    };
    if physical_pos < min_pos {
        return Err(DeserializeError::PositionBeforeParent);
    }

    let header_size = MessageSize {
        physical_size: reader.read_u64()?,
        virtual_size: reader.read_u64()?,
        lines: 0,
    };
    if header_size.virtual_size < header_size.physical_size {
        return Err(DeserializeError::HeaderVirtualTooSmall);
    }

    let mut body_size = MessageSize {
        physical_size: reader.read_u64()?,
        virtual_size: reader.read_u64()?,
        lines: 0,
    };
    if body_size.virtual_size < body_size.physical_size {
        return Err(DeserializeError::BodyVirtualTooSmall);
    }
    if flags.has_lines_field() {
        body_size.lines = reader.read_u32()?;
    }

    let end_pos = physical_pos
        .checked_add(header_size.physical_size)
        .and_then(|at| at.checked_add(body_size.physical_size))
        .ok_or(DeserializeError::SizeOverflow)?;

    let id = parts.len();
    parts.push(MessagePart {
        flags,
        physical_pos,
        header_size,
        body_size,
        parent,
        kind: PartKind::Leaf,
    });

    if flags.has_children_field() {
        let children_count = reader.read_u32()?;
        if flags.contains(PartFlags::MESSAGE_RFC822) {
            match children_count {
                0 => return Err(DeserializeError::Rfc822NoChild),
                1 => (),
                _ => return Err(DeserializeError::Rfc822ManyChildren),
            }
        }

        // children must lie after our start, in order, within our span
        let mut next_min = physical_pos;
        let mut children = Vec::with_capacity(children_count as usize);
        for _ in 0..children_count {
            let child = read_part(reader, parts, Some(id), next_min)?;
            let child_end = parts[child].end_pos();
            if child_end > end_pos {
                return Err(DeserializeError::ChildExceedsParent);
            }
            next_min = child_end;
            children.push(child);
        }

        parts[id].kind = if flags.contains(PartFlags::MESSAGE_RFC822) {
            PartKind::Message(children[0])
        } else {
            PartKind::Multipart(children)
        };
    }

    Ok(id)
}

/// Reads the root's header and body sizes without parsing children.
pub fn peek_sizes(data: &[u8]) -> Result<(MessageSize, MessageSize), DeserializeError> {
    if data.len() < MINIMUM_SERIALIZED_SIZE {
        return Err(DeserializeError::Truncated);
    }

    let mut reader = Reader { data, pos: 0 };
    let flags = PartFlags::from_bits(reader.read_u32()?);
    let header_size = MessageSize {
        physical_size: reader.read_u64()?,
        virtual_size: reader.read_u64()?,
        lines: 0,
    };
    let mut body_size = MessageSize {
        physical_size: reader.read_u64()?,
        virtual_size: reader.read_u64()?,
        lines: 0,
    };
    if flags.has_lines_field() {
        body_size.lines = reader.read_u32()?;
    }

    Ok((header_size, body_size))
}

/// Rewrites the root's header size in place and shifts every non-root
/// part position by the difference, for when a rewritten header grows or
/// shrinks and the body moves.
///
/// Offsets stay within the signed 64-bit range used for position
/// arithmetic; a blob whose records do not add up exactly is rejected
/// untouched or, past the root record, mid-way (the caller re-parses on
/// error either way).
pub fn patch_header_size(data: &mut [u8], header_size: &MessageSize) -> Result<(), PatchError> {
    if data.len() < MINIMUM_SERIALIZED_SIZE {
        return Err(PatchError::Truncated);
    }
    if header_size.physical_size > i64::MAX as u64 {
        return Err(PatchError::HeaderTooLarge);
    }

    let root_flags = PartFlags::from_bits(u32::from_ne_bytes(data[0..4].try_into().unwrap()));
    let old_physical = u64::from_ne_bytes(data[4..12].try_into().unwrap());
    if old_physical > i64::MAX as u64 {
        return Err(PatchError::InvalidOffset);
    }
    let diff = header_size.physical_size as i64 - old_physical as i64;

    data[4..12].copy_from_slice(&header_size.physical_size.to_ne_bytes());
    data[12..20].copy_from_slice(&header_size.virtual_size.to_ne_bytes());

    if diff != 0 {
        // walk every non-root record; the root one has no physical_pos
        let mut offset = record_size(root_flags) - 8;

        while offset + 4 < data.len() {
            let flags =
                PartFlags::from_bits(u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap()));
            let part_size = record_size(flags);
            if offset + part_size > data.len() {
                return Err(PatchError::Truncated);
            }

            let pos_at = offset + 4;
            let position = u64::from_ne_bytes(data[pos_at..pos_at + 8].try_into().unwrap());
            if position < old_physical || position > i64::MAX as u64 {
                return Err(PatchError::InvalidOffset);
            }
            let patched = position as i128 + diff as i128;
            if patched < 0 || patched > i64::MAX as i128 {
                return Err(PatchError::OffsetOverflow);
            }
            data[pos_at..pos_at + 8].copy_from_slice(&(patched as u64).to_ne_bytes());

            offset += part_size;
        }

        if offset != data.len() {
            return Err(PatchError::InvalidLayout);
        }
    }

    Ok(())
}
