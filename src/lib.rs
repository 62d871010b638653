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

//! # mail-search
//!
//! _mail-search_ is the message-structure core of a mail store: it parses
//! RFC 822/MIME messages into a tree of parts with exact byte accounting,
//! serializes that tree into a compact cache blob so the expensive parse
//! happens at most once per message, and answers substring queries against
//! message headers and transfer-decoded, charset-converted body text.
//!
//! The crate operates on lazy byte streams rather than in-memory buffers,
//! so a multi-gigabyte mailbox can be searched without loading messages
//! whole. Three groups of functionality are exposed:
//!
//! - [`parsers::parse`] builds a [`PartTree`] from a stream, counting
//!   physical and virtual (CRLF-normalized) sizes and body lines per part.
//! - [`serialize`] packs a [`PartTree`] into a host-endian cache blob,
//!   validates and unpacks it again, patches part offsets in place when a
//!   rewritten header grows or shrinks, and reads the root sizes in O(1).
//! - [`search::search`] walks the tree over the raw message bytes,
//!   decoding quoted-printable/base64 leaves and converting charsets on
//!   the fly, to decide whether a key occurs anywhere in the message.
//!
//! Searching is best-effort by design: a part with a corrupt transfer
//! encoding or an unintelligible charset simply cannot match, while the
//! caller's key must always be in a known charset.

pub mod decoders;
pub mod parsers;
pub mod search;
pub mod serialize;
pub mod stream;

use std::ops::{BitAnd, BitOr, BitOrAssign};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Exact size of a header or body region.
///
/// The virtual size is the size the region would have with CRLF line
/// endings: the physical size plus one byte for every bare LF. It is never
/// smaller than the physical size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MessageSize {
    pub physical_size: u64,
    pub virtual_size: u64,
    pub lines: u32,
}

impl MessageSize {
    pub fn new(physical_size: u64, virtual_size: u64, lines: u32) -> Self {
        MessageSize {
            physical_size,
            virtual_size,
            lines,
        }
    }
}

/// Structural flags of a message part.
///
/// The set is carried verbatim in the cache blob; bits this version does
/// not interpret survive a round-trip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PartFlags(u32);

impl PartFlags {
    /// Content-Type is text/*, or the part has no Content-Type.
    pub const TEXT: PartFlags = PartFlags(1 << 0);
    /// The part encapsulates a nested message/rfc822.
    pub const MESSAGE_RFC822: PartFlags = PartFlags(1 << 1);
    /// Content-Type is multipart/*.
    pub const MULTIPART: PartFlags = PartFlags(1 << 2);
    /// Content-Type is multipart/signed.
    pub const MULTIPART_SIGNED: PartFlags = PartFlags(1 << 3);
    /// The Content-Type carried a boundary parameter.
    pub const HAS_BOUNDARY: PartFlags = PartFlags(1 << 4);

    #[inline(always)]
    pub fn contains(self, other: PartFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline(always)]
    pub fn intersects(self, other: PartFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline(always)]
    pub fn insert(&mut self, other: PartFlags) {
        self.0 |= other.0;
    }

    #[inline(always)]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn from_bits(bits: u32) -> PartFlags {
        PartFlags(bits)
    }

    /// True for parts that carry substructure on the wire.
    #[inline(always)]
    pub fn has_children_field(self) -> bool {
        self.intersects(PartFlags::MULTIPART.union(PartFlags::MESSAGE_RFC822))
    }

    /// True for parts whose body line count is recorded on the wire.
    #[inline(always)]
    pub fn has_lines_field(self) -> bool {
        self.intersects(PartFlags::TEXT.union(PartFlags::MESSAGE_RFC822))
    }

    #[inline(always)]
    pub const fn union(self, other: PartFlags) -> PartFlags {
        PartFlags(self.0 | other.0)
    }
}

impl BitOr for PartFlags {
    type Output = PartFlags;

    fn bitor(self, rhs: PartFlags) -> PartFlags {
        PartFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PartFlags {
    fn bitor_assign(&mut self, rhs: PartFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PartFlags {
    type Output = PartFlags;

    fn bitand(self, rhs: PartFlags) -> PartFlags {
        PartFlags(self.0 & rhs.0)
    }
}

/// Unique ID of a part within its owning [`PartTree`].
pub type PartId = usize;

/// Substructure of a message part.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PartKind {
    /// No substructure; the body is scanned directly.
    Leaf,
    /// multipart/*: zero or more children in ascending offset order.
    Multipart(Vec<PartId>),
    /// message/rfc822: exactly one child, the encapsulated message.
    Message(PartId),
}

impl Default for PartKind {
    fn default() -> Self {
        PartKind::Leaf
    }
}

/// One node of the structural message tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MessagePart {
    pub flags: PartFlags,
    /// Byte offset of the part within the containing stream; 0 for the root.
    pub physical_pos: u64,
    pub header_size: MessageSize,
    pub body_size: MessageSize,
    /// Back-reference into the owning tree; `None` for the root.
    pub parent: Option<PartId>,
    pub kind: PartKind,
}

impl MessagePart {
    /// Offset of the first body byte.
    #[inline(always)]
    pub fn body_pos(&self) -> u64 {
        self.physical_pos + self.header_size.physical_size
    }

    /// Offset one past the last body byte.
    #[inline(always)]
    pub fn end_pos(&self) -> u64 {
        self.physical_pos + self.header_size.physical_size + self.body_size.physical_size
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, PartKind::Leaf)
    }

    /// IDs of the direct children, in ascending offset order.
    pub fn children(&self) -> &[PartId] {
        match &self.kind {
            PartKind::Leaf => &[],
            PartKind::Multipart(children) => children,
            PartKind::Message(child) => std::slice::from_ref(child),
        }
    }
}

/// The structural tree of a parsed message.
///
/// Parts live in an arena in depth-first order with the root at index 0;
/// parent links and child lists are indices into that arena. The tree is
/// immutable once built, except through the cache-blob patch operation in
/// [`serialize`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PartTree {
    pub parts: Vec<MessagePart>,
}

impl PartTree {
    pub fn root(&self) -> &MessagePart {
        &self.parts[0]
    }

    pub fn part(&self, id: PartId) -> &MessagePart {
        &self.parts[id]
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total message span in physical bytes, for comparing against the
    /// on-disk length to detect truncated messages.
    pub fn total_size(&self) -> u64 {
        self.root().end_pos()
    }

    /// Parts in depth-first order, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = &MessagePart> {
        self.parts.iter()
    }
}
