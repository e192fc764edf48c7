//! Field-offset schema of arena records.
//!
//! Every structure in the arena is a fixed-width run of `f64` fields at
//! some base [`Offset`]. The constants in this module name the fields of
//! each record kind; they are the interface physics, geometry and
//! statistics collaborators use to read and write particles directly.
//!
//! ```text
//! list item   [PREV][NEXT][COMMON][DIRECT][ payload ........ ]
//! list common [ITEM_SIZE][ROOT][FIRST][LAST][N_ITEMS][DIRECT]
//! particle    [ list header ][SPECIES][DOMAIN][MULTIPLICITY][X]...[GENERATION]
//! ```
//!
//! Offsets stored inside records are exact integers in `f64`; the null
//! offset is [`NULL`].

use crate::id::Offset;

/// Encoded null offset.
pub const NULL: f64 = -1.0;

/// Largest offset that round-trips exactly through an `f64` field.
pub const MAX_ENCODABLE_OFFSET: Offset = (1 << 53) - 1;

/// Encode an optional offset for storage in a record field.
pub fn encode_offset(offset: Option<Offset>) -> f64 {
    match offset {
        Some(o) => o as f64,
        None => NULL,
    }
}

/// Decode a record field written by [`encode_offset`].
///
/// Negative values decode to `None`.
pub fn decode_offset(value: f64) -> Option<Offset> {
    if value < 0.0 {
        None
    } else {
        Some(value as Offset)
    }
}

/// Header shared by every item of an intrusive list.
pub mod list {
    /// Previous item, or null at the head.
    pub const PREV: usize = 0;
    /// Next item, or null at the tail.
    pub const NEXT: usize = 1;
    /// Back-reference to the list's common block.
    pub const COMMON: usize = 2;
    /// Slot in the direct-index array once the list is closed.
    pub const DIRECT: usize = 3;
    /// Number of header fields; payload starts here.
    pub const HEADER_SIZE: usize = 4;
}

/// One common block per list.
pub mod common {
    /// Size of every item in the list, header included.
    pub const ITEM_SIZE: usize = 0;
    /// Offset of the root slot that names the first item.
    pub const ROOT: usize = 1;
    /// First item.
    pub const FIRST: usize = 2;
    /// Last item.
    pub const LAST: usize = 3;
    /// Number of linked items.
    pub const N_ITEMS: usize = 4;
    /// Direct-index array, null until the list is closed.
    pub const DIRECT: usize = 5;
    /// Size of the common block.
    pub const BLOCK_SIZE: usize = 6;
}

/// Particle record layout.
pub mod particle {
    use super::list::HEADER_SIZE;

    /// Species tag, see [`Species::tag`](crate::Species::tag).
    pub const SPECIES: usize = HEADER_SIZE;
    /// Owning spatial domain.
    pub const DOMAIN: usize = HEADER_SIZE + 1;
    /// Number of identical histories this entry stands for.
    pub const MULTIPLICITY: usize = HEADER_SIZE + 2;
    /// Position x.
    pub const X: usize = HEADER_SIZE + 3;
    /// Position y.
    pub const Y: usize = HEADER_SIZE + 4;
    /// Position z.
    pub const Z: usize = HEADER_SIZE + 5;
    /// Direction cosine u.
    pub const U: usize = HEADER_SIZE + 6;
    /// Direction cosine v.
    pub const V: usize = HEADER_SIZE + 7;
    /// Direction cosine w.
    pub const W: usize = HEADER_SIZE + 8;
    /// Kinetic energy.
    pub const ENERGY: usize = HEADER_SIZE + 9;
    /// Statistical weight.
    pub const WEIGHT: usize = HEADER_SIZE + 10;
    /// Time since the source event.
    pub const TIME: usize = HEADER_SIZE + 11;
    /// History index assigned by the source.
    pub const HISTORY: usize = HEADER_SIZE + 12;
    /// Fission generation counter.
    pub const GENERATION: usize = HEADER_SIZE + 13;
    /// Total record size.
    pub const BLOCK_SIZE: usize = HEADER_SIZE + 14;
    /// Fields carried on the wire and in checkpoints (record minus list header).
    pub const PAYLOAD_LEN: usize = BLOCK_SIZE - HEADER_SIZE;
}
