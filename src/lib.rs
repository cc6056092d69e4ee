//! In-memory piece-tree text buffer.
//!
//! Content lives across an append-only change buffer and zero or more
//! immutable original buffers, addressed through a red-black tree of
//! [`Piece`](piece::Piece)s augmented with per-subtree byte-length and
//! line-feed aggregates. That augmentation keeps every positional
//! operation (`(line, column)` <-> byte offset, line content, insert,
//! delete) logarithmic in the number of pieces, independent of document
//! size.
//!
//! Build a document incrementally with [`PieceTreeBuilder`], which hands
//! off to a [`Factory`] that chooses the document's end-of-line sequence;
//! edit and query it through [`Engine`]; read a point-in-time copy through
//! [`Snapshot`].

mod builder;
mod buffer;
mod cache;
mod engine;
mod line_starts;
mod piece;
mod snapshot;
mod tree;

pub use builder::{Factory, PieceTreeBuilder};
pub use engine::{Engine, Eol, AVERAGE_BUFFER_SIZE, BOM};
pub use snapshot::Snapshot;
