//! A point-in-time, read-only view of an [`Engine`]'s content, read back
//! chunk by chunk.
//!
//! [`Snapshot`] borrows the engine's buffer pool rather than copying it, so
//! it cannot outlive the engine it was taken from; it does not track
//! subsequent edits, so reading it after the engine changes still yields
//! the content as it stood at `create_snapshot` time.

use crate::buffer::BufferPool;
use crate::piece::{self, Piece};

pub struct Snapshot<'a> {
    pieces: Vec<Piece>,
    bom: Vec<u8>,
    bom_read: bool,
    index: usize,
    buffers: &'a BufferPool,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn new(pieces: Vec<Piece>, bom: Vec<u8>, buffers: &'a BufferPool) -> Snapshot<'a> {
        Snapshot {
            pieces,
            bom,
            bom_read: false,
            index: 0,
            buffers,
        }
    }

    /// Returns the next chunk of content, or `None` once every piece has
    /// been read. The first call, if there's a BOM, returns it prepended
    /// to the first piece's content rather than on its own.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        let mut out = if !self.bom_read {
            self.bom_read = true;
            std::mem::take(&mut self.bom)
        } else {
            Vec::new()
        };

        let Some(piece) = self.pieces.get(self.index).copied() else {
            return if out.is_empty() { None } else { Some(out) };
        };
        self.index += 1;

        let buf = self.buffers.get(piece.buffer_index);
        let start = piece::offset_in_buffer(buf, piece.start) as usize;
        let end = start + piece.length as usize;
        out.extend_from_slice(&buf.buffer[start..end]);
        Some(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn reads_bom_then_pieces_then_ends() {
        let mut engine = Engine::new();
        engine.insert(0, b"aaa", true);
        engine.insert(3, b"bbb", true);

        let mut snapshot = engine.create_snapshot(vec![0xEF, 0xBB, 0xBF]);
        let mut out = Vec::new();
        while let Some(chunk) = snapshot.read() {
            out.extend(chunk);
        }
        assert_eq!(b"\xEF\xBB\xBFaaabbb".to_vec(), out);
    }

    #[test]
    fn empty_bom_is_skipped() {
        let mut engine = Engine::new();
        engine.insert(0, b"x", true);

        let mut snapshot = engine.create_snapshot(Vec::new());
        assert_eq!(Some(b"x".to_vec()), snapshot.read());
        assert_eq!(None, snapshot.read());
    }

    #[test]
    fn empty_engine_yields_no_pieces() {
        let engine = Engine::new();
        let mut snapshot = engine.create_snapshot(Vec::new());
        assert_eq!(None, snapshot.read());
    }
}
