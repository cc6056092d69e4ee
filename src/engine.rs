//! The piece-tree engine: owns the buffer pool and the augmented
//! red-black tree, and implements insertion, deletion, positional
//! lookups, and line-oriented reads.
//!
//! Splitting a piece always happens here, never inside [`Tree`]: only the
//! engine can translate an edit point into buffer-relative cursors. The
//! tree itself only ever sees whole pieces being inserted or removed, or
//! one node's piece replaced in place.

use log::{debug, trace};

use crate::buffer::{BufferPool, StringBuffer};
use crate::cache::{CacheEntry, SearchCache};
use crate::piece::{self, BufferCursor, Piece};
use crate::snapshot::Snapshot;
use crate::tree::iter::PieceIter;
use crate::tree::node::Node;
use crate::tree::Tree;

/// Pieces longer than this are split into their own original buffer
/// instead of living in the change buffer, so string ops on the change
/// buffer stay cheap no matter how much has been pasted into it.
pub const AVERAGE_BUFFER_SIZE: u64 = 65535;

pub const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// A document's chosen end-of-line sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eol {
    Lf,
    CrLf,
}

impl Eol {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Eol::Lf => b"\n",
            Eol::CrLf => b"\r\n",
        }
    }

    pub fn len(self) -> u64 {
        self.as_bytes().len() as u64
    }

    /// `None` for anything other than `"\n"` or `"\r\n"`; callers treat
    /// that as a no-op, matching [`Engine::set_eol`]'s silent-reject rule.
    pub fn parse(bytes: &[u8]) -> Option<Eol> {
        match bytes {
            b"\n" => Some(Eol::Lf),
            b"\r\n" => Some(Eol::CrLf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeAt {
    piece: Piece,
    remainder: u64,
    node_start_offset: u64,
}

/// The piece-tree document. Single-threaded: every public method
/// completes synchronously and leaves the tree fully consistent before
/// returning.
#[derive(Debug, Clone)]
pub struct Engine {
    buffers: BufferPool,
    tree: Tree,
    line_cnt: u64,
    length: u64,
    eol: Eol,
    eol_normalized: bool,
    last_change_buffer_pos: BufferCursor,
    search_cache: SearchCache,
    last_visited_line: Option<(u64, Vec<u8>)>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::from_chunks(Vec::new(), Eol::Lf, true)
    }

    /// Seeds the engine with `chunks` as immutable original buffers at
    /// indices `1..`, in order. Used by the builder/factory.
    pub(crate) fn from_chunks(chunks: Vec<StringBuffer>, eol: Eol, eol_normalized: bool) -> Engine {
        let mut buffers = BufferPool::new();
        let mut tree = Tree::new();
        let mut offset = 0u64;

        for chunk in chunks {
            if chunk.buffer.is_empty() {
                continue;
            }
            let index = buffers.push_original(chunk);
            let buf = buffers.get(index);
            let end_line = buf.line_count() - 1;
            let end_col = buf.len() - buf.line_starts[end_line as usize];
            let piece = Piece::new(
                index,
                BufferCursor::new(0, 0),
                BufferCursor::new(end_line, end_col),
                buf.len(),
                end_line,
            );
            tree.insert(offset, piece);
            offset += piece.length;
        }

        let mut engine = Engine {
            buffers,
            tree,
            line_cnt: 1,
            length: 0,
            eol,
            eol_normalized,
            last_change_buffer_pos: BufferCursor::new(0, 0),
            search_cache: SearchCache::default(),
            last_visited_line: None,
        };
        engine.compute_buffer_metadata();
        engine
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn line_count(&self) -> u64 {
        self.line_cnt
    }

    pub fn eol(&self) -> Eol {
        self.eol
    }

    pub fn is_eol_normalized(&self) -> bool {
        self.eol_normalized
    }

    /// No-op unless `bytes` is `"\n"` or `"\r\n"`. Rewrites every existing
    /// terminator in the document to the new EOL and marks the document
    /// normalized.
    pub fn set_eol(&mut self, bytes: &[u8]) {
        let Some(eol) = Eol::parse(bytes) else { return };
        self.eol = eol;
        self.normalize_eol(eol);
    }

    fn normalize_eol(&mut self, eol: Eol) {
        debug!("normalizing EOL to {:?}", eol);
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut current = Vec::new();

        let mut iter = PieceIter::new(&self.tree, 0);
        while let Some((_, p)) = iter.get() {
            current.extend_from_slice(self.piece_bytes(&p));
            if current.len() as u64 > AVERAGE_BUFFER_SIZE {
                chunks.push(std::mem::take(&mut current));
            }
            if iter.next().is_none() {
                break;
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let rewritten = chunks
            .into_iter()
            .map(|chunk| StringBuffer::new(rewrite_eol(&chunk, eol)))
            .collect();

        let rebuilt = Engine::from_chunks(rewritten, eol, true);
        self.buffers = rebuilt.buffers;
        self.tree = rebuilt.tree;
        self.line_cnt = rebuilt.line_cnt;
        self.length = rebuilt.length;
        self.last_change_buffer_pos = rebuilt.last_change_buffer_pos;
        let dropped = self.search_cache.clear();
        if dropped > 0 {
            debug!("search cache invalidated: {dropped} entries dropped by EOL normalization");
        }
        self.last_visited_line = None;
        self.eol_normalized = true;
    }

    pub fn equal(&self, other: &Engine) -> bool {
        if self.length != other.length || self.line_cnt != other.line_cnt {
            return false;
        }
        self.get_lines_raw_content() == other.get_lines_raw_content()
    }

    // ---- positional lookups -------------------------------------------------

    fn node_at(&mut self, offset: u64) -> Option<NodeAt> {
        if let Some(entry) = self.search_cache.get(offset) {
            return Some(NodeAt {
                piece: entry.piece,
                remainder: offset - entry.node_start_offset,
                node_start_offset: entry.node_start_offset,
            });
        }

        let (stack, node_start_offset) = self.tree.find_node(offset);
        let n = *stack.last()?;
        let result = NodeAt {
            piece: n.piece,
            remainder: offset - node_start_offset,
            node_start_offset,
        };
        self.search_cache.set(CacheEntry {
            piece: n.piece,
            node_start_offset,
            node_start_line: 0,
        });
        Some(result)
    }

    /// `nodeAt2`: the node, in-piece remainder, and start offset of the
    /// `column`-th byte (1-based) on `line` (1-based). The tricky part —
    /// `column` running past the piece that ends the target line — steps
    /// into successor pieces one at a time, mirroring the original's
    /// fallback search exactly so round-tripping stays precise.
    fn node_at2(&self, line: u64, column: u64) -> NodeAt {
        let mut line_number = line.max(1);
        let mut column = column.max(1);
        let mut node_start_offset = 0u64;
        let mut node = self.tree.root.as_ref();

        loop {
            match node {
                Node::Internal(n) => {
                    if !n.left.is_leaf() && n.left_metrics.lf >= line_number - 1 {
                        node = n.left.as_ref();
                    } else if n.left_metrics.lf + n.piece.line_feed_cnt > line_number - 1 {
                        let buf = self.buffers.get(n.piece.buffer_index);
                        let idx = line_number as i64 - n.left_metrics.lf as i64 - 2;
                        let prev = piece::accumulated_value(buf, &n.piece, idx);
                        let cur = piece::accumulated_value(buf, &n.piece, idx + 1);
                        return NodeAt {
                            piece: n.piece,
                            remainder: (prev + column - 1).min(cur),
                            node_start_offset: node_start_offset + n.left_metrics.len,
                        };
                    } else if n.left_metrics.lf + n.piece.line_feed_cnt == line_number - 1 {
                        let buf = self.buffers.get(n.piece.buffer_index);
                        let idx = line_number as i64 - n.left_metrics.lf as i64 - 2;
                        let prev = piece::accumulated_value(buf, &n.piece, idx);
                        let start = node_start_offset + n.left_metrics.len;
                        if prev + column - 1 <= n.piece.length {
                            return NodeAt {
                                piece: n.piece,
                                remainder: prev + column - 1,
                                node_start_offset: start,
                            };
                        }
                        column -= n.piece.length - prev;
                        return self.node_at2_tail(start, column);
                    } else {
                        line_number -= n.left_metrics.lf + n.piece.line_feed_cnt;
                        node_start_offset += n.left_metrics.len + n.piece.length;
                        node = n.right.as_ref();
                    }
                }
                _ => unreachable!("node_at2: line/column out of range for a non-empty tree"),
            }
        }
    }

    /// `column` ran past the piece ending the target line; step through
    /// successor pieces, consuming `column` from each, until the byte is
    /// found (or a piece containing the next line break is reached).
    fn node_at2_tail(&self, prev_node_start: u64, mut column: u64) -> NodeAt {
        let mut iter = PieceIter::new(&self.tree, prev_node_start);
        loop {
            let Some((start, piece)) = iter.next() else {
                unreachable!("node_at2: column out of range for a non-empty tree");
            };
            if piece.line_feed_cnt > 0 {
                let buf = self.buffers.get(piece.buffer_index);
                let prev = piece::accumulated_value(buf, &piece, 0);
                return NodeAt {
                    piece,
                    remainder: (column - 1).min(prev),
                    node_start_offset: start,
                };
            }
            if piece.length >= column - 1 {
                return NodeAt {
                    piece,
                    remainder: column - 1,
                    node_start_offset: start,
                };
            }
            column -= piece.length;
        }
    }

    fn get_index_of(&self, piece: &Piece, local_offset: u64) -> (u64, u64) {
        let buf = self.buffers.get(piece.buffer_index);
        let pos = piece::position_in_buffer(buf, piece::offset_in_buffer(buf, piece.start) + local_offset);
        let line_cnt = pos.line - piece.start.line;
        if local_offset == piece.length {
            let true_lf = piece::line_feed_cnt_between(buf, piece.start, pos);
            if true_lf != line_cnt {
                return (true_lf, 0);
            }
        }
        (line_cnt, pos.column)
    }

    /// Byte offset of `(line, column)`, both 1-based.
    pub fn get_offset_at(&self, line: u64, column: u64) -> u64 {
        if self.tree.is_empty() {
            return 0;
        }
        let mut line_number = line.max(1);
        let mut left_len = 0u64;
        let mut node = self.tree.root.as_ref();

        loop {
            match node {
                Node::Internal(n) => {
                    if !n.left.is_leaf() && n.left_metrics.lf >= line_number - 1 {
                        node = n.left.as_ref();
                    } else if n.left_metrics.lf + n.piece.line_feed_cnt >= line_number - 1 {
                        left_len += n.left_metrics.len;
                        let buf = self.buffers.get(n.piece.buffer_index);
                        let idx = line_number as i64 - n.left_metrics.lf as i64 - 2;
                        return left_len + piece::accumulated_value(buf, &n.piece, idx) + column.saturating_sub(1);
                    } else {
                        line_number -= n.left_metrics.lf + n.piece.line_feed_cnt;
                        left_len += n.left_metrics.len + n.piece.length;
                        node = n.right.as_ref();
                    }
                }
                _ => return left_len,
            }
        }
    }

    /// `(line, column)`, both 1-based, of byte offset `offset`.
    pub fn get_position_at(&self, offset: u64) -> (u64, u64) {
        let offset = offset.min(self.length);
        if self.tree.is_empty() {
            return (1, 1);
        }
        let mut remaining = offset;
        let mut lf_cnt = 0u64;
        let mut node = self.tree.root.as_ref();

        loop {
            match node {
                Node::Internal(n) => {
                    if !n.left.is_leaf() && n.left_metrics.len >= remaining {
                        node = n.left.as_ref();
                    } else if n.left_metrics.len + n.piece.length >= remaining {
                        let (index, column) = self.get_index_of(&n.piece, remaining - n.left_metrics.len);
                        lf_cnt += n.left_metrics.lf + index;
                        if index == 0 {
                            let line_start_offset = self.get_offset_at(lf_cnt + 1, 1);
                            return (lf_cnt + 1, offset - line_start_offset + 1);
                        }
                        return (lf_cnt + 1, column + 1);
                    } else {
                        remaining -= n.left_metrics.len + n.piece.length;
                        lf_cnt += n.left_metrics.lf + n.piece.line_feed_cnt;
                        node = n.right.as_ref();
                    }
                }
                _ => return (1, 1),
            }
        }
    }

    // ---- content reads -------------------------------------------------

    fn piece_bytes(&self, piece: &Piece) -> &[u8] {
        let buf = self.buffers.get(piece.buffer_index);
        let start = piece::offset_in_buffer(buf, piece.start) as usize;
        let end = start + piece.length as usize;
        &buf.buffer[start..end]
    }

    pub fn get_lines_raw_content(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        let mut iter = PieceIter::new(&self.tree, 0);
        while let Some((_, piece)) = iter.get() {
            out.extend_from_slice(self.piece_bytes(&piece));
            if iter.next().is_none() {
                break;
            }
        }
        out
    }

    pub fn get_line_raw_content(&mut self, line_number: u64) -> Vec<u8> {
        self.get_line_raw_content_trim(line_number, 0)
    }

    fn get_line_raw_content_trim(&mut self, line_number: u64, trim_tail_bytes: u64) -> Vec<u8> {
        if self.tree.is_empty() {
            return Vec::new();
        }
        let line_number = line_number.clamp(1, self.line_cnt);
        let start = self.node_at2(line_number, 1);
        self.search_cache.set(CacheEntry {
            piece: start.piece,
            node_start_offset: start.node_start_offset,
            node_start_line: line_number,
        });

        let mut out = Vec::new();
        let first = &self.piece_bytes(&start.piece)[start.remainder as usize..];
        if let Some(end) = line_break_end(first) {
            out.extend_from_slice(&first[..end]);
            return trim_trailing(out, trim_tail_bytes);
        }
        out.extend_from_slice(first);

        let mut iter = PieceIter::new(&self.tree, start.node_start_offset);
        while let Some((_, piece)) = iter.next() {
            let bytes = self.piece_bytes(&piece);
            if let Some(end) = line_break_end(bytes) {
                out.extend_from_slice(&bytes[..end]);
                return trim_trailing(out, trim_tail_bytes);
            }
            out.extend_from_slice(bytes);
        }
        trim_trailing(out, trim_tail_bytes)
    }

    pub fn get_line_content(&mut self, line_number: u64) -> Vec<u8> {
        if let Some((cached_line, content)) = &self.last_visited_line {
            if *cached_line == line_number {
                return content.clone();
            }
        }

        let trim = if self.eol_normalized { self.eol.len() } else { 0 };
        let mut content = self.get_line_raw_content_trim(line_number, trim);
        if !self.eol_normalized {
            if content.last() == Some(&b'\n') {
                content.pop();
                if content.last() == Some(&b'\r') {
                    content.pop();
                }
            } else if content.last() == Some(&b'\r') {
                content.pop();
            }
        }

        self.last_visited_line = Some((line_number, content.clone()));
        content
    }

    pub fn get_lines_content(&mut self) -> Vec<Vec<u8>> {
        (1..=self.line_cnt).map(|l| self.get_line_content(l)).collect()
    }

    pub fn get_line_length(&self, line_number: u64) -> u64 {
        if line_number >= self.line_cnt {
            let start_offset = self.get_offset_at(line_number, 1);
            return self.length.saturating_sub(start_offset);
        }
        self.get_offset_at(line_number + 1, 1) - self.get_offset_at(line_number, 1) - self.eol.len()
    }

    pub fn get_line_char_code(&self, line_number: u64, index: u64) -> Option<u8> {
        let node = self.node_at2(line_number, index + 1);
        let bytes = self.piece_bytes(&node.piece);
        if node.remainder == bytes.len() as u64 {
            let mut iter = PieceIter::new(&self.tree, node.node_start_offset);
            return iter.next().and_then(|(_, p)| self.piece_bytes(&p).first().copied());
        }
        bytes.get(node.remainder as usize).copied()
    }

    /// `start`/`end` are `(line, column)`, both 1-based.
    pub fn get_value_in_range(&self, start: (u64, u64), end: (u64, u64), eol: Option<Eol>) -> Vec<u8> {
        if start == end || self.tree.is_empty() {
            return Vec::new();
        }

        let start_pos = self.node_at2(start.0, start.1);
        let end_pos = self.node_at2(end.0, end.1);

        let mut out = if start_pos.node_start_offset == end_pos.node_start_offset {
            let bytes = self.piece_bytes(&start_pos.piece);
            bytes[start_pos.remainder as usize..end_pos.remainder as usize].to_vec()
        } else {
            let mut out = self.piece_bytes(&start_pos.piece)[start_pos.remainder as usize..].to_vec();
            let mut iter = PieceIter::new(&self.tree, start_pos.node_start_offset);
            while let Some((pos, piece)) = iter.next() {
                if pos == end_pos.node_start_offset {
                    out.extend_from_slice(&self.piece_bytes(&piece)[..end_pos.remainder as usize]);
                    break;
                }
                out.extend_from_slice(self.piece_bytes(&piece));
            }
            out
        };

        if let Some(eol) = eol {
            out = rewrite_eol(&out, eol);
        }
        out
    }

    pub fn create_snapshot(&self, bom: Vec<u8>) -> Snapshot<'_> {
        let mut pieces = Vec::new();
        let mut iter = PieceIter::new(&self.tree, 0);
        while let Some((_, piece)) = iter.get() {
            pieces.push(piece);
            if iter.next().is_none() {
                break;
            }
        }
        Snapshot::new(pieces, bom, &self.buffers)
    }

    // ---- CRLF repair predicates -----------------------------------------

    fn should_check_crlf(&self) -> bool {
        !(self.eol_normalized && self.eol == Eol::Lf)
    }

    fn char_code_at(&self, piece: &Piece, index: u64) -> Option<u8> {
        self.piece_bytes(piece).get(index as usize).copied()
    }

    fn piece_starts_with_lf(&self, piece: &Piece) -> bool {
        if piece.line_feed_cnt == 0 {
            return false;
        }
        self.char_code_at(piece, 0) == Some(b'\n')
    }

    fn piece_ends_with_cr(&self, piece: &Piece) -> bool {
        if piece.line_feed_cnt == 0 {
            return false;
        }
        self.char_code_at(piece, piece.length - 1) == Some(b'\r')
    }

    fn validate_crlf_with_prev_node(&mut self, next_start_offset: u64) {
        if !self.should_check_crlf() || next_start_offset == 0 {
            return;
        }
        let total = self.tree.total().len;
        if next_start_offset >= total {
            return;
        }
        let Some(next) = self.node_at(next_start_offset) else { return };
        if next.node_start_offset != next_start_offset || !self.piece_starts_with_lf(&next.piece) {
            return;
        }
        let Some(prev) = self.node_at(next_start_offset - 1) else { return };
        if !self.piece_ends_with_cr(&prev.piece) {
            return;
        }
        self.fix_crlf(prev.node_start_offset, prev.piece, next.node_start_offset, next.piece);
    }

    fn validate_crlf_with_next_node(&mut self, node_start_offset: u64, node_piece: Piece) {
        if !self.should_check_crlf() || !self.piece_ends_with_cr(&node_piece) {
            return;
        }
        let next_start = node_start_offset + node_piece.length;
        if next_start >= self.tree.total().len {
            return;
        }
        let Some(next) = self.node_at(next_start) else { return };
        if next.node_start_offset != next_start || !self.piece_starts_with_lf(&next.piece) {
            return;
        }
        self.fix_crlf(node_start_offset, node_piece, next.node_start_offset, next.piece);
    }

    /// Merges a `\r` ending `prev` and a `\n` starting `next` into one
    /// freshly created `"\r\n"` piece sitting between their (possibly
    /// now-empty) remainders.
    fn fix_crlf(&mut self, prev_offset: u64, prev_piece: Piece, next_offset: u64, next_piece: Piece) {
        debug!("merging split CRLF pair at offset {}", prev_offset + prev_piece.length);

        let prev_buf = self.buffers.get(prev_piece.buffer_index);
        let new_end = if prev_piece.end.column == 0 {
            let line = prev_piece.end.line;
            BufferCursor::new(line - 1, prev_buf.line_starts[line as usize] - prev_buf.line_starts[line as usize - 1] - 1)
        } else {
            BufferCursor::new(prev_piece.end.line, prev_piece.end.column - 1)
        };
        let prev_new_len = prev_piece.length - 1;
        let prev_new_lf = prev_piece.line_feed_cnt - 1;

        let mut seam_pos = prev_offset;
        if prev_new_len > 0 {
            self.tree
                .replace_piece(prev_offset, Piece::new(prev_piece.buffer_index, prev_piece.start, new_end, prev_new_len, prev_new_lf));
            seam_pos += prev_new_len;
        } else {
            self.tree.remove_node(prev_offset);
        }

        let next_offset = if prev_new_len == 0 { next_offset - prev_piece.length } else { next_offset };
        let next_buf = self.buffers.get(next_piece.buffer_index);
        let next_new_start = BufferCursor::new(next_piece.start.line + 1, 0);
        let next_new_len = next_piece.length - 1;
        let next_new_lf = piece::line_feed_cnt_between(next_buf, next_new_start, next_piece.end);

        if next_new_len > 0 {
            self.tree.replace_piece(
                next_offset,
                Piece::new(next_piece.buffer_index, next_new_start, next_piece.end, next_new_len, next_new_lf),
            );
        } else {
            self.tree.remove_node(next_offset);
        }

        for p in self.create_new_pieces(b"\r\n") {
            let len = p.length;
            self.tree.insert(seam_pos, p);
            seam_pos += len;
        }
    }

    // ---- piece creation --------------------------------------------------

    fn new_original_piece(&mut self, chunk: &[u8]) -> Piece {
        let buf = StringBuffer::new(chunk.to_vec());
        let end_line = buf.line_count() - 1;
        let end_col = buf.len() - buf.line_starts[end_line as usize];
        let length = buf.len();
        let index = self.buffers.push_original(buf);
        Piece::new(index, BufferCursor::new(0, 0), BufferCursor::new(end_line, end_col), length, end_line)
    }

    /// `createNewPieces`: oversized text gets split across fresh original
    /// buffers; everything else is appended to the change buffer.
    fn create_new_pieces(&mut self, text: &[u8]) -> Vec<Piece> {
        if text.is_empty() {
            return Vec::new();
        }

        if text.len() as u64 > AVERAGE_BUFFER_SIZE {
            let mut pieces = Vec::new();
            let mut rest = text;
            while rest.len() as u64 > AVERAGE_BUFFER_SIZE {
                let mut split_at = AVERAGE_BUFFER_SIZE as usize;
                if rest[split_at - 1] == b'\r' {
                    split_at -= 1;
                }
                let (chunk, remainder) = rest.split_at(split_at);
                pieces.push(self.new_original_piece(chunk));
                rest = remainder;
            }
            if !rest.is_empty() {
                pieces.push(self.new_original_piece(rest));
            }
            return pieces;
        }

        let start = self.last_change_buffer_pos;
        let start_offset = self.buffers.change_buffer().len();
        self.buffers.change_buffer_mut().append(text);
        let buf = self.buffers.change_buffer();
        let end = piece::position_in_buffer(buf, start_offset + text.len() as u64);
        let lf = piece::line_feed_cnt_between(buf, start, end);
        self.last_change_buffer_pos = end;

        vec![Piece::new(0, start, end, text.len() as u64, lf)]
    }

    fn append_to_node(&mut self, node_start_offset: u64, old_piece: Piece, value: &[u8]) {
        let start = old_piece.start;
        self.buffers.change_buffer_mut().append(value);
        let buf = self.buffers.change_buffer();
        let new_end = piece::position_in_buffer(buf, buf.len());
        let new_length = old_piece.length + value.len() as u64;
        let new_lf = piece::line_feed_cnt_between(buf, start, new_end);
        let new_piece = Piece::new(old_piece.buffer_index, start, new_end, new_length, new_lf);
        self.tree.replace_piece(node_start_offset, new_piece);
        self.last_change_buffer_pos = new_end;
    }

    // ---- insertion -------------------------------------------------------

    pub fn insert(&mut self, offset: u64, value: &[u8], eol_normalized: bool) {
        if value.is_empty() {
            return;
        }
        self.eol_normalized &= eol_normalized;
        self.last_visited_line = None;
        let offset = offset.min(self.length);
        trace!("insert at {offset}, {} bytes", value.len());

        if self.tree.is_empty() {
            let mut pos = 0;
            for p in self.create_new_pieces(value) {
                self.tree.insert(pos, p);
                pos += p.length;
            }
            self.compute_buffer_metadata();
            self.debug_assert_tree_valid("insert");
            return;
        }

        let at = self.node_at(offset).expect("offset within bounds for a non-empty tree");

        if at.piece.buffer_index == 0
            && at.piece.end == self.last_change_buffer_pos
            && at.node_start_offset + at.piece.length == offset
            && (value.len() as u64) < AVERAGE_BUFFER_SIZE
        {
            self.append_to_node(at.node_start_offset, at.piece, value);
            self.compute_buffer_metadata();
            self.debug_assert_tree_valid("insert");
            return;
        }

        if at.node_start_offset == offset {
            self.insert_content_to_node_left(value.to_vec(), at.node_start_offset, at.piece);
            let dropped = self.search_cache.validate(offset);
            if dropped > 0 {
                debug!("search cache invalidated: {dropped} entries dropped at offset {offset}");
            }
        } else if at.node_start_offset + at.piece.length > offset {
            self.insert_interior(value.to_vec(), at.node_start_offset, at.piece, at.remainder);
        } else {
            self.insert_content_to_node_right(value.to_vec(), at.node_start_offset, at.piece);
        }

        self.compute_buffer_metadata();
        self.debug_assert_tree_valid("insert");
    }

    /// Re-walks the tree in debug builds to verify the red-black and
    /// `left_metrics`/`lf_left` aggregate invariants still hold after a
    /// mutation; compiled out of the runtime path in release builds since
    /// `debug_assert!` only evaluates its condition under `cfg(debug_assertions)`.
    fn debug_assert_tree_valid(&self, context: &str) {
        debug_assert!(
            self.tree.check_invariants().is_ok(),
            "tree invariants violated after {context}: {:?}",
            self.tree.check_invariants()
        );
    }

    fn insert_content_to_node_left(&mut self, mut value: Vec<u8>, node_start_offset: u64, node_piece: Piece) {
        let mut delete_node = false;

        if self.should_check_crlf() && ends_with_cr_bytes(&value) && self.piece_starts_with_lf(&node_piece) {
            value.push(b'\n');
            if node_piece.length == 1 {
                delete_node = true;
            } else {
                let new_start = BufferCursor::new(node_piece.start.line + 1, 0);
                let buf = self.buffers.get(node_piece.buffer_index);
                let new_lf = piece::line_feed_cnt_between(buf, new_start, node_piece.end);
                let shrunk = Piece::new(node_piece.buffer_index, new_start, node_piece.end, node_piece.length - 1, new_lf);
                self.tree.replace_piece(node_start_offset, shrunk);
            }
        }

        let new_pieces = self.create_new_pieces(&value);
        if new_pieces.is_empty() {
            return;
        }

        let mut pos = node_start_offset;
        for p in &new_pieces {
            self.tree.insert(pos, *p);
            pos += p.length;
        }

        self.validate_crlf_with_prev_node(node_start_offset);

        if delete_node {
            self.tree.remove_node(pos);
        }
    }

    fn insert_content_to_node_right(&mut self, mut value: Vec<u8>, node_start_offset: u64, node_piece: Piece) {
        let mut delete_next = None;

        if self.should_check_crlf() && self.piece_ends_with_cr(&node_piece) && starts_with_lf_bytes(&value) {
            let next_start = node_start_offset + node_piece.length;
            if let Some(next) = self.node_at(next_start) {
                if next.node_start_offset == next_start && self.piece_starts_with_lf(&next.piece) {
                    value.push(b'\n');
                    if next.piece.length == 1 {
                        delete_next = Some(next.node_start_offset);
                    } else {
                        let buf = self.buffers.get(next.piece.buffer_index);
                        let new_start = BufferCursor::new(next.piece.start.line + 1, 0);
                        let new_len = next.piece.length - 1;
                        let new_lf = piece::line_feed_cnt_between(buf, new_start, next.piece.end);
                        self.tree.replace_piece(
                            next.node_start_offset,
                            Piece::new(next.piece.buffer_index, new_start, next.piece.end, new_len, new_lf),
                        );
                    }
                }
            }
        }

        let new_pieces = self.create_new_pieces(&value);
        let mut pos = node_start_offset + node_piece.length;
        let first_new_pos = pos;
        let mut total = 0u64;
        for p in &new_pieces {
            self.tree.insert(pos, *p);
            pos += p.length;
            total += p.length;
        }

        self.validate_crlf_with_prev_node(first_new_pos);

        if let Some(offset) = delete_next {
            self.tree.remove_node(offset + total);
        }
    }

    fn insert_interior(&mut self, mut value: Vec<u8>, node_start_offset: u64, piece: Piece, remainder: u64) {
        let buf = self.buffers.get(piece.buffer_index);
        let piece_start_offset = piece::offset_in_buffer(buf, piece.start);
        let insert_pos_in_buffer = piece::position_in_buffer(buf, piece_start_offset + remainder);

        let mut right_start = insert_pos_in_buffer;
        let mut right_lf = piece::line_feed_cnt_between(buf, right_start, piece.end);
        let piece_end_offset = piece::offset_in_buffer(buf, piece.end);
        let mut right_len = piece_end_offset - piece::offset_in_buffer(buf, right_start);

        if self.should_check_crlf() && ends_with_cr_bytes(&value) && self.char_code_at(&piece, remainder) == Some(b'\n') {
            right_start = BufferCursor::new(right_start.line + 1, 0);
            right_len -= 1;
            right_lf = piece::line_feed_cnt_between(self.buffers.get(piece.buffer_index), right_start, piece.end);
            value.push(b'\n');
        }

        let mut left_len = remainder;
        let mut left_end = insert_pos_in_buffer;
        if self.should_check_crlf()
            && starts_with_lf_bytes(&value)
            && remainder > 0
            && self.char_code_at(&piece, remainder - 1) == Some(b'\r')
        {
            left_len -= 1;
            left_end = piece::position_in_buffer(self.buffers.get(piece.buffer_index), piece_start_offset + left_len);
            value.insert(0, b'\r');
        }

        if left_len > 0 {
            let new_lf = piece::line_feed_cnt_between(self.buffers.get(piece.buffer_index), piece.start, left_end);
            let shrunk = Piece::new(piece.buffer_index, piece.start, left_end, left_len, new_lf);
            self.tree.replace_piece(node_start_offset, shrunk);
        }

        let right_piece = if right_len > 0 {
            Some(Piece::new(piece.buffer_index, right_start, piece.end, right_len, right_lf))
        } else {
            None
        };

        let new_pieces = self.create_new_pieces(&value);

        let mut pos = node_start_offset + left_len;
        if let Some(rp) = right_piece {
            self.tree.insert(pos, rp);
            pos += rp.length;
        }
        for p in &new_pieces {
            self.tree.insert(pos, *p);
            pos += p.length;
        }

        if left_len == 0 {
            self.tree.remove_node(node_start_offset);
        }
    }

    // ---- deletion ----------------------------------------------------------

    pub fn delete(&mut self, offset: u64, cnt: u64) {
        self.last_visited_line = None;
        if cnt == 0 || self.tree.is_empty() {
            return;
        }
        let offset = offset.min(self.length);
        let cnt = cnt.min(self.length - offset);
        if cnt == 0 {
            return;
        }
        trace!("delete at {offset}, {cnt} bytes");

        let start = self.node_at(offset).expect("offset within bounds");
        let end = self.node_at(offset + cnt).expect("offset within bounds");

        if start.node_start_offset == end.node_start_offset {
            self.delete_same_node(offset, cnt, start, end);
        } else {
            self.delete_multi_node(offset, cnt, start, end);
        }

        let dropped = self.search_cache.validate(offset);
        if dropped > 0 {
            debug!("search cache invalidated: {dropped} entries dropped at offset {offset}");
        }
        self.compute_buffer_metadata();
        self.debug_assert_tree_valid("delete");
    }

    fn delete_same_node(&mut self, offset: u64, cnt: u64, start: NodeAt, end: NodeAt) {
        let node_start_offset = start.node_start_offset;
        let piece = start.piece;
        let buf = self.buffers.get(piece.buffer_index);
        let piece_start_offset = piece::offset_in_buffer(buf, piece.start);
        let start_split = piece::position_in_buffer(buf, piece_start_offset + start.remainder);
        let end_split = piece::position_in_buffer(buf, piece_start_offset + end.remainder);

        if node_start_offset == offset && cnt == piece.length {
            self.tree.remove_node(node_start_offset);
            self.validate_crlf_with_prev_node(node_start_offset);
            return;
        }

        if node_start_offset == offset {
            let new_lf = piece::line_feed_cnt_between(buf, end_split, piece.end);
            let new_len = piece.length - cnt;
            self.tree
                .replace_piece(node_start_offset, Piece::new(piece.buffer_index, end_split, piece.end, new_len, new_lf));
            self.validate_crlf_with_prev_node(node_start_offset);
            return;
        }

        if node_start_offset + piece.length == offset + cnt {
            let new_lf = piece::line_feed_cnt_between(buf, piece.start, start_split);
            let new_len = piece.length - cnt;
            let new_piece = Piece::new(piece.buffer_index, piece.start, start_split, new_len, new_lf);
            self.tree.replace_piece(node_start_offset, new_piece);
            self.validate_crlf_with_next_node(node_start_offset, new_piece);
            return;
        }

        // interior: shrink to [start, start_split) and insert a fresh
        // right piece [end_split, end).
        let left_len = start.remainder;
        let left_lf = piece::line_feed_cnt_between(buf, piece.start, start_split);
        self.tree
            .replace_piece(node_start_offset, Piece::new(piece.buffer_index, piece.start, start_split, left_len, left_lf));

        let right_len = piece::offset_in_buffer(buf, piece.end) - piece::offset_in_buffer(buf, end_split);
        let right_lf = piece::line_feed_cnt_between(buf, end_split, piece.end);
        let right_piece = Piece::new(piece.buffer_index, end_split, piece.end, right_len, right_lf);
        let right_offset = node_start_offset + left_len;
        self.tree.insert(right_offset, right_piece);

        self.validate_crlf_with_prev_node(right_offset);
    }

    fn delete_multi_node(&mut self, _offset: u64, _cnt: u64, start: NodeAt, end: NodeAt) {
        let start_piece = start.piece;
        let start_offset = start.node_start_offset;
        let start_buf = self.buffers.get(start_piece.buffer_index);
        let start_piece_start_offset = piece::offset_in_buffer(start_buf, start_piece.start);
        let start_split = piece::position_in_buffer(start_buf, start_piece_start_offset + start.remainder);
        let start_left_len = start.remainder;
        let start_lf = piece::line_feed_cnt_between(start_buf, start_piece.start, start_split);
        let start_deleted = start_left_len == 0;

        let end_piece = end.piece;
        let end_buf = self.buffers.get(end_piece.buffer_index);
        let end_piece_start_offset = piece::offset_in_buffer(end_buf, end_piece.start);
        let end_split = piece::position_in_buffer(end_buf, end_piece_start_offset + end.remainder);
        let end_right_len = piece::offset_in_buffer(end_buf, end_piece.end) - piece::offset_in_buffer(end_buf, end_split);
        let end_right_lf = piece::line_feed_cnt_between(end_buf, end_split, end_piece.end);
        let end_deleted = end_right_len == 0;

        // Count interior nodes on the tree as it stood before this delete
        // started; they all collapse onto the same anchor offset once
        // start's tail is trimmed (or start itself is gone).
        let mut interior_count = 0u64;
        let mut counter = PieceIter::new(&self.tree, start_offset);
        while let Some((pos, _)) = counter.next() {
            if pos >= end.node_start_offset {
                break;
            }
            interior_count += 1;
        }

        if !start_deleted {
            self.tree.replace_piece(
                start_offset,
                Piece::new(start_piece.buffer_index, start_piece.start, start_split, start_left_len, start_lf),
            );
        }

        let anchor = if start_deleted { start_offset + start_piece.length } else { start_offset + start_left_len };
        for _ in 0..interior_count {
            self.tree.remove_node(anchor);
        }

        if !end_deleted {
            self.tree
                .replace_piece(anchor, Piece::new(end_piece.buffer_index, end_split, end_piece.end, end_right_len, end_right_lf));
        } else {
            self.tree.remove_node(anchor);
        }

        if start_deleted {
            self.tree.remove_node(start_offset);
        }

        if !start_deleted {
            let piece_now = Piece::new(start_piece.buffer_index, start_piece.start, start_split, start_left_len, start_lf);
            self.validate_crlf_with_next_node(start_offset, piece_now);
        } else if start_offset > 0 {
            if let Some(prev) = self.node_at(start_offset - 1) {
                self.validate_crlf_with_next_node(prev.node_start_offset, prev.piece);
            }
        }
    }

    fn compute_buffer_metadata(&mut self) {
        let total = self.tree.total();
        self.length = total.len;
        self.line_cnt = 1 + total.lf;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

fn ends_with_cr_bytes(value: &[u8]) -> bool {
    value.last() == Some(&b'\r')
}

fn starts_with_lf_bytes(value: &[u8]) -> bool {
    value.first() == Some(&b'\n')
}

fn trim_trailing(mut bytes: Vec<u8>, n: u64) -> Vec<u8> {
    let n = (n as usize).min(bytes.len());
    bytes.truncate(bytes.len() - n);
    bytes
}

/// Index right after the first full line terminator in `bytes` (`\n`,
/// lone `\r`, or `\r\n` treated atomically), or `None` if there isn't one.
fn line_break_end(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => return Some(i + 1),
            b'\r' => {
                return Some(if bytes.get(i + 1) == Some(&b'\n') { i + 2 } else { i + 1 });
            }
            _ => i += 1,
        }
    }
    None
}

/// Rewrites every `\r\n`, lone `\r`, or lone `\n` in `bytes` to `eol`.
pub(crate) fn rewrite_eol(bytes: &[u8], eol: Eol) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(eol.as_bytes());
                i += 2;
            }
            b'\r' | b'\n' => {
                out.extend_from_slice(eol.as_bytes());
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn new_with(text: &[u8]) -> Engine {
        let mut engine = Engine::new();
        engine.insert(0, text, true);
        engine
    }

    #[test]
    fn insert_into_empty() {
        let engine = new_with(b"hello");
        assert_eq!(5, engine.len());
        assert_eq!(b"hello".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn insert_at_left_boundary() {
        let mut engine = new_with(b"world");
        engine.insert(0, b"hello ", true);
        assert_eq!(b"hello world".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn insert_interior_splits_piece() {
        let mut engine = new_with(b"helloworld");
        engine.insert(5, b" ", true);
        assert_eq!(b"hello world".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn insert_append_fast_path_reuses_node() {
        let mut engine = new_with(b"ab");
        engine.insert(2, b"cd", true);
        engine.insert(4, b"ef", true);
        assert_eq!(b"abcdef".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn delete_whole_piece() {
        let mut engine = new_with(b"hello");
        engine.delete(0, 5);
        assert_eq!(0, engine.len());
        assert_eq!(Vec::<u8>::new(), engine.get_lines_raw_content());
    }

    #[test]
    fn delete_interior_range() {
        let mut engine = new_with(b"hello world");
        engine.delete(5, 1);
        assert_eq!(b"helloworld".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn delete_across_many_pieces() {
        let mut engine = Engine::new();
        engine.insert(0, b"aaa", true);
        engine.insert(3, b"bbb", true);
        engine.insert(6, b"ccc", true);
        engine.insert(9, b"ddd", true);
        engine.delete(2, 8);
        assert_eq!(b"add".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn crlf_split_across_insert_is_repaired() {
        let mut engine = new_with(b"a\r");
        engine.insert(2, b"\nb", false);
        assert_eq!(b"a\r\nb".to_vec(), engine.get_lines_raw_content());
        assert_eq!(2, engine.line_count());
    }

    #[test]
    fn crlf_split_across_delete_is_repaired() {
        let mut engine = new_with(b"a\r\nb");
        engine.delete(1, 0);
        // no-op delete shouldn't disturb the existing pair
        assert_eq!(b"a\r\nb".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn line_content_and_offsets_round_trip() {
        let mut engine = new_with(b"one\ntwo\nthree");
        assert_eq!(3, engine.line_count());
        assert_eq!(b"one".to_vec(), engine.get_line_content(1));
        assert_eq!(b"two".to_vec(), engine.get_line_content(2));
        assert_eq!(b"three".to_vec(), engine.get_line_content(3));

        for offset in 0..=engine.len() {
            let (line, col) = engine.get_position_at(offset);
            assert_eq!(offset, engine.get_offset_at(line, col), "offset {offset} round-trips");
        }
    }

    #[test]
    fn get_value_in_range_spans_pieces() {
        let mut engine = Engine::new();
        engine.insert(0, b"aaa", true);
        engine.insert(3, b"bbb", true);
        engine.insert(6, b"ccc", true);
        let value = engine.get_value_in_range((1, 2), (1, 9), None);
        assert_eq!(b"aabbbcc".to_vec(), value);
    }

    #[test]
    fn set_eol_rewrites_terminators() {
        let mut engine = new_with(b"a\nb\nc");
        engine.set_eol(b"\r\n");
        assert_eq!(b"a\r\nb\r\nc".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn randomized_edits_match_reference_string() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut engine = Engine::new();
        let mut reference: Vec<u8> = Vec::new();

        for _ in 0..300 {
            let len = reference.len() as u64;
            if len == 0 || rng.gen_bool(0.6) {
                let offset = rng.gen_range(0..=len);
                let text: Vec<u8> = (0..rng.gen_range(1..6)).map(|_| rng.gen_range(b'a'..=b'z')).collect();
                engine.insert(offset, &text, true);
                reference.splice(offset as usize..offset as usize, text);
            } else {
                let offset = rng.gen_range(0..len);
                let cnt = rng.gen_range(1..=(len - offset).min(5));
                engine.delete(offset, cnt);
                reference.drain(offset as usize..(offset + cnt) as usize);
            }
            assert_eq!(reference, engine.get_lines_raw_content());
            assert_eq!(reference.len() as u64, engine.len());
        }
    }
}
