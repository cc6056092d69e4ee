//! Bounded cache of recently located pieces, keyed by their start offset
//! (and, for line lookups, start line number). Repeated nearby reads and
//! edits are the common case for editors, so remembering the last few
//! lookups turns an O(log n) descent into an O(1) linear scan over a
//! handful of entries.
//!
//! Cache entries hold a *copy* of the piece rather than a reference into
//! the tree: the tree is an immutable, structurally-shared `Arc` tree, so
//! there is no node identity to re-validate the way a parent-pointer tree
//! would. Instead [`SearchCache::validate`] just drops anything whose
//! start offset is at or past an edit, the same conservative rule the
//! cache's `get` callers already rely on.

use crate::piece::Piece;

const DEFAULT_LIMIT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheEntry {
    pub piece: Piece,
    pub node_start_offset: u64,
    pub node_start_line: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct SearchCache {
    limit: usize,
    entries: Vec<CacheEntry>,
}

impl SearchCache {
    pub fn new(limit: usize) -> SearchCache {
        SearchCache {
            limit,
            entries: Vec::with_capacity(limit),
        }
    }

    /// Finds a cached piece whose `[node_start_offset, node_start_offset +
    /// length]` range contains `offset`, most-recently-set first.
    pub fn get(&self, offset: u64) -> Option<CacheEntry> {
        self.entries.iter().rev().copied().find(|entry| {
            entry.node_start_offset <= offset && entry.node_start_offset + entry.piece.length >= offset
        })
    }

    /// Finds a cached piece whose line range contains `line_number`,
    /// most-recently-set first. `node_start_line` of `0` marks an entry
    /// that was never given a line number and is skipped.
    pub fn get2(&self, line_number: u64) -> Option<CacheEntry> {
        self.entries.iter().rev().copied().find(|entry| {
            entry.node_start_line != 0
                && entry.node_start_line < line_number
                && entry.node_start_line + entry.piece.line_feed_cnt >= line_number
        })
    }

    pub fn set(&mut self, entry: CacheEntry) {
        if self.entries.len() >= self.limit {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Drops every entry at or past `offset`: anything that could have
    /// been split, shrunk, or removed by an edit starting there. Returns
    /// how many entries were dropped, so callers can log only when an
    /// edit actually invalidated something cached.
    pub fn validate(&mut self, offset: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.node_start_offset < offset);
        before - self.entries.len()
    }

    /// Drops every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.clear();
        before
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        SearchCache::new(DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::piece::BufferCursor;

    fn piece(len: u64, lf: u64) -> Piece {
        Piece::new(0, BufferCursor::new(0, 0), BufferCursor::new(lf, 0), len, lf)
    }

    #[test]
    fn get_finds_containing_entry() {
        let mut cache = SearchCache::new(4);
        cache.set(CacheEntry {
            piece: piece(10, 0),
            node_start_offset: 0,
            node_start_line: 1,
        });
        cache.set(CacheEntry {
            piece: piece(5, 0),
            node_start_offset: 10,
            node_start_line: 2,
        });

        let found = cache.get(12).unwrap();
        assert_eq!(10, found.node_start_offset);
        assert!(cache.get(100).is_none());
    }

    #[test]
    fn get2_finds_containing_line() {
        let mut cache = SearchCache::new(4);
        cache.set(CacheEntry {
            piece: piece(10, 3),
            node_start_offset: 0,
            node_start_line: 1,
        });

        let found = cache.get2(2).unwrap();
        assert_eq!(1, found.node_start_line);
        assert!(cache.get2(1).is_none(), "line number must be strictly past node_start_line");
    }

    #[test]
    fn set_evicts_oldest_past_limit() {
        let mut cache = SearchCache::new(2);
        for i in 0..5 {
            cache.set(CacheEntry {
                piece: piece(1, 0),
                node_start_offset: i,
                node_start_line: 0,
            });
        }
        assert_eq!(2, cache.entries.len());
        assert_eq!(3, cache.entries[0].node_start_offset);
        assert_eq!(4, cache.entries[1].node_start_offset);
    }

    #[test]
    fn validate_drops_entries_past_edit() {
        let mut cache = SearchCache::new(4);
        cache.set(CacheEntry {
            piece: piece(5, 0),
            node_start_offset: 0,
            node_start_line: 1,
        });
        cache.set(CacheEntry {
            piece: piece(5, 0),
            node_start_offset: 10,
            node_start_line: 2,
        });

        cache.validate(5);
        assert_eq!(1, cache.entries.len());
        assert_eq!(0, cache.entries[0].node_start_offset);
    }
}
