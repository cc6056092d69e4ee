//! Incrementally accepts chunks of raw bytes (as read from a file or
//! network stream) and produces a [`Factory`] that picks a document-wide
//! end-of-line sequence and builds an [`Engine`] from the result.
//!
//! A chunk boundary can fall between the `\r` and `\n` of a single line
//! terminator; [`PieceTreeBuilder`] carries a dangling trailing `\r` over
//! to the next `accept_chunk` call so it is never miscounted as a lone CR.

use crate::buffer::StringBuffer;
use crate::engine::{rewrite_eol, Engine, Eol, BOM};
use crate::line_starts;

#[derive(Debug, Default)]
pub struct PieceTreeBuilder {
    chunks: Vec<Vec<u8>>,
    bom: Vec<u8>,
    has_previous_char: bool,
    previous_char: u8,
    cr: u64,
    lf: u64,
    crlf: u64,
}

impl PieceTreeBuilder {
    pub fn new() -> PieceTreeBuilder {
        PieceTreeBuilder::default()
    }

    /// Feeds one chunk of raw bytes. An empty chunk is a no-op. A leading
    /// UTF-8 BOM is recognized and stripped only on the very first
    /// non-empty chunk.
    pub fn accept_chunk(&mut self, mut chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        if self.chunks.is_empty() && self.bom.is_empty() && chunk.starts_with(BOM) {
            self.bom = BOM.to_vec();
            chunk = &chunk[BOM.len()..];
            if chunk.is_empty() {
                return;
            }
        }

        if *chunk.last().unwrap() == b'\r' {
            let body = &chunk[..chunk.len() - 1];
            self.accept_chunk_inner(body);
            self.has_previous_char = true;
            self.previous_char = b'\r';
        } else {
            self.accept_chunk_inner(chunk);
            self.has_previous_char = false;
        }
    }

    fn accept_chunk_inner(&mut self, chunk: &[u8]) {
        if self.has_previous_char {
            let mut glued = Vec::with_capacity(chunk.len() + 1);
            glued.push(self.previous_char);
            glued.extend_from_slice(chunk);
            self.has_previous_char = false;
            self.push_chunk(&glued);
        } else if !chunk.is_empty() {
            self.push_chunk(chunk);
        }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        let scanned = line_starts::compute_full(chunk);
        self.cr += scanned.cr;
        self.lf += scanned.lf;
        self.crlf += scanned.crlf;
        self.chunks.push(chunk.to_vec());
    }

    /// Finalizes the accepted chunks into a [`Factory`]. Any dangling `\r`
    /// carried from the last `accept_chunk` call is appended to the final
    /// chunk here, since there's no further chunk for it to glue onto.
    ///
    /// `normalize_eol` controls whether [`Factory::create`] is allowed to
    /// rewrite mismatched terminators: `false` preserves the document's
    /// existing mixed terminators as-is, and the resulting engine reports
    /// itself as not EOL-normalized.
    pub fn finish(mut self, normalize_eol: bool) -> Factory {
        if self.chunks.is_empty() {
            self.push_chunk(&[]);
        }
        if self.has_previous_char {
            self.has_previous_char = false;
            let last = self.chunks.last_mut().expect("finish: at least one chunk pushed above");
            last.push(self.previous_char);
            if self.previous_char == b'\r' {
                self.cr += 1;
            }
        }

        Factory {
            chunks: self.chunks,
            bom: self.bom,
            cr: self.cr,
            lf: self.lf,
            crlf: self.crlf,
            normalize_eol,
        }
    }
}

/// Holds accepted chunks plus their terminator statistics, ready to build
/// one or more engines sharing the same default EOL decision.
#[derive(Debug, Clone)]
pub struct Factory {
    chunks: Vec<Vec<u8>>,
    bom: Vec<u8>,
    cr: u64,
    lf: u64,
    crlf: u64,
    normalize_eol: bool,
}

impl Factory {
    /// `"\r\n"` if strictly more than half of the accepted terminators were
    /// CR-led, `"\n"` otherwise; `default_eol` only when no terminator was
    /// seen at all.
    fn pick_eol(&self, default_eol: Eol) -> Eol {
        let total = self.cr + self.lf + self.crlf;
        if total == 0 {
            return default_eol;
        }
        if self.cr + self.crlf > total / 2 {
            Eol::CrLf
        } else {
            Eol::Lf
        }
    }

    /// Builds the engine. When `normalize_eol` was set on [`finish`],
    /// terminators that don't match the chosen EOL are rewritten in place
    /// and the engine reports itself as EOL-normalized; otherwise mismatched
    /// terminators are left as they were accepted.
    ///
    /// [`finish`]: super::PieceTreeBuilder::finish
    pub fn create(&self, default_eol: Eol) -> (Engine, Eol) {
        let eol = self.pick_eol(default_eol);
        let needs_normalize = self.normalize_eol
            && match eol {
                Eol::CrLf => self.cr > 0 || self.lf > 0,
                Eol::Lf => self.cr > 0 || self.crlf > 0,
            };

        let buffers = self
            .chunks
            .iter()
            .map(|chunk| {
                if needs_normalize {
                    StringBuffer::new(rewrite_eol(chunk, eol))
                } else {
                    StringBuffer::new(chunk.clone())
                }
            })
            .collect();

        let engine = Engine::from_chunks(buffers, eol, self.normalize_eol);
        (engine, eol)
    }

    pub fn bom(&self) -> &[u8] {
        &self.bom
    }

    /// The first line of the first accepted chunk, truncated to at most
    /// `length_limit` bytes before the terminator search (so a line
    /// without any terminator within the limit is simply cut short).
    pub fn get_first_line_text(&self, length_limit: usize) -> Vec<u8> {
        let Some(first) = self.chunks.first() else {
            return Vec::new();
        };
        let slice = &first[..length_limit.min(first.len())];
        let end = slice.iter().position(|&b| b == b'\n' || b == b'\r').unwrap_or(slice.len());
        slice[..end].to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_bom_from_first_chunk_only() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(&[0xEF, 0xBB, 0xBF, b'a', b'b']);
        let factory = builder.finish(true);
        assert_eq!(BOM, factory.bom());
        let (mut engine, _) = factory.create(Eol::Lf);
        assert_eq!(b"ab".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn carries_dangling_cr_across_chunks() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"a\r");
        builder.accept_chunk(b"\nb");
        let factory = builder.finish(true);
        let (mut engine, _) = factory.create(Eol::Lf);
        assert_eq!(b"a\r\nb".to_vec(), engine.get_lines_raw_content());
        assert_eq!(2, engine.line_count());
    }

    #[test]
    fn dangling_cr_at_finish_is_not_lost() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"a\r");
        let factory = builder.finish(true);
        let (mut engine, _) = factory.create(Eol::Lf);
        assert_eq!(b"a\r".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn picks_crlf_when_majority_of_terminators_are_cr_led() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"a\r\nb\r\nc\nd");
        let factory = builder.finish(true);
        let (_, eol) = factory.create(Eol::Lf);
        assert_eq!(Eol::CrLf, eol);
    }

    #[test]
    fn falls_back_to_default_eol_with_no_terminators() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"no newlines here");
        let factory = builder.finish(true);
        let (_, eol) = factory.create(Eol::CrLf);
        assert_eq!(Eol::CrLf, eol);
    }

    #[test]
    fn normalizes_mismatched_terminators() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"a\r\nb\r\nc\r\nd");
        let factory = builder.finish(true);
        let (mut engine, eol) = factory.create(Eol::Lf);
        assert_eq!(Eol::CrLf, eol);
        assert_eq!(b"a\r\nb\r\nc\r\nd".to_vec(), engine.get_lines_raw_content());
    }

    #[test]
    fn preserves_mismatched_terminators_when_normalize_eol_is_false() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"a\r\nb\nc\r\nd");
        let factory = builder.finish(false);
        let (mut engine, eol) = factory.create(Eol::Lf);
        assert_eq!(Eol::CrLf, eol);
        assert_eq!(b"a\r\nb\nc\r\nd".to_vec(), engine.get_lines_raw_content());
        assert!(!engine.is_eol_normalized());
    }

    #[test]
    fn first_line_text_cuts_at_terminator() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(b"first line\r\nsecond line");
        let factory = builder.finish(true);
        assert_eq!(b"first line".to_vec(), factory.get_first_line_text(100));
        assert_eq!(b"fir".to_vec(), factory.get_first_line_text(3));
    }
}
