//! Backing storage for piece content: one append-only change buffer at
//! index 0, plus zero or more immutable original buffers.

use crate::line_starts;

/// `(buffer, lineStarts)` pair. `line_starts[0] == 0`; every other entry is
/// the offset of the byte right after a line terminator in `buffer`.
#[derive(Debug, Clone, Default)]
pub(crate) struct StringBuffer {
    pub buffer: Vec<u8>,
    pub line_starts: Vec<u64>,
}

impl StringBuffer {
    pub fn new(buffer: Vec<u8>) -> Self {
        let line_starts = line_starts::compute_fast(&buffer);
        StringBuffer {
            buffer,
            line_starts,
        }
    }

    pub fn from_parts(buffer: Vec<u8>, line_starts: Vec<u64>) -> Self {
        StringBuffer {
            buffer,
            line_starts,
        }
    }

    pub fn empty() -> Self {
        StringBuffer {
            buffer: Vec::new(),
            line_starts: vec![0],
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    #[inline]
    pub fn line_count(&self) -> u64 {
        self.line_starts.len() as u64
    }

    /// Append bytes to the buffer, extending `line_starts` in lock-step.
    ///
    /// Repairs the case where the buffer previously ended on a lone `\r`
    /// and `bytes` begins with `\n`: the line start the earlier scan
    /// recorded right after that `\r` would otherwise split a `\r\n` pair
    /// across two "lines" of the same buffer, so it is popped before the
    /// suffix is rescanned.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let start = self.buffer.len() as u64;
        let hit_crlf = self.buffer.last() == Some(&b'\r') && bytes.first() == Some(&b'\n');
        if hit_crlf {
            self.line_starts.pop();
        }

        self.buffer.extend_from_slice(bytes);

        let suffix_starts = line_starts::compute_fast(bytes);
        self.line_starts
            .extend(suffix_starts.into_iter().skip(1).map(|s| s + start));
    }

    /// Byte offset of a cursor `(line, column)` within this buffer.
    #[inline]
    pub fn offset_of(&self, line: u64, column: u64) -> u64 {
        self.line_starts[line as usize] + column
    }

    /// Last line index (0-based) containing `offset`, via binary search.
    pub fn line_at_offset(&self, offset: u64) -> u64 {
        match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx as u64,
            Err(idx) => (idx - 1) as u64,
        }
    }
}

/// Ordered sequence of buffers: index 0 is the mutable change buffer,
/// indices `1..` are immutable original buffers contributed by the builder
/// or split off from an oversized insertion.
#[derive(Debug, Clone)]
pub(crate) struct BufferPool {
    buffers: Vec<StringBuffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            buffers: vec![StringBuffer::empty()],
        }
    }

    pub fn with_originals(originals: Vec<StringBuffer>) -> Self {
        let mut buffers = Vec::with_capacity(originals.len() + 1);
        buffers.push(StringBuffer::empty());
        buffers.extend(originals);
        BufferPool { buffers }
    }

    #[inline]
    pub fn get(&self, index: usize) -> &StringBuffer {
        &self.buffers[index]
    }

    #[inline]
    pub fn change_buffer(&self) -> &StringBuffer {
        &self.buffers[0]
    }

    #[inline]
    pub fn change_buffer_mut(&mut self) -> &mut StringBuffer {
        &mut self.buffers[0]
    }

    /// Adds a new immutable original buffer, returning its index.
    pub fn push_original(&mut self, buffer: StringBuffer) -> usize {
        self.buffers.push(buffer);
        self.buffers.len() - 1
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_tracks_line_starts() {
        let mut buf = StringBuffer::empty();
        buf.append(b"abc\n");
        buf.append(b"def");
        assert_eq!(vec![0, 4], buf.line_starts);
        assert_eq!(7, buf.len());
    }

    #[test]
    fn append_repairs_split_crlf() {
        let mut buf = StringBuffer::empty();
        buf.append(b"abc\r");
        assert_eq!(vec![0, 4], buf.line_starts);
        buf.append(b"\ndef");
        // the spurious line start after the lone \r must be gone, replaced
        // by one right after the \r\n pair
        assert_eq!(vec![0, 5], buf.line_starts);
    }

    #[test]
    fn line_at_offset_binary_search() {
        let buf = StringBuffer::new(b"aaa\nbbb\nccc".to_vec());
        assert_eq!(0, buf.line_at_offset(0));
        assert_eq!(0, buf.line_at_offset(3));
        assert_eq!(1, buf.line_at_offset(4));
        assert_eq!(2, buf.line_at_offset(8));
    }
}
