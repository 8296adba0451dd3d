use std::fmt;
use std::sync::Arc;

/// A read-only view into a shared piece buffer.
///
/// Piece payloads arrive once from the engine and fan out to every reader
/// that wants a slice of them; views share the backing allocation instead
/// of copying. The reader also reuses the backing buffer past the end of a
/// request as its read-ahead buffer.
#[derive(Clone)]
pub struct Chunk {
    data: Arc<Vec<u8>>,
    start: usize,
    stop: usize,
}

impl Chunk {
    pub(crate) fn new(data: Arc<Vec<u8>>, start: usize, stop: usize) -> Self {
        debug_assert!(start <= stop && stop <= data.len());
        Self { data, start, stop }
    }

    /// A zero-length chunk.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            data: Arc::new(Vec::new()),
            start: 0,
            stop: 0,
        }
    }

    /// Bytes in this view.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.stop]
    }

    /// View length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Drop the first `amount` bytes from the view.
    pub(crate) fn advance(&mut self, amount: usize) {
        debug_assert!(amount <= self.len());
        self.start += amount;
    }

    /// The unconsumed tail of the backing buffer beyond this view.
    pub(crate) fn tail(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            start: self.stop,
            stop: self.data.len(),
        }
    }

    /// Grow the view's end to `stop` within the backing buffer.
    pub(crate) fn with_stop(&self, stop: usize) -> Self {
        debug_assert!(stop >= self.start && stop <= self.data.len());
        Self {
            data: Arc::clone(&self.data),
            start: self.start,
            stop,
        }
    }

    /// Length of the whole backing buffer.
    pub(crate) fn backing_len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn view_start(&self) -> usize {
        self.start
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("backing_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_share_backing_without_copying() {
        let data = Arc::new((0_u8..64).collect::<Vec<_>>());
        let chunk = Chunk::new(Arc::clone(&data), 8, 16);
        assert_eq!(chunk.as_slice(), &(8_u8..16).collect::<Vec<_>>()[..]);
        assert_eq!(chunk.len(), 8);

        let tail = chunk.tail();
        assert_eq!(tail.as_slice().first(), Some(&16));
        assert_eq!(tail.len(), 48);

        let grown = chunk.with_stop(32);
        assert_eq!(grown.len(), 24);
    }

    #[test]
    fn advance_consumes_from_front() {
        let data = Arc::new(vec![1_u8, 2, 3, 4]);
        let mut chunk = Chunk::new(data, 0, 4);
        chunk.advance(3);
        assert_eq!(chunk.as_slice(), &[4]);
        chunk.advance(1);
        assert!(chunk.is_empty());
    }
}
