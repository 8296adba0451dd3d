use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use peervod_core::TorrentSlice;

use crate::chunk::Chunk;
use crate::engine::EngineShared;
use crate::request::{MetainfoSource, RequestMode, RequestParams};

/// A buffered, seekable reader over a byte range of a torrent.
///
/// Each read submits a READ request sized to the bytes still needed and
/// drains it; the unconsumed tail of the last delivered piece is kept as a
/// buffer for the next read. Torrent pieces are typically much larger than
/// caller buffers and rarely aligned to them, so the buffer does most of
/// the work on sequential streams.
///
/// Readers on the same slice are independent and share no buffer. A reader
/// is not `Sync`; `seek` and `read` exclude each other by `&mut self`.
pub struct TorrentReader {
    engine: Arc<EngineShared>,
    slice: TorrentSlice,
    source: MetainfoSource,
    user: String,
    tracker: Option<String>,
    /// Absolute offset within the torrent; `slice.start ..= slice.stop`.
    offset: u64,
    buffer: Option<Chunk>,
}

impl TorrentReader {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        slice: TorrentSlice,
        source: MetainfoSource,
        user: String,
        tracker: Option<String>,
    ) -> Self {
        Self {
            engine,
            slice,
            source,
            user,
            tracker,
            offset: slice.start,
            buffer: None,
        }
    }

    /// The byte range this reader serves.
    #[must_use]
    pub fn slice(&self) -> TorrentSlice {
        self.slice
    }

    /// Read like [`Read::read`], but return as soon as the first piece
    /// boundary delivers data ("some data now").
    ///
    /// # Errors
    ///
    /// Engine errors map to [`io::Error`]; cancellation surfaces as
    /// [`io::ErrorKind::ConnectionAborted`].
    pub fn read1(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.fill(out, true)
    }

    /// Fill the caller's buffer completely, stopping early only at the end
    /// of the slice. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Engine errors map to [`io::Error`]; cancellation surfaces as
    /// [`io::ErrorKind::ConnectionAborted`].
    pub fn read_into(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < out.len() {
            let amount = self.fill(&mut out[written..], false)?;
            if amount == 0 {
                break;
            }
            written += amount;
        }
        Ok(written)
    }

    fn fill(&mut self, out: &mut [u8], read1: bool) -> io::Result<usize> {
        let remaining = self.slice.stop.saturating_sub(self.offset);
        let mut target = out
            .len()
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let mut written = 0_usize;

        // Serve from the buffer first.
        if target > 0
            && let Some(buffer) = &mut self.buffer
        {
            let amount = buffer.len().min(target);
            out[..amount].copy_from_slice(&buffer.as_slice()[..amount]);
            buffer.advance(amount);
            if buffer.is_empty() {
                self.buffer = None;
            }
            written += amount;
            self.offset += amount as u64;
            target -= amount;
        }
        if target == 0 || (read1 && written > 0) {
            return Ok(written);
        }

        // For read1, request a single byte: exactly one piece arrives, and
        // the delivered chunk is then widened within that piece.
        let request_stop = if read1 {
            self.offset + 1
        } else {
            self.offset + target as u64
        };
        let params = {
            let mut params = RequestParams::new(
                TorrentSlice::new(self.slice.info_hash, self.offset, request_stop),
                RequestMode::Read,
                self.user.clone(),
                self.source.clone(),
            );
            params.tracker.clone_from(&self.tracker);
            params
        };
        let request = self.engine.add_request(params);

        while request.has_next() {
            let chunk = request
                .next_chunk(None)
                .map_err(io::Error::from)?
                .unwrap_or_else(Chunk::empty);
            if chunk.is_empty() {
                break;
            }
            let chunk = if read1 {
                let grow = target.min(chunk.backing_len() - chunk.view_start());
                chunk.with_stop(chunk.view_start() + grow)
            } else {
                chunk
            };
            let amount = chunk.len().min(target);
            out[written..written + amount].copy_from_slice(&chunk.as_slice()[..amount]);
            written += amount;
            self.offset += amount as u64;
            target -= amount;

            // Keep the leftover of the delivered piece for the next read.
            let tail = chunk.tail();
            self.buffer = (!tail.is_empty()).then_some(tail);
            if read1 {
                break;
            }
        }
        Ok(written)
    }
}

impl Read for TorrentReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.fill(out, false)
    }
}

impl Seek for TorrentReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let base = match pos {
            SeekFrom::Start(offset) => {
                i128::from(self.slice.start) + i128::from(offset)
            }
            SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.slice.stop) + i128::from(delta),
        };
        if base < i128::from(self.slice.start) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of slice",
            ));
        }
        let offset = u64::try_from(base)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek offset overflow"))?;
        if offset != self.offset {
            // The buffer could be kept when the target still falls inside
            // it; dropping it is always correct.
            self.buffer = None;
            self.offset = offset;
        }
        Ok(self.offset - self.slice.start)
    }
}
