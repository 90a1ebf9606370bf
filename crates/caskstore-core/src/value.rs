//! Lazy readers over a value's byte range

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CaskError, CaskResult};
use crate::segment::SegmentFile;

/// Values up to this size are buffered when the handle is created;
/// larger ones are read in chunks of this size.
pub const MEMORIZE_THRESHOLD: usize = 16 * 1024;

/// Forward-only reader over one value stored in a segment.
///
/// Small values are copied out while the segment lock is held during
/// construction, so the handle stays readable after the segment is
/// retired. Large values take the segment lock again for every chunk;
/// if the segment is closed before the last chunk, reading fails.
pub struct ValueHandle {
    source: Arc<Mutex<SegmentFile>>,
    offset: u64,
    len: u64,
    pos: u64,
    memorized: Option<Vec<u8>>,
    chunk: Vec<u8>,
    chunk_start: u64,
}

impl ValueHandle {
    pub(crate) fn open(source: Arc<Mutex<SegmentFile>>, offset: u64, len: u64) -> CaskResult<Self> {
        let mut handle = Self {
            source,
            offset,
            len,
            pos: 0,
            memorized: None,
            chunk: Vec::new(),
            chunk_start: 0,
        };
        if len <= MEMORIZE_THRESHOLD as u64 {
            handle.load_all()?;
        }
        Ok(handle)
    }

    fn load_all(&mut self) -> CaskResult<()> {
        let mut bytes = vec![0u8; self.len as usize];
        if !bytes.is_empty() {
            self.source.lock().read_exact_at(self.offset, &mut bytes)?;
        }
        self.memorized = Some(bytes);
        self.chunk = Vec::new();
        Ok(())
    }

    /// Total value length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the whole value is held in memory
    pub fn is_memorized(&self) -> bool {
        self.memorized.is_some()
    }

    /// Buffer the whole value now.
    ///
    /// Fails with `InvalidState` once reading has started.
    pub fn memorize(&mut self) -> CaskResult<()> {
        if self.memorized.is_some() {
            return Ok(());
        }
        if self.pos > 0 {
            return Err(CaskError::InvalidState(
                "cannot memorize a value after reading has begun".to_string(),
            ));
        }
        self.load_all()
    }

    /// Read everything from the current position to the end.
    pub fn to_vec(&mut self) -> CaskResult<Vec<u8>> {
        if let Some(bytes) = &self.memorized {
            let rest = bytes[self.pos as usize..].to_vec();
            self.pos = self.len;
            return Ok(rest);
        }
        let mut out = Vec::with_capacity((self.len - self.pos) as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    fn fill_chunk(&mut self) -> CaskResult<()> {
        let want = (self.len - self.pos).min(MEMORIZE_THRESHOLD as u64) as usize;
        self.chunk.resize(want, 0);
        self.source
            .lock()
            .read_exact_at(self.offset + self.pos, &mut self.chunk)?;
        self.chunk_start = self.pos;
        Ok(())
    }
}

impl Read for ValueHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let n = if let Some(bytes) = &self.memorized {
            let start = self.pos as usize;
            let n = buf.len().min(bytes.len() - start);
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            n
        } else {
            if self.pos >= self.chunk_start + self.chunk.len() as u64 {
                self.fill_chunk()?;
            }
            let start = (self.pos - self.chunk_start) as usize;
            let n = buf.len().min(self.chunk.len() - start);
            buf[..n].copy_from_slice(&self.chunk[start..start + n]);
            n
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("memorized", &self.memorized.is_some())
            .finish()
    }
}
