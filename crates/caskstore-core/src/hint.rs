//! Hint files
//!
//! A hint file lists, for one segment, every key with the location of its
//! value so the index can be rebuilt without reading values. Hints are
//! derived data: a missing or damaged hint file only costs a raw scan.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CaskError, CaskResult};
use crate::format::{HintHeader, KeyInfo, HINT_HEADER_SIZE};
use crate::platform_durability::durable_sync;

/// Buffered writer for a new hint file.
pub struct HintWriter {
    out: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl HintWriter {
    /// Create (or truncate) the hint file at `path`.
    pub fn create(path: &Path) -> CaskResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CaskError::io_at(path, "failed to create hint file", e))?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            entries: 0,
        })
    }

    /// Append one entry for a record already written at `info`.
    pub fn write_hint(&mut self, key: &[u8], info: &KeyInfo) -> CaskResult<()> {
        let header = HintHeader {
            serial: info.serial,
            key_len: key.len() as u32,
            value_len: info.value_size,
            value_offset: info.value_offset,
        };
        self.out
            .write_all(&header.to_bytes())
            .and_then(|_| self.out.write_all(key))
            .map_err(|e| CaskError::io_at(&self.path, "hint write failed", e))?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Flush buffered entries and durably sync the file.
    pub fn finish(self) -> CaskResult<()> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| CaskError::io_at(&path, "hint flush failed", e.into_error()))?;
        durable_sync(&file).map_err(|e| CaskError::io_at(&path, "hint sync failed", e))
    }
}

/// One decoded hint entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintEntry {
    pub key: Vec<u8>,
    pub header: HintHeader,
}

/// Lazy reader over a hint file.
pub struct HintIter {
    reader: BufReader<File>,
    path: PathBuf,
    max_key_size: usize,
    offset: u64,
    entry: u64,
    done: bool,
}

impl HintIter {
    pub fn open(path: &Path, max_key_size: usize) -> CaskResult<Self> {
        let file =
            File::open(path).map_err(|e| CaskError::io_at(path, "failed to open hint file", e))?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            max_key_size,
            offset: 0,
            entry: 0,
            done: false,
        })
    }

    fn next_entry(&mut self) -> CaskResult<Option<HintEntry>> {
        let mut buf = [0u8; HINT_HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut buf)
            .map_err(|e| CaskError::io_at(&self.path, "hint read failed", e))?;
        if got == 0 {
            return Ok(None);
        }
        if got < HINT_HEADER_SIZE {
            return Err(CaskError::CorruptHint {
                path: self.path.clone(),
                offset: self.offset,
                reason: format!("header cut short after {} bytes", got),
            });
        }
        self.entry += 1;
        let header = HintHeader::from_bytes(&buf);
        if header.key_len as usize > self.max_key_size {
            return Err(CaskError::CorruptKey {
                path: self.path.clone(),
                entry: self.entry,
                key_len: header.key_len,
                max_key_size: self.max_key_size,
            });
        }

        let mut key = vec![0u8; header.key_len as usize];
        let got = read_full(&mut self.reader, &mut key)
            .map_err(|e| CaskError::io_at(&self.path, "hint read failed", e))?;
        if got < key.len() {
            return Err(CaskError::CorruptHint {
                path: self.path.clone(),
                offset: self.offset,
                reason: format!("key cut short: {} of {} bytes", got, key.len()),
            });
        }
        self.offset += (HINT_HEADER_SIZE + key.len()) as u64;
        Ok(Some(HintEntry { key, header }))
    }
}

impl Iterator for HintIter {
    type Item = CaskResult<HintEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                if matches!(e, CaskError::CorruptKey { .. } | CaskError::CorruptHint { .. }) {
                    warn!(path = %self.path.display(), error = %e, "damaged hint entry");
                }
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a whole hint file into index entries for `segment_id`.
///
/// All or nothing: the first bad entry fails the whole file.
pub fn read_hints(
    path: &Path,
    segment_id: u16,
    max_key_size: usize,
) -> CaskResult<Vec<(Vec<u8>, KeyInfo)>> {
    HintIter::open(path, max_key_size)?
        .map(|entry| entry.map(|e| (e.key, KeyInfo::from_hint(segment_id, &e.header))))
        .collect()
}

/// Like `read_exact`, but reports how much was read before end-of-file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(serial: u32, value_size: u32, value_offset: u32) -> KeyInfo {
        KeyInfo { segment_id: 9, serial, value_size, value_offset }
    }

    #[test]
    fn test_write_and_read_hints() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_3.hint");
        let mut writer = HintWriter::create(&path).unwrap();
        writer.write_hint(b"alpha", &info(1, 10, 33)).unwrap();
        writer.write_hint(b"b", &info(2, 4, 71)).unwrap();
        assert_eq!(writer.entries(), 2);
        writer.finish().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), (16 + 5 + 16 + 1) as u64);

        let hints = read_hints(&path, 3, 4096).unwrap();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].0, b"alpha");
        let expected = KeyInfo { segment_id: 3, serial: 1, value_size: 10, value_offset: 33 };
        assert_eq!(hints[0].1, expected);
        assert_eq!(hints[1].1.value_offset, 71);
    }

    #[test]
    fn test_oversized_key_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.hint");
        let mut writer = HintWriter::create(&path).unwrap();
        writer.write_hint(b"ok", &info(1, 1, 30)).unwrap();
        writer.write_hint(&[b'x'; 64], &info(2, 1, 100)).unwrap();
        writer.finish().unwrap();

        let err = read_hints(&path, 1, 32).unwrap_err();
        match err {
            CaskError::CorruptKey { entry, key_len, max_key_size, .. } => {
                assert_eq!(entry, 2);
                assert_eq!(key_len, 64);
                assert_eq!(max_key_size, 32);
            }
            other => panic!("expected CorruptKey, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.hint");
        let mut writer = HintWriter::create(&path).unwrap();
        writer.write_hint(b"key-one", &info(1, 1, 30)).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(read_hints(&path, 1, 4096), Err(CaskError::CorruptHint { .. })));

        std::fs::write(&path, &bytes[..10]).unwrap();
        let result = read_hints(&path, 1, 4096);
        assert!(matches!(result, Err(CaskError::CorruptHint { offset: 0, .. })));
    }

    #[test]
    fn test_empty_hint_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.hint");
        HintWriter::create(&path).unwrap().finish().unwrap();
        assert!(read_hints(&path, 1, 4096).unwrap().is_empty());
    }
}
