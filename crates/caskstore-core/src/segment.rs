//! Segment files: the append-only record log
//!
//! A segment is one `*.data` file of framed records (see `format`). Exactly
//! one segment per store is active and accepts appends; every other one is
//! an archive opened read-only. All positioning on the file handle goes
//! through a per-segment mutex which `ValueHandle`s share, so a handle can
//! keep reading while the engine renames or retires the segment.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{CaskError, CaskResult};
use crate::format::{record_checksum, KeyInfo, RecordHeader, RECORD_HEADER_SIZE};
use crate::platform_durability::durable_sync;
use crate::value::ValueHandle;

/// A record read back from a segment with its checksum verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub serial: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Absolute offset of `value` in the data file
    pub value_offset: u32,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// File state guarded by the segment mutex.
#[derive(Debug)]
pub(crate) struct SegmentFile {
    id: u16,
    file: Option<File>,
    path: PathBuf,
    writable: bool,
    /// Serial of the last record appended
    serial: u32,
    size: u64,
}

/// Outcome of decoding framing at a position
enum Frame {
    End,
    Torn,
    Header(RecordHeader),
}

impl SegmentFile {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub(crate) fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> CaskResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or(CaskError::SegmentClosed { segment_id: self.id })?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| CaskError::io_at(&self.path, "segment read failed", e))
    }

    fn frame_at(&mut self, pos: u64) -> CaskResult<Frame> {
        if pos >= self.size {
            return Ok(Frame::End);
        }
        if pos + RECORD_HEADER_SIZE as u64 > self.size {
            return Ok(Frame::Torn);
        }
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.read_exact_at(pos, &mut buf)?;
        let header = RecordHeader::from_bytes(&buf);
        if pos + header.record_len() > self.size {
            return Ok(Frame::Torn);
        }
        Ok(Frame::Header(header))
    }

    fn append(&mut self, key: &[u8], value: &[u8], sync: bool) -> CaskResult<KeyInfo> {
        if !self.writable {
            return Err(CaskError::ReadOnlySegment { segment_id: self.id });
        }
        let key_len = u32::try_from(key.len()).map_err(|_| CaskError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: u32::MAX as u64,
            component: "key",
        })?;
        let value_len = u32::try_from(value.len()).map_err(|_| CaskError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: u32::MAX as u64,
            component: "value",
        })?;

        let offset = self.size;
        let end = offset + RECORD_HEADER_SIZE as u64 + key.len() as u64 + value.len() as u64;
        if end > u32::MAX as u64 {
            return Err(CaskError::SegmentOverflow { segment_id: self.id, size: end });
        }

        // size is bounded by u32::MAX and every record is at least a header
        // long, so the counter cannot wrap within one segment
        let serial = self.serial + 1;
        let header = RecordHeader {
            checksum: record_checksum(key, value),
            serial,
            key_len,
            value_len,
        };
        let mut buf = Vec::with_capacity((end - offset) as usize);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        let file = self
            .file
            .as_mut()
            .ok_or(CaskError::SegmentClosed { segment_id: self.id })?;
        let written = file.seek(SeekFrom::Start(offset)).and_then(|_| file.write_all(&buf));
        if let Err(e) = written {
            // drop any partial frame so the next append starts clean
            let _ = file.set_len(offset);
            return Err(CaskError::io_at(&self.path, "segment append failed", e));
        }
        self.size = end;
        self.serial = serial;

        if sync {
            durable_sync(file).map_err(|e| CaskError::io_at(&self.path, "segment sync failed", e))?;
        }

        Ok(KeyInfo {
            segment_id: self.id,
            serial,
            value_size: value_len,
            value_offset: (offset + RECORD_HEADER_SIZE as u64 + key.len() as u64) as u32,
        })
    }

    fn sync(&mut self) -> CaskResult<()> {
        match self.file.as_ref() {
            Some(file) => {
                durable_sync(file)
                    .map_err(|e| CaskError::io_at(&self.path, "segment sync failed", e))
            }
            None => Ok(()),
        }
    }
}

fn open_file(path: &Path, writable: bool, create: bool) -> CaskResult<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if writable {
        options.write(true);
    }
    if create {
        options.create(true).truncate(true);
    }
    options
        .open(path)
        .map_err(|e| CaskError::io_at(path, "failed to open segment", e))
}

fn file_len(file: &File, path: &Path) -> CaskResult<u64> {
    file.metadata()
        .map(|m| m.len())
        .map_err(|e| CaskError::io_at(path, "failed to stat segment", e))
}

/// One append-only data file.
#[derive(Debug)]
pub struct Segment {
    id: u16,
    shared: Arc<Mutex<SegmentFile>>,
}

impl Segment {
    fn from_parts(
        id: u16,
        file: File,
        path: PathBuf,
        writable: bool,
        serial: u32,
        size: u64,
    ) -> Self {
        Self {
            id,
            shared: Arc::new(Mutex::new(SegmentFile {
                id,
                file: Some(file),
                path,
                writable,
                serial,
                size,
            })),
        }
    }

    /// Create (or truncate) `path` as an empty active segment.
    pub fn create_active(path: &Path, id: u16) -> CaskResult<Self> {
        let file = open_file(path, true, true)?;
        debug!(segment = id, path = %path.display(), "created active segment");
        Ok(Self::from_parts(id, file, path.to_path_buf(), true, 0, 0))
    }

    /// Reopen an existing file for appending, continuing after `serial`.
    pub fn open_active(path: &Path, id: u16, serial: u32) -> CaskResult<Self> {
        let file = open_file(path, true, false)?;
        let size = file_len(&file, path)?;
        debug!(segment = id, size, serial, "reopened active segment");
        Ok(Self::from_parts(id, file, path.to_path_buf(), true, serial, size))
    }

    /// Open an existing file read-only.
    pub fn open_archive(path: &Path, id: u16) -> CaskResult<Self> {
        let file = open_file(path, false, false)?;
        let size = file_len(&file, path)?;
        trace!(segment = id, size, "opened archive segment");
        Ok(Self::from_parts(id, file, path.to_path_buf(), false, 0, size))
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        self.shared.lock().path.clone()
    }

    /// Path of the hint file that sits next to this segment.
    pub fn hint_path(&self) -> PathBuf {
        self.path().with_extension("hint")
    }

    pub fn size(&self) -> u64 {
        self.shared.lock().size
    }

    /// Append one record. An empty `value` writes a tombstone.
    pub fn write(&self, key: &[u8], value: &[u8], sync: bool) -> CaskResult<KeyInfo> {
        self.shared.lock().append(key, value, sync)
    }

    /// Handle over the value bytes `info` points at.
    pub fn read_value(&self, info: &KeyInfo) -> CaskResult<ValueHandle> {
        ValueHandle::open(
            Arc::clone(&self.shared),
            info.value_offset as u64,
            info.value_size as u64,
        )
    }

    /// Checksummed records from offset 0. Mismatches are skipped.
    pub fn records(&self) -> RecordIter {
        RecordIter {
            shared: Arc::clone(&self.shared),
            segment_id: self.id,
            pos: 0,
            corrupt: 0,
            done: false,
        }
    }

    /// Keys and locations from offset 0, without reading or checking values.
    pub fn keys(&self) -> KeyIter {
        self.keys_from(0)
    }

    /// Like `keys`, starting at a record boundary `offset`.
    pub fn keys_from(&self, offset: u64) -> KeyIter {
        KeyIter {
            shared: Arc::clone(&self.shared),
            segment_id: self.id,
            pos: offset,
            torn: false,
            done: false,
        }
    }

    /// Durably sync whatever has been appended so far.
    pub fn flush(&self) -> CaskResult<()> {
        self.shared.lock().sync()
    }

    /// Sync and reopen read-only. Existing value handles keep working.
    pub fn make_archive(&self) -> CaskResult<()> {
        let mut inner = self.shared.lock();
        if !inner.writable {
            return Ok(());
        }
        inner.sync()?;
        let file = open_file(&inner.path, false, false)?;
        inner.file = Some(file);
        inner.writable = false;
        debug!(segment = self.id, size = inner.size, "segment archived");
        Ok(())
    }

    /// Move the data file to `new_path` and reopen it there.
    ///
    /// The handle is released for the rename, so the move also works where
    /// open files cannot be renamed. Readers blocked on the segment lock
    /// see either the old file or the new one.
    pub fn rename(&self, new_path: &Path) -> CaskResult<()> {
        let mut inner = self.shared.lock();
        let writable = inner.writable;
        inner.file = None;
        if let Err(e) = fs::rename(&inner.path, new_path) {
            let context = format!("failed to rename to {}", new_path.display());
            let err = CaskError::io_at(&inner.path, &context, e);
            // stay readable under the old name
            inner.file = open_file(&inner.path, writable, false).ok();
            return Err(err);
        }
        inner.path = new_path.to_path_buf();
        inner.file = Some(open_file(new_path, writable, false)?);
        trace!(segment = self.id, path = %new_path.display(), "segment renamed");
        Ok(())
    }

    /// Cut the file back to `len` bytes, discarding a torn tail.
    pub fn truncate_to(&self, len: u64) -> CaskResult<()> {
        let mut inner = self.shared.lock();
        if let Some(file) = inner.file.as_ref() {
            file.set_len(len)
                .map_err(|e| CaskError::io_at(&inner.path, "failed to truncate segment", e))?;
        }
        inner.size = len;
        Ok(())
    }

    /// Release the file handle. Reads through this segment fail afterwards.
    pub fn close(&self) -> CaskResult<()> {
        let mut inner = self.shared.lock();
        let result = if inner.writable { inner.sync() } else { Ok(()) };
        inner.file = None;
        result
    }
}

/// Lazy walk over a segment's checksummed records.
///
/// Each pull takes the segment lock just long enough to read one record.
pub struct RecordIter {
    shared: Arc<Mutex<SegmentFile>>,
    segment_id: u16,
    pos: u64,
    corrupt: u64,
    done: bool,
}

impl RecordIter {
    /// Records skipped so far for failing their checksum
    pub fn corrupt_skipped(&self) -> u64 {
        self.corrupt
    }
}

impl Iterator for RecordIter {
    type Item = CaskResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let pos = self.pos;
            let (header, body) = {
                let mut inner = self.shared.lock();
                let header = match inner.frame_at(pos) {
                    Ok(Frame::Header(header)) => header,
                    Ok(Frame::End) => {
                        self.done = true;
                        return None;
                    }
                    Ok(Frame::Torn) => {
                        warn!(
                            segment = self.segment_id,
                            offset = pos,
                            "torn record at end of segment"
                        );
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                let mut body = vec![0u8; header.key_len as usize + header.value_len as usize];
                if let Err(e) = inner.read_exact_at(pos + RECORD_HEADER_SIZE as u64, &mut body) {
                    self.done = true;
                    return Some(Err(e));
                }
                (header, body)
            };
            self.pos = pos + header.record_len();

            let (key, value) = body.split_at(header.key_len as usize);
            if header.checksum != record_checksum(key, value) {
                self.corrupt += 1;
                warn!(segment = self.segment_id, offset = pos, "skipping record with bad checksum");
                continue;
            }
            let value_offset = (pos + RECORD_HEADER_SIZE as u64 + header.key_len as u64) as u32;
            let value = value.to_vec();
            let mut key = body;
            key.truncate(header.key_len as usize);
            return Some(Ok(Record {
                serial: header.serial,
                key,
                value,
                value_offset,
            }));
        }
        None
    }
}

/// Lazy walk over a segment's framing that reads keys only.
pub struct KeyIter {
    shared: Arc<Mutex<SegmentFile>>,
    segment_id: u16,
    pos: u64,
    torn: bool,
    done: bool,
}

impl KeyIter {
    /// End of the last complete record seen so far
    pub fn valid_end(&self) -> u64 {
        self.pos
    }

    /// True once the walk stopped at a record cut short by end-of-file
    pub fn hit_torn_tail(&self) -> bool {
        self.torn
    }
}

impl Iterator for KeyIter {
    type Item = CaskResult<(Vec<u8>, KeyInfo)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let pos = self.pos;
        let mut inner = self.shared.lock();
        let header = match inner.frame_at(pos) {
            Ok(Frame::Header(header)) => header,
            Ok(Frame::End) => {
                self.done = true;
                return None;
            }
            Ok(Frame::Torn) => {
                self.torn = true;
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let mut key = vec![0u8; header.key_len as usize];
        if let Err(e) = inner.read_exact_at(pos + RECORD_HEADER_SIZE as u64, &mut key) {
            self.done = true;
            return Some(Err(e));
        }
        drop(inner);

        self.pos = pos + header.record_len();
        let info = KeyInfo {
            segment_id: self.segment_id,
            serial: header.serial,
            value_size: header.value_len,
            value_offset: (pos + RECORD_HEADER_SIZE as u64 + header.key_len as u64) as u32,
        };
        Some(Ok((key, info)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn active(dir: &TempDir) -> Segment {
        Segment::create_active(&dir.path().join("store_1.data"), 1).unwrap()
    }

    #[test]
    fn test_write_layout_and_serials() {
        let dir = TempDir::new().unwrap();
        let segment = active(&dir);

        let first = segment.write(b"foo", b"bar", false).unwrap();
        assert_eq!(first.serial, 1);
        assert_eq!(first.value_offset, 28 + 3);
        assert_eq!(first.value_size, 3);

        let second = segment.write(b"k", b"", false).unwrap();
        assert_eq!(second.serial, 2);
        assert!(second.is_tombstone());
        assert_eq!(segment.size(), 34 + 29);

        let bytes = fs::read(segment.path()).unwrap();
        assert_eq!(bytes.len(), 63);
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
        assert_eq!(&bytes[28..34], b"foobar");
        // tombstone digest is zero-filled
        assert_eq!(&bytes[34..50], &[0u8; 16]);
    }

    #[test]
    fn test_read_value() {
        let dir = TempDir::new().unwrap();
        let segment = active(&dir);
        segment.write(b"a", b"first", false).unwrap();
        let info = segment.write(b"b", b"second", false).unwrap();

        let mut handle = segment.read_value(&info).unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"second");
    }

    #[test]
    fn test_archive_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let segment = active(&dir);
        let info = segment.write(b"a", b"1", false).unwrap();
        segment.make_archive().unwrap();

        assert!(matches!(
            segment.write(b"b", b"2", false),
            Err(CaskError::ReadOnlySegment { segment_id: 1 })
        ));
        assert_eq!(segment.read_value(&info).unwrap().to_vec().unwrap(), b"1");
    }

    #[test]
    fn test_records_skip_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.data");
        {
            let segment = Segment::create_active(&path, 1).unwrap();
            segment.write(b"foo1", b"bar1", false).unwrap();
            segment.write(b"foo2", b"bar2", false).unwrap();
            segment.write(b"foo3", b"", false).unwrap();
            segment.close().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes[32] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let segment = Segment::open_archive(&path, 1).unwrap();
        let mut records = segment.records();
        let kept: Vec<Record> = records.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records.corrupt_skipped(), 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].key, b"foo2");
        assert_eq!(kept[0].serial, 2);
        assert!(kept[1].is_tombstone());
    }

    #[test]
    fn test_keys_stop_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.data");
        {
            let segment = Segment::create_active(&path, 1).unwrap();
            segment.write(b"foo1", b"bar1", false).unwrap();
            segment.write(b"foo2", b"bar2", false).unwrap();
            segment.close().unwrap();
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(36 + 20).unwrap();

        let segment = Segment::open_archive(&path, 1).unwrap();
        let mut keys = segment.keys();
        let found: Vec<_> = keys.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, b"foo1");
        assert_eq!(found[0].1.value_offset, 32);
        assert!(keys.hit_torn_tail());
        assert_eq!(keys.valid_end(), 36);
    }

    #[test]
    fn test_reopen_active_continues_serial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store_1.data");
        {
            let segment = Segment::create_active(&path, 1).unwrap();
            segment.write(b"a", b"1", false).unwrap();
            segment.write(b"b", b"2", false).unwrap();
            segment.close().unwrap();
        }
        let segment = Segment::open_active(&path, 1, 2).unwrap();
        let info = segment.write(b"c", b"3", false).unwrap();
        assert_eq!(info.serial, 3);
        assert_eq!(segment.keys().count(), 3);
    }

    #[test]
    fn test_rename_keeps_handles_valid() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create_active(&dir.path().join("merge_1.data"), 1).unwrap();
        let big = vec![7u8; 40 * 1024];
        let info = segment.write(b"big", &big, false).unwrap();
        segment.make_archive().unwrap();

        let mut handle = segment.read_value(&info).unwrap();
        let mut head = [0u8; 10];
        handle.read_exact(&mut head).unwrap();

        let target = dir.path().join("store_1.data");
        segment.rename(&target).unwrap();
        assert_eq!(segment.path(), target);
        assert!(!dir.path().join("merge_1.data").exists());

        let mut rest = Vec::new();
        handle.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), big.len() - 10);
    }

    #[test]
    fn test_closed_segment_reads_fail() {
        let dir = TempDir::new().unwrap();
        let segment = active(&dir);
        let info = segment.write(b"a", b"1", false).unwrap();
        segment.close().unwrap();
        assert!(matches!(
            segment.read_value(&info),
            Err(CaskError::SegmentClosed { segment_id: 1 })
        ));
    }
}
