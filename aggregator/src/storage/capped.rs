//! Capped ring store
//!
//! Fixed-size, file-backed circular store for variable-length payloads. Every
//! record gets an id equal to its absolute write offset; once the ring wraps
//! past a record its id is permanently expired.
//!
//! File layout: a 24-byte header (committed index, resize base index, ring
//! size) followed by `size` bytes of ring data. A record is
//! `[u32 little-endian length][payload]` and may wrap around the ring end.
//!
//! Writers are serialized by `write_lock`. Readers do not take it: they check
//! the requested id against [`CappedStore::smallest_non_expired_id`] before and
//! after reading, and discard the bytes if a concurrent writer reserved the
//! region in between. Resizing takes the layout write lock, so it waits for
//! in-flight reads and blocks new ones while data is moved.

use crate::error::Result;
use crate::metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use trellis_shared::codec;

const HEADER_LEN: u64 = 24;
const LENGTH_PREFIX: u64 = 4;

/// Identifies one record in one capped store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CappedId(pub i64);

/// Result of resolving a capped id.
#[derive(Debug, Clone, PartialEq)]
pub enum Capped<T> {
    /// The record is still in the ring
    Valid(T),
    /// The ring has wrapped past the record (or it was never written)
    Expired,
    /// No record was referenced
    Absent,
}

impl<T> Capped<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Capped::Valid(value) => Some(value),
            Capped::Expired | Capped::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    /// Oldest id retained by the last resize; ids map to ring offset `(id - base) % size`
    base_index: u64,
    size: u64,
}

impl Layout {
    fn position(&self, id: u64) -> u64 {
        (id - self.base_index) % self.size
    }

    fn smallest_non_expired(&self, reserved_index: u64) -> u64 {
        self.base_index.max(reserved_index.saturating_sub(self.size))
    }
}

pub struct CappedStore {
    path: PathBuf,
    file: File,
    write_lock: Mutex<()>,
    /// Advanced before a writer touches ring bytes
    reserved_index: AtomicU64,
    /// Advanced after the bytes are fully written
    committed_index: AtomicU64,
    layout: RwLock<Layout>,
}

impl CappedStore {
    /// Open (or create) the store at `path`, resizing if the existing ring
    /// size differs from `size_bytes`.
    pub fn open(path: &Path, size_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let existing = if file.metadata()?.len() >= HEADER_LEN {
            let mut header = [0u8; HEADER_LEN as usize];
            file.read_exact_at(&mut header, 0)?;
            let field = |i: usize| {
                let mut b = [0u8; 8];
                b.copy_from_slice(&header[i * 8..i * 8 + 8]);
                u64::from_le_bytes(b)
            };
            Some((field(0), field(1), field(2)))
        } else {
            None
        };

        let (committed, base_index, size) = match existing {
            Some((committed, base_index, size)) if size > 0 => (committed, base_index, size),
            _ => {
                file.set_len(HEADER_LEN + size_bytes)?;
                (0, 0, size_bytes)
            }
        };

        let store = Self {
            path: path.to_path_buf(),
            file,
            write_lock: Mutex::new(()),
            reserved_index: AtomicU64::new(committed),
            committed_index: AtomicU64::new(committed),
            layout: RwLock::new(Layout { base_index, size }),
        };
        store.write_header(committed, Layout { base_index, size })?;
        tracing::info!(
            path = %path.display(),
            size_bytes = size,
            current_index = committed,
            "Opened capped store"
        );
        if size != size_bytes {
            store.resize(size_bytes)?;
        }
        Ok(store)
    }

    /// Ring size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(self.layout.read()?.size)
    }

    /// Smallest id that can still be read. Every id below it is expired.
    pub fn smallest_non_expired_id(&self) -> Result<i64> {
        let layout = self.layout.read()?;
        Ok(layout.smallest_non_expired(self.reserved_index.load(Ordering::SeqCst)) as i64)
    }

    pub fn write_message<T: Serialize>(&self, message: &T) -> Result<CappedId> {
        let bytes = codec::encode(message)?;
        self.write_bytes(&bytes)
    }

    /// Write a list as one record of length-delimited messages.
    pub fn write_messages<T: Serialize>(&self, messages: &[T]) -> Result<CappedId> {
        let bytes = codec::encode_delimited(messages)?;
        self.write_bytes(&bytes)
    }

    pub fn read_message<T: DeserializeOwned>(&self, id: CappedId) -> Result<Capped<T>> {
        match self.read_bytes(id)? {
            Capped::Valid(bytes) => Ok(Capped::Valid(codec::decode(&bytes)?)),
            Capped::Expired => Ok(Capped::Expired),
            Capped::Absent => Ok(Capped::Absent),
        }
    }

    pub fn read_messages<T: DeserializeOwned>(&self, id: CappedId) -> Result<Capped<Vec<T>>> {
        match self.read_bytes(id)? {
            Capped::Valid(bytes) => Ok(Capped::Valid(codec::decode_delimited(&bytes)?)),
            Capped::Expired => Ok(Capped::Expired),
            Capped::Absent => Ok(Capped::Absent),
        }
    }

    /// Resolve an optional reference; `None` is [`Capped::Absent`].
    pub fn read_optional<T: DeserializeOwned>(&self, id: Option<CappedId>) -> Result<Capped<T>> {
        match id {
            Some(id) => self.read_message(id),
            None => Ok(Capped::Absent),
        }
    }

    pub fn read_optional_list<T: DeserializeOwned>(
        &self,
        id: Option<CappedId>,
    ) -> Result<Capped<Vec<T>>> {
        match id {
            Some(id) => self.read_messages(id),
            None => Ok(Capped::Absent),
        }
    }

    pub fn write_bytes(&self, payload: &[u8]) -> Result<CappedId> {
        let _guard = self.write_lock.lock()?;
        // resize also holds write_lock, so the layout cannot change under us
        let layout = *self.layout.read()?;
        let id = self.committed_index.load(Ordering::SeqCst);
        let record_len = LENGTH_PREFIX + payload.len() as u64;
        let next = id + record_len;

        if record_len > layout.size {
            // cannot fit: consume the id range so the record reads as expired
            tracing::warn!(
                path = %self.path.display(),
                payload_bytes = payload.len(),
                size_bytes = layout.size,
                "Payload larger than capped store, storing as expired"
            );
            self.reserved_index.store(next, Ordering::SeqCst);
            self.committed_index.store(next, Ordering::SeqCst);
            self.write_header(next, layout)?;
            return Ok(CappedId(id as i64));
        }

        self.reserved_index.store(next, Ordering::SeqCst);
        let mut record = Vec::with_capacity(record_len as usize);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        self.write_ring(layout, id, &record)?;
        self.committed_index.store(next, Ordering::SeqCst);
        self.write_header(next, layout)?;

        metrics::CAPPED_BYTES_WRITTEN.inc_by(record_len as f64);
        Ok(CappedId(id as i64))
    }

    pub fn read_bytes(&self, id: CappedId) -> Result<Capped<Vec<u8>>> {
        // held for the whole read so a resize cannot move data underneath
        let layout = self.layout.read()?;
        if id.0 < 0 {
            return Ok(expired());
        }
        let id = id.0 as u64;
        let committed = self.committed_index.load(Ordering::SeqCst);
        if id < layout.smallest_non_expired(self.reserved_index.load(Ordering::SeqCst))
            || id + LENGTH_PREFIX > committed
        {
            return Ok(expired());
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX as usize];
        self.read_ring(*layout, id, &mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if id + LENGTH_PREFIX + len > committed || LENGTH_PREFIX + len > layout.size {
            return Ok(expired());
        }
        let mut payload = vec![0u8; len as usize];
        self.read_ring(*layout, id + LENGTH_PREFIX, &mut payload)?;

        // a writer may have wrapped over the record while it was being read
        if id < layout.smallest_non_expired(self.reserved_index.load(Ordering::SeqCst)) {
            return Ok(expired());
        }
        Ok(Capped::Valid(payload))
    }

    /// Change the ring size. Shrinking drops the oldest records immediately;
    /// growing keeps everything.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        if new_size == 0 {
            return Err(crate::error::StorageError::Config(
                "capped store size must be greater than 0".to_string(),
            ));
        }
        let _guard = self.write_lock.lock()?;
        let mut layout = self.layout.write()?;
        let current = self.committed_index.load(Ordering::SeqCst);
        let smallest = layout.smallest_non_expired(current);
        let keep_from = smallest.max(current.saturating_sub(new_size));

        let mut retained = vec![0u8; (current - keep_from) as usize];
        self.read_ring(*layout, keep_from, &mut retained)?;

        let resized = Layout {
            base_index: keep_from,
            size: new_size,
        };
        self.file.set_len(HEADER_LEN + new_size)?;
        self.write_ring(resized, keep_from, &retained)?;
        self.write_header(current, resized)?;
        tracing::info!(
            path = %self.path.display(),
            old_size = layout.size,
            new_size,
            retained_bytes = retained.len(),
            "Resized capped store"
        );
        *layout = resized;
        Ok(())
    }

    fn write_ring(&self, layout: Layout, id: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let pos = layout.position(id);
        let first = ((layout.size - pos) as usize).min(bytes.len());
        self.file.write_all_at(&bytes[..first], HEADER_LEN + pos)?;
        if first < bytes.len() {
            self.file.write_all_at(&bytes[first..], HEADER_LEN)?;
        }
        Ok(())
    }

    fn read_ring(&self, layout: Layout, id: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let pos = layout.position(id);
        let first = ((layout.size - pos) as usize).min(buf.len());
        self.file.read_exact_at(&mut buf[..first], HEADER_LEN + pos)?;
        if first < buf.len() {
            self.file.read_exact_at(&mut buf[first..], HEADER_LEN)?;
        }
        Ok(())
    }

    fn write_header(&self, committed: u64, layout: Layout) -> Result<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[0..8].copy_from_slice(&committed.to_le_bytes());
        header[8..16].copy_from_slice(&layout.base_index.to_le_bytes());
        header[16..24].copy_from_slice(&layout.size.to_le_bytes());
        self.file.write_all_at(&header, 0)?;
        Ok(())
    }
}

fn expired<T>() -> Capped<T> {
    metrics::CAPPED_EXPIRED_READS.inc();
    Capped::Expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, size: u64) -> CappedStore {
        CappedStore::open(&dir.path().join("test.capped"), size).unwrap()
    }

    #[test]
    fn test_write_and_read_message() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        let id = store.write_message(&"hello".to_string()).unwrap();
        let read: Capped<String> = store.read_message(id).unwrap();
        assert_eq!(read, Capped::Valid("hello".to_string()));
    }

    #[test]
    fn test_write_and_read_messages() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        let id = store.write_messages(&[1u64, 2, 3]).unwrap();
        let read: Capped<Vec<u64>> = store.read_messages(id).unwrap();
        assert_eq!(read, Capped::Valid(vec![1, 2, 3]));
    }

    #[test]
    fn test_ids_increase_monotonically() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        let a = store.write_message(&1u64).unwrap();
        let b = store.write_message(&2u64).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_wraparound_expires_oldest() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 256);
        let first = store.write_message(&vec![7u8; 40]).unwrap();
        let mut last = first;
        for i in 0..20u8 {
            last = store.write_message(&vec![i; 40]).unwrap();
        }
        assert!(first.0 < store.smallest_non_expired_id().unwrap());
        assert_eq!(store.read_message::<Vec<u8>>(first).unwrap(), Capped::Expired);
        assert_eq!(
            store.read_message::<Vec<u8>>(last).unwrap(),
            Capped::Valid(vec![19u8; 40])
        );
    }

    #[test]
    fn test_record_spanning_ring_end() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 100);
        store.write_message(&vec![1u8; 60]).unwrap();
        // this record starts near the end of the ring and wraps
        let id = store.write_message(&vec![2u8; 30]).unwrap();
        assert_eq!(
            store.read_message::<Vec<u8>>(id).unwrap(),
            Capped::Valid(vec![2u8; 30])
        );
    }

    #[test]
    fn test_unwritten_and_negative_ids_are_expired() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        assert_eq!(store.read_bytes(CappedId(500)).unwrap(), Capped::Expired);
        assert_eq!(store.read_bytes(CappedId(-1)).unwrap(), Capped::Expired);
        assert_eq!(store.read_optional::<u64>(None).unwrap(), Capped::Absent);
    }

    #[test]
    fn test_oversized_payload_reads_as_expired() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 64);
        let id = store.write_message(&vec![0u8; 200]).unwrap();
        assert_eq!(store.read_message::<Vec<u8>>(id).unwrap(), Capped::Expired);
        let next = store.write_message(&1u64).unwrap();
        assert_eq!(store.read_message::<u64>(next).unwrap(), Capped::Valid(1));
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open(&dir, 1024);
            store.write_message(&"persisted".to_string()).unwrap()
        };
        let store = open(&dir, 1024);
        assert_eq!(
            store.read_message::<String>(id).unwrap(),
            Capped::Valid("persisted".to_string())
        );
        let next = store.write_message(&1u64).unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_grow_preserves_data() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 128);
        let ids: Vec<CappedId> = (0..5u64).map(|i| store.write_message(&i).unwrap()).collect();
        store.resize(4096).unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store.read_message::<u64>(*id).unwrap(), Capped::Valid(i as u64));
        }
        let id = store.write_message(&99u64).unwrap();
        assert_eq!(store.read_message::<u64>(id).unwrap(), Capped::Valid(99));
    }

    #[test]
    fn test_shrink_discards_oldest() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 4096);
        let ids: Vec<CappedId> = (0..10u64)
            .map(|i| store.write_message(&vec![i as u8; 50]).unwrap())
            .collect();
        store.resize(128).unwrap();
        assert_eq!(store.read_message::<Vec<u8>>(ids[0]).unwrap(), Capped::Expired);
        assert_eq!(
            store.read_message::<Vec<u8>>(ids[9]).unwrap(),
            Capped::Valid(vec![9u8; 50])
        );
        assert!(store.smallest_non_expired_id().unwrap() > ids[0].0);
    }

    #[test]
    fn test_reopen_with_new_size_resizes() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open(&dir, 256);
            store.write_message(&5u64).unwrap()
        };
        let store = open(&dir, 2048);
        assert_eq!(store.size().unwrap(), 2048);
        assert_eq!(store.read_message::<u64>(id).unwrap(), Capped::Valid(5));
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        let id = store.write_bytes(&[1, 0xFF, 0xFF]).unwrap();
        assert!(store.read_message::<String>(id).is_err());
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&dir, 2048));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let value = vec![t * 1000 + i; 4];
                    let id = store.write_message(&value).unwrap();
                    match store.read_message::<Vec<u64>>(id).unwrap() {
                        Capped::Valid(read) => assert_eq!(read, value),
                        Capped::Expired => {}
                        Capped::Absent => panic!("absent for a written id"),
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
