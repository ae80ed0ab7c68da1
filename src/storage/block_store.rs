//! # Fixed-Size Block Store
//!
//! Random-access storage of fixed-size blocks in a single file. This is the
//! unit of I/O for the whole tree: one node serializes into exactly one
//! block, and block 0 carries the metadata record.
//!
//! ## I/O Paths
//!
//! Two interchangeable paths serve reads and writes:
//!
//! - **Positional I/O** (default): `seek(index * block_size)` followed by a
//!   read or write of exactly one block.
//! - **Segmented mmap** (opt-in, 64-bit hosts): the file is partitioned
//!   into fixed segments of N blocks. A segment is mapped lazily on first
//!   touch and the requested block is sliced out of it. Mapping a segment
//!   extends the file to segment granularity, mirroring what
//!   `FileChannel.map` style APIs do; the extra blocks read as zeroed and
//!   are reclaimed by the free-bitmap scan.
//!
//! `sync` forces every mapped segment in ascending index order before
//! forcing the file itself, and `close` drops all mappings after a final
//! force, so durability never rides on OS write-back alone.
//!
//! ## Buffering
//!
//! Reads hand out buffers from the process-wide [`BufferPool`]; dropping
//! the buffer recycles it. Writes accept any full-block slice.
//!
//! ## Failure Model
//!
//! Operating on a closed store reports [`StoreError::InvalidState`];
//! underlying file errors surface as `eyre` reports with path context.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

use super::{BufferPool, PooledBuffer, SyncCallback};
use crate::config::MMAP_SEGMENT_BYTES;
use crate::error::StoreError;

/// File of fixed-size blocks addressed by index.
pub struct BlockStore {
    path: PathBuf,
    block_size: usize,
    file: Option<File>,
    use_mmap: bool,
    segment_blocks: usize,
    segments: BTreeMap<u32, MmapMut>,
    pool: BufferPool,
    callback: Option<SyncCallback>,
}

impl BlockStore {
    pub fn new<P: AsRef<Path>>(path: P, block_size: usize) -> BlockStore {
        let segment_blocks = (MMAP_SEGMENT_BYTES / block_size).max(1);
        BlockStore {
            path: path.as_ref().to_path_buf(),
            block_size,
            file: None,
            use_mmap: false,
            segment_blocks,
            segments: BTreeMap::new(),
            pool: BufferPool::shared(block_size),
            callback: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch block access to the segmented mmap path. Must be called
    /// before `open`.
    pub fn enable_mmap(&mut self) -> Result<()> {
        ensure!(!self.is_open(), StoreError::InvalidState);
        self.use_mmap = true;
        Ok(())
    }

    /// Enable mmap only where the address space can afford it.
    pub fn enable_mmap_if_supported(&mut self) -> Result<()> {
        if cfg!(target_pointer_width = "64") {
            self.enable_mmap()?;
        }
        Ok(())
    }

    pub fn set_callback(&mut self, callback: Option<SyncCallback>) {
        self.callback = callback;
    }

    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            self.close()?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open block file '{}'", self.path.display()))?;
        self.file = Some(file);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn close(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.force_segments()?;
        }
        self.segments.clear();
        self.file = None;
        Ok(())
    }

    /// Size of the file in whole blocks, rounding a ragged tail up.
    pub fn size_in_blocks(&self) -> Result<u32> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let blocks = len / self.block_size as u64
            + if len % self.block_size as u64 == 0 { 0 } else { 1 };
        Ok(blocks as u32)
    }

    /// Truncate the file to zero blocks.
    pub fn clear(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(StoreError::InvalidState)?;
        self.segments.clear();
        file.set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        file.sync_data()
            .wrap_err("failed to sync block file after truncate")?;
        Ok(())
    }

    /// Close and remove the file.
    pub fn delete(&mut self) -> Result<()> {
        self.segments.clear();
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .wrap_err_with(|| format!("failed to delete '{}'", self.path.display())),
        }
    }

    /// Read one block into a pooled buffer.
    pub fn read_block(&mut self, index: u32) -> Result<PooledBuffer> {
        ensure!(self.is_open(), StoreError::InvalidState);
        let mut buf = self.pool.acquire();
        if self.use_mmap {
            let (seg, offset) = self.locate(index);
            let block_size = self.block_size;
            let slice = self.segment(seg)?;
            buf.copy_from_slice(&slice[offset..offset + block_size]);
            return Ok(buf);
        }
        let file = self.file.as_mut().unwrap();
        file.seek(SeekFrom::Start(index as u64 * self.block_size as u64))
            .wrap_err_with(|| format!("failed to seek to block {}", index))?;
        file.read_exact(&mut buf)
            .wrap_err_with(|| format!("failed to read block {}", index))?;
        Ok(buf)
    }

    /// Write one full block.
    pub fn write_block(&mut self, index: u32, buf: &[u8]) -> Result<()> {
        ensure!(self.is_open(), StoreError::InvalidState);
        ensure!(
            buf.len() == self.block_size,
            "block write of {} bytes does not match block size {}",
            buf.len(),
            self.block_size
        );
        if self.use_mmap {
            let (seg, offset) = self.locate(index);
            let block_size = self.block_size;
            let slice = self.segment(seg)?;
            slice[offset..offset + block_size].copy_from_slice(buf);
            return Ok(());
        }
        let file = self.file.as_mut().unwrap();
        file.seek(SeekFrom::Start(index as u64 * self.block_size as u64))
            .wrap_err_with(|| format!("failed to seek to block {}", index))?;
        file.write_all(buf)
            .wrap_err_with(|| format!("failed to write block {}", index))?;
        Ok(())
    }

    /// Force all pending writes to the device, then notify the callback.
    pub fn sync(&mut self) -> Result<()> {
        ensure!(self.is_open(), StoreError::InvalidState);
        self.force_segments()?;
        self.file
            .as_ref()
            .unwrap()
            .sync_data()
            .wrap_err("failed to sync block file")?;
        if let Some(callback) = &self.callback {
            let len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
            callback(len);
        }
        Ok(())
    }

    fn locate(&self, index: u32) -> (u32, usize) {
        let seg = index / self.segment_blocks as u32;
        let offset = (index as usize % self.segment_blocks) * self.block_size;
        (seg, offset)
    }

    fn segment(&mut self, seg: u32) -> Result<&mut MmapMut> {
        if !self.segments.contains_key(&seg) {
            let seg_bytes = (self.segment_blocks * self.block_size) as u64;
            let seg_start = seg as u64 * seg_bytes;
            let file = self.file.as_mut().unwrap();
            let len = file.metadata().wrap_err("failed to stat block file")?.len();
            if len < seg_start + seg_bytes {
                file.set_len(seg_start + seg_bytes)
                    .wrap_err("failed to extend block file for mmap segment")?;
            }
            // SAFETY: the file is owned exclusively by this store for its
            // lifetime and the mapping covers a range the file was just
            // extended to hold. All access is bounds-checked slicing.
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(seg_start)
                    .len(seg_bytes as usize)
                    .map_mut(&*file)
                    .wrap_err_with(|| format!("failed to map segment {}", seg))?
            };
            self.segments.insert(seg, mmap);
        }
        Ok(self.segments.get_mut(&seg).unwrap())
    }

    fn force_segments(&mut self) -> Result<()> {
        if self.segments.is_empty() {
            return Ok(());
        }
        let mut forced = 0;
        for (seg, mmap) in self.segments.iter() {
            mmap.flush()
                .wrap_err_with(|| format!("failed to force mapped segment {}", seg))?;
            forced += 1;
        }
        debug!(forced, "forced mapped segments");
        Ok(())
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("open", &self.is_open())
            .field("mmap", &self.use_mmap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn store(dir: &tempfile::TempDir, block_size: usize) -> BlockStore {
        BlockStore::new(dir.path().join("test.data"), block_size)
    }

    #[test]
    fn open_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256);
        store.open().unwrap();

        let mut block = vec![0u8; 256];
        block[0] = 0xDE;
        block[255] = 0xAD;
        store.write_block(3, &block).unwrap();

        let read = store.read_block(3).unwrap();
        assert_eq!(&read[..], &block[..]);
        assert_eq!(store.size_in_blocks().unwrap(), 4);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256);

        let err = store.read_block(0).unwrap_err();
        assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidState));
    }

    #[test]
    fn wrong_sized_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256);
        store.open().unwrap();

        assert!(store.write_block(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn clear_truncates_to_zero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256);
        store.open().unwrap();
        store.write_block(5, &vec![1u8; 256]).unwrap();
        assert!(store.size_in_blocks().unwrap() > 0);

        store.clear().unwrap();
        assert_eq!(store.size_in_blocks().unwrap(), 0);
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.data");
        let mut store = BlockStore::new(&path, 256);
        store.open().unwrap();
        store.write_block(0, &vec![7u8; 256]).unwrap();
        store.delete().unwrap();

        assert!(!path.exists());
        assert!(!store.is_open());
    }

    #[test]
    fn mmap_path_round_trips_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 512);
        store.enable_mmap().unwrap();
        store.open().unwrap();

        for index in [0u32, 1, 7, 300] {
            let block = vec![(index % 251) as u8; 512];
            store.write_block(index, &block).unwrap();
        }
        store.sync().unwrap();

        for index in [0u32, 1, 7, 300] {
            let read = store.read_block(index).unwrap();
            assert!(read.iter().all(|&b| b == (index % 251) as u8));
        }
    }

    #[test]
    fn mmap_writes_survive_reopen_through_positional_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.data");

        let mut writer = BlockStore::new(&path, 512);
        writer.enable_mmap().unwrap();
        writer.open().unwrap();
        writer.write_block(2, &vec![0x5A; 512]).unwrap();
        writer.close().unwrap();

        let mut reader = BlockStore::new(&path, 512);
        reader.open().unwrap();
        let block = reader.read_block(2).unwrap();
        assert!(block.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn sync_callback_fires_with_file_size() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256);
        store.open().unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        store.set_callback(Some(Arc::new(move |len| {
            seen2.store(len, Ordering::SeqCst);
        })));

        store.write_block(1, &vec![9u8; 256]).unwrap();
        store.sync().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 512);
    }
}
