//! # Append-Only Stream Store
//!
//! The redo log's file format: an append-only stream of framed records
//! with buffer-aligned writes.
//!
//! ## Record Framing
//!
//! ```text
//! +-------------+-----------+------------------+------------+
//! | magic16     | len32     | payload[len]     | footer8    |
//! | 0x754C (BE) |   (BE)    |                  | 0x24       |
//! +-------------+-----------+------------------+------------+
//! ```
//!
//! ## Alignment
//!
//! Writes are staged in a buffer of `1 << bits` bytes where
//! `bits = ceil(log2(max(buffer_size, 512)))`. With `align_blocks` set, a
//! record that would straddle a buffer boundary is preceded by a padding
//! run: one `0x42` magic byte followed by zeros up to the boundary. A
//! reader that finds the padding magic where a header should start skips
//! to the next boundary and retries.
//!
//! ## Oversized Records
//!
//! A record whose framing exceeds the staging buffer bypasses it entirely:
//! the header, payload and footer are written straight to the file in one
//! scatter sequence, and the file position becomes the new committed
//! offset.
//!
//! ## Durability Knobs
//!
//! - `flush_on_write`: drain the staging buffer to the file after every
//!   record (no fsync implied).
//! - `sync_on_flush`: follow every buffer drain with an fsync and fire the
//!   sync callback with the committed offset.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::warn;

use super::SyncCallback;
use crate::config::{
    MIN_STREAM_BUFFER, STREAM_FOOTER_LEN, STREAM_FOOTER_MAGIC, STREAM_HEADER_LEN, STREAM_MAGIC,
    STREAM_PADDING_MAGIC,
};
use crate::error::StoreError;

/// Append-only stream of framed records.
pub struct StreamStore {
    path: PathBuf,
    bits: u32,
    file: Option<File>,
    buf_out: Vec<u8>,
    offset_committed: u64,
    offset_uncommitted: u64,
    flush_on_write: bool,
    sync_on_flush: bool,
    align_blocks: bool,
    callback: Option<SyncCallback>,
}

impl StreamStore {
    /// `buffer_size` is rounded up to the next power of two, with a floor
    /// of one sector.
    pub fn new<P: AsRef<Path>>(path: P, buffer_size: usize) -> StreamStore {
        let cap = buffer_size.max(MIN_STREAM_BUFFER).next_power_of_two();
        StreamStore {
            path: path.as_ref().to_path_buf(),
            bits: cap.trailing_zeros(),
            file: None,
            buf_out: Vec::with_capacity(cap),
            offset_committed: 0,
            offset_uncommitted: 0,
            flush_on_write: false,
            sync_on_flush: true,
            align_blocks: true,
            callback: None,
        }
    }

    pub fn set_flush_on_write(&mut self, flush_on_write: bool) {
        self.flush_on_write = flush_on_write;
    }

    pub fn set_sync_on_flush(&mut self, sync_on_flush: bool) {
        self.sync_on_flush = sync_on_flush;
    }

    pub fn set_align_blocks(&mut self, align_blocks: bool) {
        self.align_blocks = align_blocks;
    }

    pub fn set_callback(&mut self, callback: Option<SyncCallback>) {
        self.callback = callback;
    }

    /// Alignment window size in bytes.
    pub fn buffer_len(&self) -> usize {
        1usize << self.bits
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
            .wrap_err_with(|| format!("failed to open stream file '{}'", self.path.display()))?;
        let len = file.metadata().wrap_err("failed to stat stream file")?.len();
        self.file = Some(file);
        self.offset_committed = len;
        self.offset_uncommitted = len;
        self.buf_out.clear();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn close(&mut self) -> Result<()> {
        if self.is_open() {
            self.sync()?;
        }
        self.file = None;
        Ok(())
    }

    /// Total stream size including still-buffered bytes.
    pub fn size(&self) -> u64 {
        self.offset_uncommitted
    }

    /// Truncate the stream to empty.
    pub fn clear(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(StoreError::InvalidState)?;
        self.buf_out.clear();
        file.set_len(0).wrap_err("failed to truncate stream file")?;
        file.sync_data()
            .wrap_err("failed to sync stream file after truncate")?;
        self.offset_committed = 0;
        self.offset_uncommitted = 0;
        Ok(())
    }

    /// Close and remove the file.
    pub fn delete(&mut self) -> Result<()> {
        self.buf_out.clear();
        self.file = None;
        self.offset_committed = 0;
        self.offset_uncommitted = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .wrap_err_with(|| format!("failed to delete '{}'", self.path.display())),
        }
    }

    /// Append one record; returns the offset its header starts at.
    pub fn write(&mut self, payload: &[u8]) -> Result<u64> {
        ensure!(self.is_open(), StoreError::InvalidState);
        let packet = STREAM_HEADER_LEN + payload.len() + STREAM_FOOTER_LEN;
        let cap = self.buffer_len();
        let direct = packet > cap;

        if self.align_blocks && !direct {
            let boundary = self.next_block_boundary(self.offset_uncommitted);
            if packet as u64 > boundary {
                self.align_buffer(boundary as usize)?;
                self.offset_uncommitted += boundary;
            }
        }

        let start = self.offset_uncommitted;

        if self.buf_out.len() + packet > cap {
            self.flush_buffer()?;
        }

        if direct {
            // Scatter write past the buffer: header, payload, footer.
            let mut header = [0u8; STREAM_HEADER_LEN];
            header[..2].copy_from_slice(&STREAM_MAGIC.to_be_bytes());
            header[2..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
            let file = self.file.as_mut().unwrap();
            file.seek(SeekFrom::Start(self.offset_committed))
                .wrap_err("failed to seek for direct stream write")?;
            file.write_all(&header)
                .wrap_err("failed to write stream header")?;
            file.write_all(payload)
                .wrap_err("failed to write stream payload")?;
            file.write_all(&[STREAM_FOOTER_MAGIC])
                .wrap_err("failed to write stream footer")?;
            self.offset_committed += packet as u64;
            self.offset_uncommitted = self.offset_committed;
            if self.sync_on_flush {
                file.sync_data().wrap_err("failed to sync stream file")?;
                if let Some(callback) = &self.callback {
                    callback(self.offset_committed);
                }
            }
            return Ok(start);
        }

        self.buf_out.extend_from_slice(&STREAM_MAGIC.to_be_bytes());
        self.buf_out
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buf_out.extend_from_slice(payload);
        self.buf_out.push(STREAM_FOOTER_MAGIC);
        self.offset_uncommitted += packet as u64;

        if self.flush_on_write {
            self.flush_buffer()?;
        }
        Ok(start)
    }

    /// Read the record at `offset` into `buf`. Returns the offset just past
    /// its footer, or `None` on end-of-stream or corruption.
    pub fn read(&mut self, mut offset: u64, buf: &mut Vec<u8>) -> Result<Option<u64>> {
        ensure!(self.is_open(), StoreError::InvalidState);
        loop {
            if offset >= self.offset_committed && !self.buf_out.is_empty() {
                warn!("stream read past committed offset forced an autoflush");
                self.flush_buffer()?;
            }
            if offset + STREAM_HEADER_LEN as u64 > self.offset_committed {
                return Ok(None);
            }

            let mut header = [0u8; STREAM_HEADER_LEN];
            self.read_at(offset, &mut header)?;

            if self.align_blocks && header[0] == STREAM_PADDING_MAGIC {
                offset += self.next_block_boundary(offset);
                continue;
            }
            let magic = u16::from_be_bytes(header[..2].try_into().unwrap());
            if magic != STREAM_MAGIC {
                warn!(found = magic, expected = STREAM_MAGIC, "bad stream magic");
                return Ok(None);
            }

            let len = u32::from_be_bytes(header[2..].try_into().unwrap()) as u64;
            let end = offset + (STREAM_HEADER_LEN as u64) + len + STREAM_FOOTER_LEN as u64;
            if end > self.offset_committed {
                return Ok(None);
            }

            buf.clear();
            buf.resize(len as usize, 0);
            self.read_at(offset + STREAM_HEADER_LEN as u64, buf)?;

            let mut footer = [0u8; STREAM_FOOTER_LEN];
            self.read_at(end - STREAM_FOOTER_LEN as u64, &mut footer)?;
            if footer[0] != STREAM_FOOTER_MAGIC {
                warn!(found = footer[0], "bad stream footer");
                return Ok(None);
            }
            return Ok(Some(end));
        }
    }

    /// Read the final record given its payload length.
    pub fn read_from_end(&mut self, len: usize, buf: &mut Vec<u8>) -> Result<Option<u64>> {
        self.flush_buffer()?;
        let framed = (STREAM_HEADER_LEN + len + STREAM_FOOTER_LEN) as u64;
        if self.offset_committed < framed {
            return Ok(None);
        }
        let offset = self.offset_committed - framed;
        self.read(offset, buf)
    }

    /// Whether the stream ends with a record footer.
    pub fn is_valid(&mut self) -> Result<bool> {
        ensure!(self.is_open(), StoreError::InvalidState);
        self.flush_buffer()?;
        if self.offset_committed == 0 {
            return Ok(true);
        }
        let mut last = [0u8; 1];
        self.read_at(self.offset_committed - 1, &mut last)?;
        Ok(last[0] == STREAM_FOOTER_MAGIC)
    }

    /// Drain the staging buffer and force the file if `sync_on_flush` is
    /// not already doing so per flush.
    pub fn sync(&mut self) -> Result<()> {
        ensure!(self.is_open(), StoreError::InvalidState);
        self.flush_buffer()?;
        if !self.sync_on_flush {
            let file = self.file.as_mut().unwrap();
            file.sync_data().wrap_err("failed to sync stream file")?;
            if let Some(callback) = &self.callback {
                callback(self.offset_committed);
            }
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file.as_mut().unwrap();
        file.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek stream to {}", offset))?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("failed to read {} stream bytes at {}", buf.len(), offset))?;
        Ok(())
    }

    /// Bytes left until the next alignment boundary; in `1..=buffer_len`.
    fn next_block_boundary(&self, offset: u64) -> u64 {
        (((offset >> self.bits) + 1) << self.bits) - offset
    }

    fn align_buffer(&mut self, diff: usize) -> Result<()> {
        if self.buf_out.len() + diff > self.buffer_len() {
            self.flush_buffer()?;
        }
        self.buf_out.push(STREAM_PADDING_MAGIC);
        self.buf_out.extend(std::iter::repeat(0u8).take(diff - 1));
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf_out.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(StoreError::InvalidState)?;
        file.seek(SeekFrom::Start(self.offset_committed))
            .wrap_err("failed to seek stream for flush")?;
        file.write_all(&self.buf_out)
            .wrap_err("failed to flush stream buffer")?;
        self.offset_committed += self.buf_out.len() as u64;
        self.offset_uncommitted = self.offset_committed;
        self.buf_out.clear();
        if self.sync_on_flush {
            file.sync_data().wrap_err("failed to sync stream file")?;
            if let Some(callback) = &self.callback {
                callback(self.offset_committed);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("path", &self.path)
            .field("buffer_len", &self.buffer_len())
            .field("size", &self.size())
            .finish()
    }
}
