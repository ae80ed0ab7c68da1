//! # Free-Block Bitmap
//!
//! Dense bitset over block indices: a set bit means the block is free for
//! reuse. Bits are packed into 64-bit words; the logical size tracks the
//! highest non-zero word so serialization never writes trailing zeros.
//!
//! ## Sidecar Layout
//!
//! The bitmap persists to the `.free` sidecar file only on clean shutdown:
//!
//! ```text
//! u32 words_in_use | u64 word[words_in_use]     (big-endian)
//! ```
//!
//! Absence of the sidecar on open (or an unclean flag) forces recovery to
//! rebuild block occupancy from the data file itself.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use crate::config::FREE_BITMAP_MAX_FILE;

const BITS_PER_WORD: usize = 64;

/// Bitset of reusable block indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeBitmap {
    words: Vec<u64>,
    words_in_use: usize,
}

impl FreeBitmap {
    pub fn new() -> FreeBitmap {
        FreeBitmap::default()
    }

    fn word_index(bit: u32) -> usize {
        bit as usize / BITS_PER_WORD
    }

    fn expand_to(&mut self, word: usize) {
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        if self.words_in_use <= word {
            self.words_in_use = word + 1;
        }
    }

    fn recalculate_words_in_use(&mut self) {
        self.words_in_use = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |i| i + 1);
    }

    pub fn set(&mut self, bit: u32) {
        let w = Self::word_index(bit);
        self.expand_to(w);
        self.words[w] |= 1u64 << (bit as usize % BITS_PER_WORD);
    }

    pub fn clear(&mut self, bit: u32) {
        let w = Self::word_index(bit);
        if w >= self.words_in_use {
            return;
        }
        self.words[w] &= !(1u64 << (bit as usize % BITS_PER_WORD));
        self.recalculate_words_in_use();
    }

    pub fn get(&self, bit: u32) -> bool {
        let w = Self::word_index(bit);
        w < self.words_in_use && (self.words[w] >> (bit as usize % BITS_PER_WORD)) & 1 != 0
    }

    /// Index of the first set bit at or after `from`, if any.
    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        let mut w = Self::word_index(from);
        if w >= self.words_in_use {
            return None;
        }
        let mut word = self.words[w] & (u64::MAX << (from as usize % BITS_PER_WORD));
        loop {
            if word != 0 {
                return Some((w * BITS_PER_WORD + word.trailing_zeros() as usize) as u32);
            }
            w += 1;
            if w >= self.words_in_use {
                return None;
            }
            word = self.words[w];
        }
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> u32 {
        self.words[..self.words_in_use]
            .iter()
            .map(|w| w.count_ones())
            .sum()
    }

    /// Highest set bit plus one; zero when empty.
    pub fn length(&self) -> u32 {
        if self.words_in_use == 0 {
            return 0;
        }
        let top = self.words[self.words_in_use - 1];
        (BITS_PER_WORD * (self.words_in_use - 1) + BITS_PER_WORD
            - top.leading_zeros() as usize) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.words_in_use == 0
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
        self.words_in_use = 0;
    }

    /// Serialized size in bytes after trimming.
    pub fn serialized_len(&self) -> usize {
        4 + self.words_in_use * 8
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.words_in_use as u32).to_be_bytes());
        for w in &self.words[..self.words_in_use] {
            buf.extend_from_slice(&w.to_be_bytes());
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<FreeBitmap> {
        ensure!(buf.len() >= 4, "bitmap buffer too small: {} < 4", buf.len());
        let words_in_use = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        ensure!(
            buf.len() >= 4 + words_in_use * 8,
            "bitmap buffer truncated: {} words declared, {} bytes present",
            words_in_use,
            buf.len()
        );
        let mut words = Vec::with_capacity(words_in_use);
        for i in 0..words_in_use {
            let at = 4 + i * 8;
            words.push(u64::from_be_bytes(buf[at..at + 8].try_into().unwrap()));
        }
        let mut bitmap = FreeBitmap {
            words,
            words_in_use,
        };
        bitmap.recalculate_words_in_use();
        Ok(bitmap)
    }

    /// Write the sidecar file, replacing any previous content.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.serialize(&mut buf);
        let mut file = File::create(path)
            .wrap_err_with(|| format!("failed to create free-bitmap file '{}'", path.display()))?;
        file.write_all(&buf)
            .wrap_err("failed to write free bitmap")?;
        file.sync_all().wrap_err("failed to sync free bitmap")?;
        Ok(())
    }

    /// Read a sidecar file back.
    pub fn read_from_file(path: &Path) -> Result<FreeBitmap> {
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open free-bitmap file '{}'", path.display()))?;
        let len = file.metadata().wrap_err("failed to stat free bitmap")?.len();
        ensure!(
            len < FREE_BITMAP_MAX_FILE,
            "free-bitmap file '{}' exceeds the {}MB limit",
            path.display(),
            FREE_BITMAP_MAX_FILE / 1024 / 1024
        );
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf)
            .wrap_err("failed to read free bitmap")?;
        FreeBitmap::deserialize(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut bm = FreeBitmap::new();
        assert!(!bm.get(7));

        bm.set(7);
        bm.set(64);
        bm.set(1198);

        assert!(bm.get(7));
        assert!(bm.get(64));
        assert!(bm.get(1198));
        assert!(!bm.get(8));

        bm.clear(64);
        assert!(!bm.get(64));
        assert_eq!(bm.cardinality(), 2);
    }

    #[test]
    fn next_set_bit_walks_words() {
        let mut bm = FreeBitmap::new();
        bm.set(3);
        bm.set(63);
        bm.set(64);
        bm.set(200);

        assert_eq!(bm.next_set_bit(0), Some(3));
        assert_eq!(bm.next_set_bit(4), Some(63));
        assert_eq!(bm.next_set_bit(64), Some(64));
        assert_eq!(bm.next_set_bit(65), Some(200));
        assert_eq!(bm.next_set_bit(201), None);
    }

    #[test]
    fn length_is_highest_bit_plus_one() {
        let mut bm = FreeBitmap::new();
        assert_eq!(bm.length(), 0);

        bm.set(0);
        assert_eq!(bm.length(), 1);

        bm.set(130);
        assert_eq!(bm.length(), 131);

        bm.clear(130);
        assert_eq!(bm.length(), 1);
    }

    #[test]
    fn clearing_high_bits_trims_words_in_use() {
        let mut bm = FreeBitmap::new();
        bm.set(5);
        bm.set(500);
        bm.clear(500);

        let mut buf = Vec::new();
        bm.serialize(&mut buf);
        assert_eq!(buf.len(), 4 + 8);
    }

    #[test]
    fn serialize_round_trip() {
        let mut bm = FreeBitmap::new();
        for bit in [1u32, 23, 64, 65, 666, 1198] {
            bm.set(bit);
        }

        let mut buf = Vec::new();
        bm.serialize(&mut buf);
        let back = FreeBitmap::deserialize(&buf).unwrap();

        assert_eq!(back, bm);
        assert_eq!(back.cardinality(), 6);
    }

    #[test]
    fn deserialize_rejects_truncated_buffer() {
        let mut bm = FreeBitmap::new();
        bm.set(100);
        let mut buf = Vec::new();
        bm.serialize(&mut buf);
        buf.truncate(buf.len() - 3);

        assert!(FreeBitmap::deserialize(&buf).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.free");

        let mut bm = FreeBitmap::new();
        bm.set(23);
        bm.set(1198);
        bm.write_to_file(&path).unwrap();

        let back = FreeBitmap::read_from_file(&path).unwrap();
        assert_eq!(back, bm);
    }
}
