//! Simulated flash.
//!
//! NOR-type flashes used in microcontrollers differ quite a bit in terms of
//! the capabilities provided. This simulator captures the part of that
//! diversity the swap engine actually cares about: write size, erase size,
//! and capacity, all expressed through `storage::Flash`.
//!
//! Beyond simply emulating reads, writes, and erases, `SimFlash` can tear
//! a write or erase partway through and fail it -- the mechanism tests use
//! to drive the recovery path. A torn write leaves its page's bytes
//! partially updated and its page state reporting `Written`, matching what
//! a real NOR device does when power is lost mid-program: the operation
//! doesn't roll back, it just stops.

mod gen;
pub mod styles;

pub use gen::{GenBuilder, GeneratedImage};

use storage::{check_erase, check_read, check_slice, check_write, Flash, PageState, ReadFlash};

/// A single in-memory flash region with injectable write/erase faults.
#[derive(Clone)]
pub struct SimFlash {
    write_size: usize,
    erase_size: usize,
    data: Vec<u8>,
    /// Tracks, per erase-size chunk, whether it currently reads back as
    /// erased. This is the same granularity a real status query would use.
    erased: Vec<bool>,
    /// If set, the `limit`-th destructive operation (write or erase;
    /// reads don't count) tears instead of completing, and every one
    /// after it returns the same error without touching flash at all --
    /// once power is gone, nothing else runs either.
    limit: Option<usize>,
    /// Total destructive operations performed so far.
    count: usize,
}

impl SimFlash {
    pub fn new(write_size: usize, erase_size: usize, sectors: usize) -> SimFlash {
        assert!(erase_size % write_size == 0, "erase size must be a write-size multiple");
        let capacity = erase_size * sectors;
        SimFlash {
            write_size,
            erase_size,
            data: vec![0xffu8; capacity],
            erased: vec![true; sectors],
            limit: None,
            count: 0,
        }
    }

    /// Copy `data` into flash starting at `offset`, page by page, as a
    /// fresh (non-simulated) installation -- used by test setup, not by
    /// the engine under test.
    pub fn install(&mut self, data: &[u8], offset: usize) -> storage::Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            let chunk = (data.len() - pos).min(self.erase_size);
            let aligned = align_up(chunk, self.write_size);
            let mut buf = vec![0u8; aligned];
            buf[..chunk].copy_from_slice(&data[pos..pos + chunk]);
            self.write(offset + pos, &buf)?;
            pos += chunk;
        }
        Ok(())
    }

    /// Total destructive operations (writes and erases) performed so far.
    /// Call after a full, uninterrupted run to learn how many interruption
    /// points a test should try.
    pub fn steps(&self) -> usize {
        self.count
    }

    /// Arm fault injection: the `limit`-th destructive operation tears
    /// instead of completing.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    pub fn clear_limit(&mut self) {
        self.limit = None;
    }

    /// Zero the destructive-operation counter, so a subsequent `set_limit`
    /// counts only operations from this point on -- typically called right
    /// after test setup writes (like `install`) so those don't count
    /// against the limit under test.
    pub fn reset_steps(&mut self) {
        self.count = 0;
    }

    fn chunk_of(&self, offset: usize) -> usize {
        offset / self.erase_size
    }

    /// Returns `Ok(true)` if the operation should proceed to completion,
    /// `Ok(false)` if it should tear, having already counted itself.
    fn tick(&mut self) -> bool {
        self.count += 1;
        match self.limit {
            Some(limit) if self.count >= limit => false,
            _ => true,
        }
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        1
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        check_erase(self, from, to)?;
        if !self.tick() {
            let mid = from + (to - from) / 2 / self.erase_size * self.erase_size;
            for chunk_start in (from..mid).step_by(self.erase_size) {
                self.data[chunk_start..chunk_start + self.erase_size].fill(0xff);
                self.erased[self.chunk_of(chunk_start)] = true;
            }
            return Err(storage::Error::NotErased);
        }
        for chunk_start in (from..to).step_by(self.erase_size) {
            self.data[chunk_start..chunk_start + self.erase_size].fill(0xff);
            self.erased[self.chunk_of(chunk_start)] = true;
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        check_write(self, offset, bytes.len())?;
        if !self.tick() {
            let torn = bytes.len() / 2 / self.write_size * self.write_size;
            self.data[offset..offset + torn].copy_from_slice(&bytes[..torn]);
            self.erased[self.chunk_of(offset)] = false;
            return Err(storage::Error::NotWritten);
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.erased[self.chunk_of(offset)] = false;
        Ok(())
    }

    fn state(&self, offset: usize) -> storage::Result<PageState> {
        check_slice(self, self.erase_size, offset, self.erase_size)?;
        Ok(if self.erased[self.chunk_of(offset)] {
            PageState::Erased
        } else {
            PageState::Written
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_page() {
        let mut flash = SimFlash::new(512, 512, 4);
        let data = vec![0xabu8; 512];
        flash.write(512, &data).unwrap();
        let mut out = vec![0u8; 512];
        flash.read(512, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(flash.state(512).unwrap(), PageState::Written);
        assert_eq!(flash.state(0).unwrap(), PageState::Erased);
    }

    #[test]
    fn erase_resets_to_erased_state() {
        let mut flash = SimFlash::new(512, 512, 2);
        flash.write(0, &[0x11u8; 512]).unwrap();
        flash.erase(0, 512).unwrap();
        assert_eq!(flash.state(0).unwrap(), PageState::Erased);
    }

    #[test]
    fn torn_write_still_reports_written() {
        let mut flash = SimFlash::new(512, 512, 2);
        flash.set_limit(1);
        let err = flash.write(0, &[0x22u8; 512]).unwrap_err();
        assert_eq!(err, storage::Error::NotWritten);
        assert_eq!(flash.state(0).unwrap(), PageState::Written);
    }

    #[test]
    fn operation_past_the_limit_also_fails() {
        let mut flash = SimFlash::new(512, 512, 2);
        flash.set_limit(1);
        assert!(flash.write(0, &[0x33u8; 512]).is_err());
        assert!(flash.write(512, &[0x33u8; 512]).is_err());
    }
}
