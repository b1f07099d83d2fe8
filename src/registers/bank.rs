use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use super::Table;
use crate::error::RegisterError;

/// Reentrant lock shared by every bank of one device.
///
/// Each bank call takes it for the duration of the call. A controller can
/// hold it across several calls to publish a batch of writes atomically.
pub type SharedLock = Arc<ReentrantMutex<()>>;

pub fn shared_lock() -> SharedLock {
    Arc::new(ReentrantMutex::new(()))
}

/// Access mode seen by protocol clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

/// Fixed-size, zero-based array of 16-bit words.
///
/// A bank built with [`RegisterBank::unsupported`] represents a table the
/// device does not have: every read and write fails, which is different
/// from a bank that exists but holds zeros.
#[derive(Debug)]
pub struct RegisterBank {
    table: Table,
    access: Access,
    lock: SharedLock,
    words: Option<Mutex<Vec<u16>>>,
}

impl RegisterBank {
    /// Create a bank of `size` words, zero-filled except for `init`.
    pub fn new(
        table: Table,
        access: Access,
        lock: SharedLock,
        size: usize,
        init: &[(u16, u16)],
    ) -> Result<Self, RegisterError> {
        let mut words = vec![0u16; size];
        for &(address, value) in init {
            let slot = words
                .get_mut(address as usize)
                .ok_or(RegisterError::OutOfRange {
                    table,
                    address,
                    end: address as usize + 1,
                    size,
                })?;
            *slot = value;
        }
        Ok(Self {
            table,
            access,
            lock,
            words: Some(Mutex::new(words)),
        })
    }

    pub fn unsupported(table: Table, lock: SharedLock) -> Self {
        Self {
            table,
            access: Access::ReadOnly,
            lock,
            words: None,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_supported(&self) -> bool {
        self.words.is_some()
    }

    /// Number of words, `None` for an unsupported table.
    pub fn size(&self) -> Option<usize> {
        self.words.as_ref().map(|w| w.lock().len())
    }

    /// Take the device lock. Re-entering from the same thread is allowed.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, RegisterError> {
        let _guard = self.lock.lock();
        let words = self.supported()?.lock();
        let range = self.checked_range(address, count, words.len())?;
        Ok(words[range].to_vec())
    }

    /// Protocol-side write of a single word. Rejected on read-only banks.
    pub fn write(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        let _guard = self.lock.lock();
        let words = self.supported()?;
        if self.access == Access::ReadOnly {
            return Err(RegisterError::ReadOnly(self.table));
        }
        Self::put(self.table, &mut words.lock(), address, value)
    }

    /// Device-side write used by the owning controller. Ignores the access
    /// mode so a device can publish its own input registers.
    pub fn store(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        let _guard = self.lock.lock();
        Self::put(self.table, &mut self.supported()?.lock(), address, value)
    }

    pub fn read_one(&self, address: u16) -> Result<u16, RegisterError> {
        Ok(self.read(address, 1)?[0])
    }

    fn supported(&self) -> Result<&Mutex<Vec<u16>>, RegisterError> {
        self.words
            .as_ref()
            .ok_or(RegisterError::Unsupported(self.table))
    }

    fn checked_range(
        &self,
        address: u16,
        count: u16,
        size: usize,
    ) -> Result<std::ops::Range<usize>, RegisterError> {
        if count == 0 {
            return Err(RegisterError::InvalidCount(count));
        }
        let start = address as usize;
        let end = start + count as usize;
        if end > size {
            return Err(RegisterError::OutOfRange {
                table: self.table,
                address,
                end,
                size,
            });
        }
        Ok(start..end)
    }

    fn put(table: Table, words: &mut [u16], address: u16, value: u16) -> Result<(), RegisterError> {
        let size = words.len();
        let slot = words
            .get_mut(address as usize)
            .ok_or(RegisterError::OutOfRange {
                table,
                address,
                end: address as usize + 1,
                size,
            })?;
        *slot = value;
        Ok(())
    }
}
