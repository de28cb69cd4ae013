//! Memory accounting (§4.9 "Memory accounting").
//!
//! Strictly pre-reservation: a write must successfully `try_allocate`
//! against both its database's cap and the global cap before it is allowed
//! to proceed, and an update releases the old size only after the new size
//! has been published — so the tracked totals are never an undercount of
//! what's actually resident, only ever a momentary overcount during a
//! resize.

use docdb_core::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared global cap, referenced by every open database's [`MemoryAccount`].
pub struct GlobalMemory {
    used: AtomicU64,
    cap: u64,
}

impl GlobalMemory {
    pub fn new(cap: u64) -> Self {
        GlobalMemory {
            used: AtomicU64::new(0),
            cap,
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let proposed = current + bytes;
            if proposed > self.cap {
                return false;
            }
            if self
                .used
                .compare_exchange_weak(current, proposed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

/// One database's share of memory accounting: its own cap plus a reference
/// to the cap shared across every open database.
pub struct MemoryAccount {
    used: AtomicU64,
    cap: u64,
    global: std::sync::Arc<GlobalMemory>,
}

impl MemoryAccount {
    pub fn new(cap: u64, global: std::sync::Arc<GlobalMemory>) -> Self {
        MemoryAccount {
            used: AtomicU64::new(0),
            cap,
            global,
        }
    }

    /// Reserve `bytes` against both this database's cap and the global cap.
    /// Fails with [`Error::MemoryLimit`] if either would be exceeded,
    /// leaving both counters unchanged (the global reservation is rolled
    /// back if the per-DB check fails after it, and vice versa).
    pub fn try_allocate(&self, bytes: u64) -> Result<()> {
        if !self.global.try_reserve(bytes) {
            return Err(Error::MemoryLimit);
        }
        loop {
            let current = self.used.load(Ordering::Acquire);
            let proposed = current + bytes;
            if proposed > self.cap {
                self.global.release(bytes);
                return Err(Error::MemoryLimit);
            }
            if self
                .used
                .compare_exchange_weak(current, proposed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Release `bytes` previously reserved via `try_allocate`, on delete or
    /// on a failed write that never published.
    pub fn free(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
        self.global.release(bytes);
    }

    /// Replace a reservation of `old` bytes with one of `new` bytes (an
    /// update). Reserves the new size before releasing the old one, so an
    /// in-flight reader never sees the account dip below what's actually
    /// resident.
    pub fn try_resize(&self, old: u64, new: u64) -> Result<()> {
        if new > old {
            self.try_allocate(new - old)?;
        } else if old > new {
            self.free(old - new);
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocation_within_caps_succeeds() {
        let global = Arc::new(GlobalMemory::new(1000));
        let account = MemoryAccount::new(500, global);
        assert!(account.try_allocate(400).is_ok());
        assert_eq!(account.used(), 400);
    }

    #[test]
    fn per_db_cap_rejects_oversized_allocation() {
        let global = Arc::new(GlobalMemory::new(1000));
        let account = MemoryAccount::new(100, global);
        assert!(matches!(
            account.try_allocate(200).unwrap_err(),
            Error::MemoryLimit
        ));
        assert_eq!(account.used(), 0);
    }

    #[test]
    fn global_cap_rejects_even_when_per_db_cap_allows() {
        let global = Arc::new(GlobalMemory::new(100));
        let a = MemoryAccount::new(1000, Arc::clone(&global));
        let b = MemoryAccount::new(1000, Arc::clone(&global));
        assert!(a.try_allocate(80).is_ok());
        assert!(matches!(b.try_allocate(50).unwrap_err(), Error::MemoryLimit));
        // The failed reservation against `b` must not have leaked into the
        // global counter.
        assert_eq!(global.used(), 80);
    }

    #[test]
    fn free_returns_capacity_to_both_counters() {
        let global = Arc::new(GlobalMemory::new(1000));
        let account = MemoryAccount::new(500, Arc::clone(&global));
        account.try_allocate(300).unwrap();
        account.free(300);
        assert_eq!(account.used(), 0);
        assert_eq!(global.used(), 0);
    }

    #[test]
    fn resize_down_then_up_adjusts_both_directions() {
        let global = Arc::new(GlobalMemory::new(1000));
        let account = MemoryAccount::new(500, global);
        account.try_allocate(100).unwrap();
        account.try_resize(100, 50).unwrap();
        assert_eq!(account.used(), 50);
        account.try_resize(50, 200).unwrap();
        assert_eq!(account.used(), 200);
    }
}
