//! Typed 32-bit loads/stores over a memory-mapped PCI BAR.
//!
//! All accesses are little-endian regardless of host endianness (the hardware
//! presents its registers in little-endian byte order), and go through
//! [`volatile::Volatile`] so the compiler can never merge, reorder or elide
//! them. The memory-ordering fences the NIC descriptor rings depend on
//! ([`wmb`] and [`rmb`]) live here, next to the loads/stores they guard.

pub use volatile::Volatile;

use std::sync::atomic::{compiler_fence, fence, Ordering};

/// Orders every preceding store before every subsequent store.
///
/// Required before publishing a new tail index, so that the descriptor
/// writes the CPU just made are visible to the NIC before it observes the
/// new tail value. On a strongly-ordered host this still emits a compiler
/// fence so instruction reordering can't hoist the tail write above the
/// descriptor writes it's supposed to follow.
#[inline(always)]
pub fn wmb() {
    fence(Ordering::Release);
    compiler_fence(Ordering::Release);
}

/// Orders the descriptor-done bit load before every subsequent load.
///
/// Required after testing a descriptor's DD bit and before reading the rest
/// of its writeback fields, matching the order the NIC promises to make
/// those writes visible in.
#[inline(always)]
pub fn rmb() {
    fence(Ordering::Acquire);
    compiler_fence(Ordering::Acquire);
}

/// A raw, untyped view over one memory-mapped register window (one BAR).
///
/// Higher layers (the `ixgbe` crate's `regs` module) only ever name byte
/// offsets into this window, never a typed struct overlay; every individual
/// 32-bit access still goes through [`Volatile`] so the compiler can't
/// merge, reorder or elide it.
pub struct RegisterWindow {
    base: *mut u8,
    len: usize,
}

// SAFETY: `RegisterWindow` is just a typed pointer into mmap'd device
// memory; moving the pointer across threads is fine, the actual accesses are
// volatile and the caller is responsible for not aliasing mutation.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

impl RegisterWindow {
    /// Wraps an already-mapped BAR. `base` must point at a valid mapping of
    /// at least `len` bytes that lives at least as long as this value.
    ///
    /// # Safety
    /// `base` must be a valid pointer to `len` bytes of MMIO space, and the
    /// caller must not allow any other mutable access to the same range for
    /// the lifetime of this `RegisterWindow`.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        RegisterWindow { base, len }
    }

    /// Base address of the mapped region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Length of the mapped region, in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads a 32-bit little-endian register at `offset` bytes from the base.
    ///
    /// # Panics
    /// Panics if the access would run past the end of the mapped window.
    #[inline]
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "mmio read out of bounds");
        // SAFETY: bounds-checked above; the pointer is valid MMIO per `new`'s
        // contract, and `Volatile<u32>` has the same size and alignment as `u32`.
        let reg = unsafe { &*(self.base.add(offset) as *const Volatile<u32>) };
        reg.read().to_le()
    }

    /// Writes a 32-bit little-endian register at `offset` bytes from the base.
    ///
    /// # Panics
    /// Panics if the access would run past the end of the mapped window.
    #[inline]
    pub fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "mmio write out of bounds");
        // SAFETY: bounds-checked above; the pointer is valid MMIO per `new`'s
        // contract. Writing through a `&mut` reached from `&self` is sound
        // here because the caller contract in `new` is what rules out
        // concurrent mutation of this range, not Rust's aliasing rules.
        let reg = unsafe { &mut *(self.base.add(offset) as *mut Volatile<u32>) };
        reg.write(value.to_le());
    }

    /// Forces every preceding MMIO write to post by issuing a dummy read of
    /// a register that is safe to read back (conventionally STATUS).
    #[inline]
    pub fn write_flush(&self, status_offset: usize) {
        let _ = self.read32(status_offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_over(buf: &mut [u8]) -> RegisterWindow {
        // SAFETY: `buf` outlives the window in these tests.
        unsafe { RegisterWindow::new(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn round_trips_little_endian() {
        let mut buf = [0u8; 16];
        let win = window_over(&mut buf);
        win.write32(4, 0xdead_beef);
        assert_eq!(win.read32(4), 0xdead_beef);
        assert_eq!(&buf[4..8], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn rejects_out_of_bounds_access() {
        let mut buf = [0u8; 8];
        let win = window_over(&mut buf);
        win.read32(8);
    }

    #[test]
    fn write_flush_reads_back_status() {
        let mut buf = [0u8; 16];
        let win = window_over(&mut buf);
        win.write32(8, 42);
        win.write_flush(8); // should not panic, and should observe the write
        assert_eq!(win.read32(8), 42);
    }
}
