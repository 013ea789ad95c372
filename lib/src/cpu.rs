//! CPU intrinsics: interrupt masking, barriers, low-power wait, cycle counter.
//!
//! Two ports share one API:
//!
//! - **Cortex-M** (`target_arch = "arm"`, `target_os = "none"`): PRIMASK for
//!   the full-disable tier, BASEPRI for the raised-base-priority tier, DSB/ISB
//!   barriers, WFI, and the DWT cycle counter. Requires ARMv7-M or later
//!   (BASEPRI and 32-bit compare-and-swap are not architected on ARMv6-M).
//! - **Hosted** (everything else): logically equivalent no-ops so the kernel's
//!   state machines can be exercised by host unit tests. The hosted "cycle
//!   counter" is a monotonic atomic so elapsed-time math stays testable.
//!
//! The irqsave/irqrestore pair is the kernel-wide locking idiom:
//!
//! ```ignore
//! let flags = cpu::save_flags_cli();
//! // ... critical section ...
//! cpu::restore_flags(flags);
//! ```

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod port {
    use cortex_m::peripheral::DWT;
    use cortex_m::register::{basepri, basepri_max, primask};

    /// Enable interrupts (clear PRIMASK).
    ///
    /// # Safety-adjacent note
    /// Only the owner of a saved-flags token should re-enable; use
    /// [`restore_flags`] in normal code.
    #[inline(always)]
    pub fn enable_interrupts() {
        unsafe { cortex_m::interrupt::enable() };
    }

    /// Disable interrupts (set PRIMASK).
    #[inline(always)]
    pub fn disable_interrupts() {
        cortex_m::interrupt::disable();
    }

    /// Save the interrupt-enable state and disable interrupts (irqsave).
    /// Returns a token for [`restore_flags`].
    #[inline(always)]
    pub fn save_flags_cli() -> u32 {
        let enabled = primask::read().is_active();
        cortex_m::interrupt::disable();
        // PRIMASK "active" means exceptions are masked; the token records
        // whether interrupts were *enabled* on entry.
        if enabled { 0 } else { 1 }
    }

    /// Restore the interrupt-enable state from a [`save_flags_cli`] token
    /// (irqrestore). Interrupts are re-enabled only if they were enabled
    /// when the token was taken.
    #[inline(always)]
    pub fn restore_flags(flags: u32) {
        if flags != 0 {
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    /// Returns true if interrupts are currently enabled.
    #[inline(always)]
    pub fn interrupts_enabled() -> bool {
        !primask::read().is_active()
    }

    /// Raise the base priority mask to `level`, masking every interrupt at
    /// that priority or lower (numerically greater-or-equal). Returns the
    /// previous BASEPRI for [`restore_basepri`]. Uses BASEPRI_MAX so a
    /// nested call can only tighten the mask.
    #[inline(always)]
    pub fn raise_basepri(level: u8) -> u8 {
        let old = basepri::read();
        unsafe { basepri_max::write(level) };
        old
    }

    /// Restore a BASEPRI value saved by [`raise_basepri`].
    #[inline(always)]
    pub fn restore_basepri(level: u8) {
        unsafe { basepri::write(level) };
    }

    /// Full data-synchronization + instruction barrier. Required between
    /// pending the context-switch exception and relying on it having been
    /// taken, and between a queue-slot write and the semaphore increment
    /// that publishes it.
    #[inline(always)]
    pub fn barrier() {
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    /// Wait for interrupt (the idle sleep instruction).
    #[inline(always)]
    pub fn wait_for_interrupt() {
        cortex_m::asm::wfi();
    }

    /// Read the DWT cycle counter. The port's init enables it; it wraps at
    /// 2^32 and all elapsed-cycle math must be wrapping.
    #[inline(always)]
    pub fn cycle_count() -> u32 {
        // SAFETY: CYCCNT is a read-only data-watchpoint register; racing
        // reads are harmless.
        unsafe { (*DWT::ptr()).cyccnt.read() }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod port {
    use core::sync::atomic::{AtomicU32, Ordering, fence};

    /// Depth of the emulated interrupt-disable nesting.
    static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);

    /// Monotonic stand-in for a hardware cycle counter.
    static CYCLES: AtomicU32 = AtomicU32::new(0);

    #[inline(always)]
    pub fn enable_interrupts() {
        MASK_DEPTH.store(0, Ordering::Release);
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        MASK_DEPTH.fetch_add(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn save_flags_cli() -> u32 {
        let prev = MASK_DEPTH.fetch_add(1, Ordering::AcqRel);
        if prev == 0 { 1 } else { 0 }
    }

    #[inline(always)]
    pub fn restore_flags(flags: u32) {
        if flags != 0 {
            MASK_DEPTH.store(0, Ordering::Release);
        } else {
            MASK_DEPTH.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[inline(always)]
    pub fn interrupts_enabled() -> bool {
        MASK_DEPTH.load(Ordering::Acquire) == 0
    }

    #[inline(always)]
    pub fn raise_basepri(_level: u8) -> u8 {
        save_flags_cli() as u8
    }

    #[inline(always)]
    pub fn restore_basepri(level: u8) {
        restore_flags(level as u32);
    }

    #[inline(always)]
    pub fn barrier() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    #[inline(always)]
    pub fn cycle_count() -> u32 {
        CYCLES.fetch_add(1, Ordering::Relaxed)
    }
}

pub use port::{
    barrier, cycle_count, disable_interrupts, enable_interrupts, interrupts_enabled,
    raise_basepri, restore_basepri, restore_flags, save_flags_cli, wait_for_interrupt,
};

/// Spin-loop hint for short waits.
#[inline(always)]
pub fn spin_hint() {
    core::hint::spin_loop();
}
