//! Software timers, driven from the system tick.
//!
//! Timer state lives in a kernel arena slot; the handle only carries the
//! slot index, so every operation is ISR-safe (a kernel-locked arena
//! update). Callbacks run from tick context without the kernel lock and
//! may use any ISR-safe operation. Returning `true` makes the expiry
//! one-shot; returning `false` keeps the timer periodic at its configured
//! duration (unless the callback already retargeted it).

use core::sync::atomic::{AtomicU16, Ordering};

use crate::sched::{KERNEL, timer_list};

/// Expiry callback: receives the user word given to [`Timer::set`].
/// `true` = done (one-shot); `false` = stay armed (periodic).
pub type TimerCallback = fn(usize) -> bool;

const NO_SLOT: u16 = u16::MAX;

pub struct Timer {
    slot: AtomicU16,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            slot: AtomicU16::new(NO_SLOT),
        }
    }

    /// Claim an arena slot and attach the callback. Re-initializing an
    /// initialized timer just replaces the callback. False when the arena
    /// is exhausted.
    pub fn init(&self, callback: TimerCallback) -> bool {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let current = self.slot.load(Ordering::Acquire);
        if current != NO_SLOT {
            ks.timers[current as usize].callback = Some(callback);
            return true;
        }
        let Some(slot) = ks.timers.iter().position(|s| !s.allocated) else {
            return false;
        };
        let s = &mut ks.timers[slot];
        s.allocated = true;
        s.callback = Some(callback);
        s.active = false;
        s.generation = s.generation.wrapping_add(1);
        self.slot.store(slot as u16, Ordering::Release);
        true
    }

    /// Arm the timer to fire `ticks` from now, passing `user` to the
    /// callback. Re-arms an already-armed timer. ISR-safe.
    pub fn set(&self, ticks: u32, user: usize) -> bool {
        if ticks == 0 {
            return false;
        }
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let slot = self.slot.load(Ordering::Acquire);
        if slot == NO_SLOT || !ks.timers[slot as usize].allocated {
            return false;
        }
        timer_list::remove_timer(ks, slot);
        let now = ks.tick;
        let s = &mut ks.timers[slot as usize];
        s.generation = s.generation.wrapping_add(1);
        s.duration = ticks;
        s.user = user;
        s.active = true;
        s.wake_tick = now.wrapping_add(ticks as u64);
        timer_list::insert_timer(ks, slot);
        true
    }

    /// Disarm; a concurrent expiry becomes a no-op. ISR-safe.
    pub fn cancel(&self) {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let slot = self.slot.load(Ordering::Acquire);
        if slot == NO_SLOT {
            return;
        }
        timer_list::remove_timer(ks, slot);
        let s = &mut ks.timers[slot as usize];
        s.generation = s.generation.wrapping_add(1);
        s.active = false;
    }

    /// Restart the current duration from now. ISR-safe.
    pub fn reset(&self) -> bool {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let slot = self.slot.load(Ordering::Acquire);
        if slot == NO_SLOT {
            return false;
        }
        if !ks.timers[slot as usize].allocated || ks.timers[slot as usize].duration == 0 {
            return false;
        }
        timer_list::remove_timer(ks, slot);
        let now = ks.tick;
        let s = &mut ks.timers[slot as usize];
        s.generation = s.generation.wrapping_add(1);
        s.active = true;
        s.wake_tick = now.wrapping_add(s.duration as u64);
        timer_list::insert_timer(ks, slot);
        true
    }

    /// Return the arena slot. The handle can be re-`init`ed later.
    pub fn deinit(&self) {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let slot = self.slot.swap(NO_SLOT, Ordering::AcqRel);
        if slot == NO_SLOT {
            return;
        }
        timer_list::remove_timer(ks, slot);
        ks.timers[slot as usize] = crate::sched::timer_list::TimerSlot::empty();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
