//! The idle thread: tickless sleep.
//!
//! Idle runs at the implementation-only lowest priority and is scheduled
//! exactly when no application thread is runnable. Rather than burning
//! ticks, it reprograms the down-counter for the longest interval the
//! timer list allows, sleeps on wait-for-interrupt, and reconciles however
//! much time actually passed back into the kernel tick count — splitting
//! the "counter rolled over" case (the whole span elapsed) from the "woke
//! early" case (derive the elapsed span from the remaining count).
//!
//! The optional sleep/wake hooks bracket the wait instruction so boards
//! can gate clocks or rails around the nap.

use ternos_lib::cpu;

use super::{KERNEL, timer_list};
use crate::arch;
use crate::hooks;

/// How long idle may sleep, bounded by the earliest timer-list wake and
/// the hardware counter. `None` means "work is due now — do not sleep".
pub(crate) fn sleep_span(now: u64, earliest_wake: Option<u64>, max_ticks: u32) -> Option<u32> {
    match earliest_wake {
        Some(wake) if wake <= now => None,
        Some(wake) => Some((wake - now).min(max_ticks as u64) as u32),
        None => Some(max_ticks),
    }
}

pub(crate) fn idle_entry(_arg: usize) -> i32 {
    loop {
        let flags = cpu::save_flags_cli();

        let span = {
            let k = KERNEL.lock();
            sleep_span(k.tick, timer_list::earliest_wake(&k), arch::max_sleep_ticks())
        };

        let Some(span) = span else {
            // Expiries are already due; let the tick path run them.
            cpu::restore_flags(flags);
            super::yield_now();
            continue;
        };

        // Stop the periodic tick and re-aim the down-counter at the next
        // deadline. The tick interrupt stays armed so the expiry itself
        // can end the sleep.
        arch::tick_stop();
        arch::tickless_begin(span);
        hooks::sleep();

        cpu::restore_flags(flags);
        arch::wait_for_interrupt();

        let flags = cpu::save_flags_cli();
        hooks::wake();
        let elapsed = arch::tickless_end(span);
        cpu::restore_flags(flags);

        // Fold the real elapsed time back in and run anything that came
        // due; the periodic tick was re-armed by tickless_end.
        super::advance_tick_count(elapsed as u64);
        super::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_is_bounded_by_earliest_wake() {
        assert_eq!(sleep_span(100, Some(130), 1000), Some(30));
        assert_eq!(sleep_span(100, Some(5000), 64), Some(64));
    }

    #[test]
    fn due_work_prevents_sleep() {
        assert_eq!(sleep_span(100, Some(100), 64), None);
        assert_eq!(sleep_span(100, Some(40), 64), None);
    }

    #[test]
    fn no_timers_means_max_span() {
        assert_eq!(sleep_span(0, None, 64), Some(64));
    }
}
