//! Thread ABI types shared between kernel subsystems.
//!
//! This module contains **only** the types and constants that form the stable
//! interface between crates. Kernel-internal implementation details (the
//! thread table, run-queue linkage, saved contexts) live in
//! `ternos_core::sched`.

// --- Kernel configuration ---

/// Number of slots in the thread table, including the idle thread.
pub const MAX_THREADS: usize = 32;

/// Number of application priority levels. Priority 0 is the highest; the
/// lowest application priority is `MAX_PRIORITIES - 1`.
pub const MAX_PRIORITIES: usize = 8;

/// Implementation-only priority of the idle thread. Never assignable by
/// application code.
pub const IDLE_PRIORITY: u8 = MAX_PRIORITIES as u8;

/// Number of slots in the software-timer arena.
pub const MAX_TIMERS: usize = 16;

/// Maximum number of clients attachable to one context runtime.
pub const MAX_CONTEXT_CLIENTS: usize = 16;

/// Default system tick rate. The board may run the tick at another rate;
/// every kernel timeout is expressed in ticks, not wall time.
pub const DEFAULT_TICK_HZ: u32 = 1000;

/// Smallest stack a thread may be created with. Must hold the synthetic
/// exception frame plus headroom for the termination handler.
pub const MIN_STACK_SIZE: usize = 256;

/// Byte pattern written over a fresh stack; the unconsumed prefix of the
/// pattern is how stack usage is measured.
pub const STACK_FILL_BYTE: u8 = 0xA5;

/// Thread identifier: an index into the kernel's thread table.
pub type ThreadId = u16;

/// Sentinel for "no thread".
pub const INVALID_THREAD_ID: ThreadId = ThreadId::MAX;

/// Entry point signature for threads and termination handlers. The argument
/// is an opaque word supplied at creation; the return value becomes the
/// thread's stop value.
pub type ThreadEntry = fn(usize) -> i32;

// --- ThreadState ---

/// Type-safe thread state with explicit state-machine semantics.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Thread slot is not in use.
    #[default]
    Uninit = 0,
    /// Thread is initialized but has not been started.
    Init = 1,
    /// Thread is ready to run and on a run queue (or currently running).
    Runnable = 2,
    /// Blocked on a mutex's pend queue.
    WaitForMutex = 3,
    /// Blocked on a semaphore's pend queue.
    WaitForSem = 4,
    /// Blocked on a semaphore's pend queue with a tick timeout armed.
    WaitForSemOrTick = 5,
    /// Blocked waiting for another thread to stop.
    WaitForStop = 6,
    /// Blocked waiting for another thread to stop, with a timeout armed.
    WaitForStopOrTick = 7,
    /// Sleeping until a wake tick (plain delay).
    WaitForTick = 8,
    /// Marked for termination; the scheduler will recycle the thread into
    /// its termination handler on the next pass.
    TimeToStop = 9,
    /// Terminated; stop value is available to joiners.
    Stopped = 10,
}

impl ThreadState {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Init,
            2 => Self::Runnable,
            3 => Self::WaitForMutex,
            4 => Self::WaitForSem,
            5 => Self::WaitForSemOrTick,
            6 => Self::WaitForStop,
            7 => Self::WaitForStopOrTick,
            8 => Self::WaitForTick,
            9 => Self::TimeToStop,
            10 => Self::Stopped,
            _ => Self::Uninit,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for every blocked state (anything between Runnable and
    /// TimeToStop in the lifecycle).
    #[inline]
    pub const fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::WaitForMutex
                | Self::WaitForSem
                | Self::WaitForSemOrTick
                | Self::WaitForStop
                | Self::WaitForStopOrTick
                | Self::WaitForTick
        )
    }

    /// True when the state carries a tick timeout, i.e. the thread must be
    /// on the timer list while in this state.
    #[inline]
    pub const fn has_timeout(self) -> bool {
        matches!(
            self,
            Self::WaitForSemOrTick | Self::WaitForStopOrTick | Self::WaitForTick
        )
    }

    /// Validity of a direct state transition. The kernel debug-asserts on
    /// these edges; release builds trust its internal discipline.
    pub const fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::Uninit, Self::Init) => true,
            (Self::Init, Self::Runnable) => true,
            // A runnable (possibly running) thread may block, be marked for
            // termination, or stop outright through its exit path.
            (Self::Runnable, t) => {
                t.is_waiting() || matches!(t, Self::TimeToStop | Self::Stopped | Self::Init)
            }
            // Wakeup, timeout, or a kill recycling the slot.
            (s, Self::Runnable) if s.is_waiting() => true,
            (s, Self::Init) if s.is_waiting() => true,
            (Self::TimeToStop, Self::Runnable) => true,
            (Self::Stopped, Self::Init) => true,
            (Self::Stopped, Self::Runnable) => true,
            _ => false,
        }
    }
}
