//! Blocking queue: a fixed-capacity ring built from two semaphores.
//!
//! The tail semaphore counts free slots (starts at capacity), the head
//! semaphore counts stored elements (starts at zero). Senders take a slot,
//! copy the element inside an interrupt-masked cursor window, publish with
//! a barrier, and release the head semaphore; receivers mirror that.
//! Element order is tail-semaphore acquisition order.
//!
//! `try_send`/`try_recv` never block and are ISR-safe. A queue may be
//! bound to a [`Signal`] channel so one consumer can wait on many queues
//! through a [`QueueGroup`]: every send raises the queue's channel bit,
//! lower channel = higher priority.

use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use ternos_lib::{IrqMutex, cpu};

use super::semaphore::Semaphore;
use super::signal::{Signal, next_channel};

struct Cursors {
    head: usize,
    tail: usize,
}

pub struct Queue<T: Copy> {
    buf: AtomicPtr<T>,
    cap: AtomicUsize,
    cursors: IrqMutex<Cursors>,
    /// Elements available.
    pub(crate) head_sem: Semaphore,
    /// Slots available.
    pub(crate) tail_sem: Semaphore,
    signal: AtomicPtr<Signal>,
    channel: AtomicU8,
}

// SAFETY: the buffer is handed over exclusively at init; slot access is
// serialized by the semaphores plus the cursor lock.
unsafe impl<T: Copy + Send> Send for Queue<T> {}
unsafe impl<T: Copy + Send> Sync for Queue<T> {}

impl<T: Copy> Queue<T> {
    pub const fn new() -> Self {
        Self {
            buf: AtomicPtr::new(core::ptr::null_mut()),
            cap: AtomicUsize::new(0),
            cursors: IrqMutex::new(Cursors { head: 0, tail: 0 }),
            head_sem: Semaphore::new(0),
            tail_sem: Semaphore::new(0),
            signal: AtomicPtr::new(core::ptr::null_mut()),
            channel: AtomicU8::new(0),
        }
    }

    /// Give the queue its element storage. Must happen before first use.
    pub fn init(&self, storage: &'static mut [T]) {
        let mut c = self.cursors.lock();
        c.head = 0;
        c.tail = 0;
        self.cap.store(storage.len(), Ordering::Release);
        self.buf.store(storage.as_mut_ptr(), Ordering::Release);
        self.head_sem.init(0);
        self.tail_sem.init(storage.len() as u32);
    }

    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    /// Elements currently stored.
    pub fn len(&self) -> usize {
        self.head_sem.value() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind this queue to bit `channel` of `signal` for multi-queue waits.
    pub fn bind_signal(&self, signal: &'static Signal, channel: u8) {
        self.channel.store(channel, Ordering::Release);
        self.signal
            .store(signal as *const Signal as *mut Signal, Ordering::Release);
    }

    fn write_slot(&self, value: T) {
        {
            let mut c = self.cursors.lock();
            let cap = self.cap.load(Ordering::Relaxed);
            // SAFETY: a tail-semaphore unit guarantees this slot is free;
            // the cursor lock serializes cursor movement against ISRs.
            unsafe {
                self.buf.load(Ordering::Relaxed).add(c.tail).write(value);
            }
            c.tail = (c.tail + 1) % cap;
        }
        // Publish the slot before the head semaphore announces it.
        cpu::barrier();
    }

    fn read_slot(&self) -> T {
        let value = {
            let mut c = self.cursors.lock();
            let cap = self.cap.load(Ordering::Relaxed);
            // SAFETY: a head-semaphore unit guarantees this slot holds an
            // element published by a completed send.
            let v = unsafe { self.buf.load(Ordering::Relaxed).add(c.head).read() };
            c.head = (c.head + 1) % cap;
            v
        };
        cpu::barrier();
        value
    }

    fn notify(&self) {
        let signal = self.signal.load(Ordering::Acquire);
        if !signal.is_null() {
            // SAFETY: bind_signal stores only 'static signals.
            unsafe { (*signal).raise_channel(self.channel.load(Ordering::Acquire)) };
        }
    }

    /// Append, blocking while the queue is full.
    pub fn send(&self, value: T) {
        self.tail_sem.wait();
        self.write_slot(value);
        self.head_sem.release();
        self.notify();
    }

    /// Append without blocking. ISR-safe. False when full.
    pub fn try_send(&self, value: T) -> bool {
        if !self.tail_sem.try_take() {
            return false;
        }
        self.write_slot(value);
        self.head_sem.release();
        self.notify();
        true
    }

    /// Append, blocking at most `ticks`. False on timeout.
    pub fn send_timeout(&self, value: T, ticks: u32) -> bool {
        if !self.tail_sem.wait_timeout(ticks) {
            return false;
        }
        self.write_slot(value);
        self.head_sem.release();
        self.notify();
        true
    }

    /// Take the oldest element, blocking while the queue is empty.
    pub fn recv(&self) -> T {
        self.head_sem.wait();
        let value = self.read_slot();
        self.tail_sem.release();
        value
    }

    /// Take without blocking. ISR-safe. `None` when empty.
    pub fn try_recv(&self) -> Option<T> {
        if !self.head_sem.try_take() {
            return None;
        }
        let value = self.read_slot();
        self.tail_sem.release();
        Some(value)
    }

    /// Take, blocking at most `ticks`. `None` on timeout.
    pub fn recv_timeout(&self, ticks: u32) -> Option<T> {
        if !self.head_sem.wait_timeout(ticks) {
            return None;
        }
        let value = self.read_slot();
        self.tail_sem.release();
        Some(value)
    }
}

impl<T: Copy> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Word-sized specialization: the common case for command and event
/// queues, with the element copy inlined to a single store.
pub type QueueU32 = Queue<u32>;

// ---------------------------------------------------------------------------
// Multi-queue wait
// ---------------------------------------------------------------------------

/// One consumer waiting on several queues.
///
/// Each queue gets a channel bit in the group's signal via
/// [`QueueGroup::attach`]. [`wait`](QueueGroup::wait) returns the
/// highest-priority ready channel (lowest bit) *without* consuming the
/// other channels' readiness; the consumer drains that queue with
/// `try_recv` until empty, then calls [`clear`](QueueGroup::clear) and
/// waits again.
pub struct QueueGroup {
    pub(crate) signal: Signal,
    pending: core::sync::atomic::AtomicU32,
}

impl QueueGroup {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
            pending: core::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Route `queue`'s sends to bit `channel` of this group.
    pub fn attach<T: Copy>(&'static self, queue: &Queue<T>, channel: u8) {
        queue.bind_signal(&self.signal, channel);
    }

    fn take_pending(&self) -> u32 {
        let polled = self.signal.poll();
        if polled != 0 {
            self.pending.fetch_or(polled, Ordering::AcqRel);
        }
        self.pending.load(Ordering::Acquire)
    }

    /// Highest-priority ready channel, blocking until one is ready.
    pub fn wait(&self) -> u8 {
        loop {
            let mask = self.take_pending();
            if let Some(ch) = next_channel(mask) {
                return ch;
            }
            let mask = self.signal.wait();
            self.pending.fetch_or(mask, Ordering::AcqRel);
        }
    }

    /// Like [`wait`](Self::wait) with a bound; `None` on timeout.
    pub fn wait_timeout(&self, ticks: u32) -> Option<u8> {
        loop {
            let mask = self.take_pending();
            if let Some(ch) = next_channel(mask) {
                return Some(ch);
            }
            match self.signal.wait_timeout(ticks) {
                Some(mask) => {
                    self.pending.fetch_or(mask, Ordering::AcqRel);
                }
                None => return None,
            }
        }
    }

    /// Declare `channel` drained.
    pub fn clear(&self, channel: u8) {
        self.pending
            .fetch_and(!(1u32 << channel), Ordering::AcqRel);
    }
}

impl Default for QueueGroup {
    fn default() -> Self {
        Self::new()
    }
}
