//! Client context: many small state machines multiplexed onto one thread.
//!
//! A context owns a service thread and a message queue; the thread is the
//! queue's only reader. Clients are handler functions attached to the
//! context; messages are either addressed to one client or broadcast to
//! all of them in attach order.
//!
//! A handler returning `false` means "I could not complete — call me again
//! after other traffic has had a chance to drain". The context records the
//! client in its pending-resume set and re-queues a `ResumeClient` message
//! at the *tail* of the queue, deliberately behind intervening messages.
//! Combined with `try_send` backpressure this turns a would-be queue
//! overflow into a graceful retry: a producer client that fills the queue
//! suspends itself and is rescheduled behind the consumer's progress.
//!
//! Handlers run on the shared service thread and must never block it: from
//! inside a handler, send with [`Context::try_send`] only. Other threads
//! and ISRs may use the blocking or try variants freely.
//!
//! A broadcast `StopContext` shuts the context down: every client receives
//! one final `StopClient`, the loop exits, and whatever still sits in the
//! queue is discarded.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, Ordering};

use ternos_abi::{INVALID_THREAD_ID, MAX_CONTEXT_CLIENTS, ThreadId};
use ternos_lib::IrqMutex;
use ternos_lib::list::{IndexList, Link, LinkArena};

use crate::sched::{self, thread_spawn, thread_wait_for_stop};
use crate::sync::{Mutex, Queue, Timer};

pub type ClientId = u16;

/// Client handler: receives the message and the private word given at
/// attach time. Return `false` to be resumed after the queue drains.
pub type ClientHandler = fn(&ContextMessage, usize) -> bool;

const BROADCAST: u16 = u16::MAX;

const ID_START_CLIENT: u32 = 0xFFFF_FFFC;
const ID_STOP_CLIENT: u32 = 0xFFFF_FFFD;
const ID_RESUME_CLIENT: u32 = 0xFFFF_FFFE;
const ID_STOP_CONTEXT: u32 = 0xFFFF_FFFF;

/// Message kinds: four reserved control kinds plus user IDs from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    StartClient,
    StopClient,
    ResumeClient,
    StopContext,
    User(u32),
}

#[derive(Clone, Copy, Debug)]
pub struct ContextMessage {
    target: u16,
    id: u32,
    data: usize,
}

impl ContextMessage {
    /// A user message broadcast to every client.
    pub const fn broadcast(id: u32, data: usize) -> Self {
        Self {
            target: BROADCAST,
            id,
            data,
        }
    }

    /// A user message addressed to one client.
    pub const fn to(client: ClientId, id: u32, data: usize) -> Self {
        Self {
            target: client,
            id,
            data,
        }
    }

    const fn control(id: u32, target: u16) -> Self {
        Self {
            target,
            id,
            data: 0,
        }
    }

    pub fn set_target(&mut self, client: ClientId) {
        self.target = client;
    }

    pub fn set_broadcast(&mut self) {
        self.target = BROADCAST;
    }

    pub fn set_payload(&mut self, data: usize) {
        self.data = data;
    }

    pub fn data(&self) -> usize {
        self.data
    }

    pub fn target(&self) -> Option<ClientId> {
        if self.target == BROADCAST {
            None
        } else {
            Some(self.target)
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.id {
            ID_START_CLIENT => MessageKind::StartClient,
            ID_STOP_CLIENT => MessageKind::StopClient,
            ID_RESUME_CLIENT => MessageKind::ResumeClient,
            ID_STOP_CONTEXT => MessageKind::StopContext,
            id => MessageKind::User(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Client arena
// ---------------------------------------------------------------------------

struct ClientSlot {
    handler: Option<ClientHandler>,
    private: usize,
    link: Link,
    allocated: bool,
}

impl ClientSlot {
    const fn empty() -> Self {
        Self {
            handler: None,
            private: 0,
            link: Link::detached(),
            allocated: false,
        }
    }
}

struct ContextInner {
    clients: [ClientSlot; MAX_CONTEXT_CLIENTS],
    /// Attach order; broadcasts deliver in this order.
    list: IndexList,
}

struct ClientLinks<'a>(&'a mut [ClientSlot; MAX_CONTEXT_CLIENTS]);

impl LinkArena for ClientLinks<'_> {
    fn link(&self, idx: u16) -> Link {
        self.0[idx as usize].link
    }
    fn set_link(&mut self, idx: u16, link: Link) {
        self.0[idx as usize].link = link;
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct Context {
    /// Guards the client arena and attach list only.
    mutex: Mutex,
    queue: Queue<ContextMessage>,
    inner: UnsafeCell<ContextInner>,
    /// Clients awaiting a ResumeClient enqueue, one bit per slot.
    resume_pending: AtomicU32,
    thread: AtomicU16,
}

// SAFETY: `inner` is only touched with `mutex` held.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub const fn new() -> Self {
        const SLOT: ClientSlot = ClientSlot::empty();
        Self {
            mutex: Mutex::new(),
            queue: Queue::new(),
            inner: UnsafeCell::new(ContextInner {
                clients: [SLOT; MAX_CONTEXT_CLIENTS],
                list: IndexList::new(),
            }),
            resume_pending: AtomicU32::new(0),
            thread: AtomicU16::new(INVALID_THREAD_ID),
        }
    }

    /// Give the context its message storage. The queue's capacity is the
    /// context's backpressure depth.
    pub fn init(&self, storage: &'static mut [ContextMessage]) {
        self.queue.init(storage);
    }

    /// Spawn the service thread. The context must outlive it.
    pub fn start(
        &'static self,
        name: &'static str,
        priority: u8,
        stack: &'static mut [u8],
    ) -> bool {
        let arg = self as *const Context as usize;
        match thread_spawn(name, context_entry, arg, priority, stack) {
            Some(tid) => {
                self.thread.store(tid, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Request shutdown: every client gets a final StopClient, then the
    /// service thread exits. From a handler this is a try-send; false
    /// means the queue was full and the caller should retry (return false
    /// from the handler and try again on resume).
    pub fn stop(&self) -> bool {
        self.send_from_anywhere(ContextMessage::control(ID_STOP_CONTEXT, BROADCAST))
    }

    /// Block until the service thread has stopped; returns its exit value.
    pub fn wait_for_stop(&self) -> i32 {
        let tid = self.thread.load(Ordering::Acquire);
        if tid == INVALID_THREAD_ID {
            return -1;
        }
        thread_wait_for_stop(tid)
    }

    pub fn service_thread(&self) -> ThreadId {
        self.thread.load(Ordering::Acquire)
    }

    /// Attach a client and queue its StartClient message.
    pub fn start_client(&self, handler: ClientHandler, private: usize) -> Option<ClientId> {
        self.mutex.lock();
        // SAFETY: ctx mutex held.
        let inner = unsafe { &mut *self.inner.get() };
        let Some(slot) = inner.clients.iter().position(|c| !c.allocated) else {
            self.mutex.unlock();
            return None;
        };
        inner.clients[slot] = ClientSlot {
            handler: Some(handler),
            private,
            link: Link::detached(),
            allocated: true,
        };
        let id = slot as u16;
        inner.list.push_back(&mut ClientLinks(&mut inner.clients), id);
        self.mutex.unlock();

        self.send_from_anywhere(ContextMessage::control(ID_START_CLIENT, id));
        Some(id)
    }

    /// Queue a StopClient for one client; it detaches after the delivery.
    pub fn stop_client(&self, client: ClientId) {
        self.send_from_anywhere(ContextMessage::control(ID_STOP_CLIENT, client));
    }

    // --- send helpers ---

    /// Non-blocking send; the only legal send from inside a handler.
    pub fn try_send(&self, msg: ContextMessage) -> bool {
        self.queue.try_send(msg)
    }

    /// Blocking send, for other threads. Must not be used on the service
    /// thread itself.
    pub fn send(&self, msg: ContextMessage) {
        self.queue.send(msg);
    }

    pub fn send_timeout(&self, msg: ContextMessage, ticks: u32) -> bool {
        self.queue.send_timeout(msg, ticks)
    }

    /// Blocking from foreign threads, try from the service thread (which
    /// must never block on its own queue).
    fn send_from_anywhere(&self, msg: ContextMessage) -> bool {
        if sched::current_thread() == self.thread.load(Ordering::Acquire) {
            self.try_send(msg)
        } else {
            self.send(msg);
            true
        }
    }

    // --- delivery ---

    fn snapshot_clients(&self) -> ([u16; MAX_CONTEXT_CLIENTS], usize) {
        let mut ids = [0u16; MAX_CONTEXT_CLIENTS];
        let mut n = 0;
        self.mutex.lock();
        // SAFETY: ctx mutex held.
        let inner = unsafe { &mut *self.inner.get() };
        let arena = ClientLinks(&mut inner.clients);
        for id in inner.list.iter(&arena) {
            ids[n] = id;
            n += 1;
        }
        self.mutex.unlock();
        (ids, n)
    }

    /// Call one client's handler. Returns the handler's verdict; a
    /// detached client counts as done.
    fn deliver_to(&self, client: u16, msg: &ContextMessage) -> bool {
        self.mutex.lock();
        // SAFETY: ctx mutex held.
        let inner = unsafe { &mut *self.inner.get() };
        let slot = client as usize;
        let call = if slot < MAX_CONTEXT_CLIENTS && inner.clients[slot].allocated {
            inner.clients[slot]
                .handler
                .map(|h| (h, inner.clients[slot].private))
        } else {
            None
        };
        // The handler runs under the (recursive) context mutex so a
        // concurrent stop_client cannot yank the slot mid-call.
        let done = match call {
            Some((handler, private)) => handler(msg, private),
            None => true,
        };
        self.mutex.unlock();
        done
    }

    fn detach(&self, client: u16) {
        self.mutex.lock();
        // SAFETY: ctx mutex held.
        let inner = unsafe { &mut *self.inner.get() };
        let slot = client as usize;
        if slot < MAX_CONTEXT_CLIENTS && inner.clients[slot].allocated {
            inner
                .list
                .remove(&mut ClientLinks(&mut inner.clients), client);
            inner.clients[slot] = ClientSlot::empty();
        }
        self.mutex.unlock();
        self.resume_pending
            .fetch_and(!(1u32 << client), Ordering::AcqRel);
    }

    fn mark_resume(&self, client: u16) {
        self.resume_pending
            .fetch_or(1u32 << client, Ordering::AcqRel);
    }

    /// Turn pending-resume bits into ResumeClient messages at the queue
    /// tail, as space allows. Bits that don't fit stay pending and are
    /// retried after the next delivery frees a slot.
    fn flush_resume(&self) {
        loop {
            let mask = self.resume_pending.load(Ordering::Acquire);
            if mask == 0 {
                return;
            }
            let client = mask.trailing_zeros() as u16;
            if !self
                .queue
                .try_send(ContextMessage::control(ID_RESUME_CLIENT, client))
            {
                return;
            }
            self.resume_pending
                .fetch_and(!(1u32 << client), Ordering::AcqRel);
        }
    }

    /// Handle one message. Returns false when the context should stop.
    pub(crate) fn process(&self, msg: ContextMessage) -> bool {
        match msg.kind() {
            MessageKind::StopContext => {
                let (ids, n) = self.snapshot_clients();
                for &id in &ids[..n] {
                    let stop = ContextMessage::control(ID_STOP_CLIENT, id);
                    self.deliver_to(id, &stop);
                    self.detach(id);
                }
                return false;
            }
            MessageKind::StopClient => match msg.target() {
                Some(t) => {
                    self.deliver_to(t, &msg);
                    self.detach(t);
                }
                None => {
                    let (ids, n) = self.snapshot_clients();
                    for &id in &ids[..n] {
                        self.deliver_to(id, &msg);
                        self.detach(id);
                    }
                }
            },
            _ => match msg.target() {
                Some(t) => {
                    if !self.deliver_to(t, &msg) {
                        self.mark_resume(t);
                    }
                }
                None => {
                    let (ids, n) = self.snapshot_clients();
                    for &id in &ids[..n] {
                        if !self.deliver_to(id, &msg) {
                            self.mark_resume(id);
                        }
                    }
                }
            },
        }
        self.flush_resume();
        true
    }

    fn run_loop(&self) {
        loop {
            let msg = self.queue.recv();
            if !self.process(msg) {
                break;
            }
        }
        // Messages behind a StopContext are silently discarded.
        while self.queue.try_recv().is_some() {}
    }
}

fn context_entry(arg: usize) -> i32 {
    // SAFETY: `start` passes a pointer to a context that outlives the
    // service thread.
    let ctx = unsafe { &*(arg as *const Context) };
    ctx.run_loop();
    0
}

// ---------------------------------------------------------------------------
// Context timers
// ---------------------------------------------------------------------------

/// A one-shot timer that delivers a pre-built message into a context's
/// queue on expiry, so clients receive time events through the ordinary
/// message path.
pub struct ContextTimer {
    timer: Timer,
    ctx: AtomicPtr<Context>,
    msg: IrqMutex<ContextMessage>,
}

// SAFETY: interior state is atomics and an IrqMutex.
unsafe impl Sync for ContextTimer {}

impl ContextTimer {
    pub const fn new() -> Self {
        Self {
            timer: Timer::new(),
            ctx: AtomicPtr::new(core::ptr::null_mut()),
            msg: IrqMutex::new(ContextMessage::broadcast(0, 0)),
        }
    }

    /// Arm the timer: `msg` is queued on `ctx` after `ticks`. ISR-safe.
    pub fn start(&'static self, ctx: &'static Context, ticks: u32, msg: ContextMessage) -> bool {
        *self.msg.lock() = msg;
        self.ctx
            .store(ctx as *const Context as *mut Context, Ordering::Release);
        if !self.timer.init(context_timer_expiry) {
            return false;
        }
        self.timer.set(ticks, self as *const ContextTimer as usize)
    }

    pub fn cancel(&self) {
        self.timer.cancel();
    }
}

fn context_timer_expiry(user: usize) -> bool {
    // SAFETY: `start` arms the timer with a pointer to a 'static
    // ContextTimer.
    let timer = unsafe { &*(user as *const ContextTimer) };
    let ctx = timer.ctx.load(Ordering::Acquire);
    if !ctx.is_null() {
        let msg = *timer.msg.lock();
        // SAFETY: `start` requires a 'static context.
        unsafe { (*ctx).try_send(msg) };
    }
    // One-shot: the expiry consumed the message.
    true
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
