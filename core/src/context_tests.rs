//! Host-side context-runtime tests.
//!
//! The service loop is pumped by hand (the hosted port cannot run the
//! service thread), with the running-thread pointer parked on the service
//! thread so handler-side sends take the non-blocking path, exactly as
//! they must on target.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use std::boxed::Box;
use std::vec;

use super::*;
use crate::sched::advance_tick_count;
use crate::sched::testutil::*;

fn make_context(depth: usize) -> &'static Context {
    let ctx = Box::leak(Box::new(Context::new()));
    let storage = Box::leak(vec![ContextMessage::broadcast(0, 0); depth].into_boxed_slice());
    ctx.init(storage);
    ctx
}

fn start_context(ctx: &'static Context) {
    assert!(ctx.start("ctx", 2, leak_stack(512)));
    // Handler-context sends must see themselves on the service thread.
    set_running(ctx.service_thread());
}

/// Deliver queued messages until the context stops; false if it stalls.
fn pump_until_stopped(ctx: &Context, max_steps: usize) -> bool {
    for _ in 0..max_steps {
        match ctx.queue.try_recv() {
            Some(msg) => {
                if !ctx.process(msg) {
                    return true;
                }
            }
            None => return false,
        }
    }
    false
}

fn client_count(ctx: &Context) -> usize {
    let (_, n) = ctx.snapshot_clients();
    n
}

#[test]
fn start_client_delivers_start_message_then_detach_on_stop() {
    static STARTS: AtomicU32 = AtomicU32::new(0);
    static STOPS: AtomicU32 = AtomicU32::new(0);
    fn client(msg: &ContextMessage, _private: usize) -> bool {
        match msg.kind() {
            MessageKind::StartClient => {
                STARTS.fetch_add(1, Ordering::Relaxed);
            }
            MessageKind::StopClient => {
                STOPS.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        true
    }

    let _g = kernel_fixture();
    STARTS.store(0, Ordering::Relaxed);
    STOPS.store(0, Ordering::Relaxed);
    let ctx = make_context(4);
    start_context(ctx);

    let id = ctx.start_client(client, 0).expect("attach");
    assert_eq!(client_count(ctx), 1);
    let msg = ctx.queue.try_recv().expect("start message");
    assert_eq!(msg.kind(), MessageKind::StartClient);
    assert!(ctx.process(msg));
    assert_eq!(STARTS.load(Ordering::Relaxed), 1);

    ctx.stop_client(id);
    let msg = ctx.queue.try_recv().expect("stop message");
    assert!(ctx.process(msg));
    assert_eq!(STOPS.load(Ordering::Relaxed), 1);
    assert_eq!(client_count(ctx), 0);
}

#[test]
fn broadcast_delivers_in_attach_order() {
    static SEEN: AtomicU32 = AtomicU32::new(0);
    fn rec(msg: &ContextMessage, private: usize) -> bool {
        if msg.kind() == MessageKind::User(7) {
            let prev = SEEN.load(Ordering::Relaxed);
            SEEN.store(prev * 10 + private as u32, Ordering::Relaxed);
        }
        true
    }

    let _g = kernel_fixture();
    SEEN.store(0, Ordering::Relaxed);
    let ctx = make_context(8);
    start_context(ctx);

    for private in 1..=3 {
        ctx.start_client(rec, private).expect("attach");
    }
    // Drain the three StartClient messages.
    for _ in 0..3 {
        let msg = ctx.queue.try_recv().unwrap();
        ctx.process(msg);
    }

    assert!(ctx.try_send(ContextMessage::broadcast(7, 0)));
    let msg = ctx.queue.try_recv().unwrap();
    ctx.process(msg);
    assert_eq!(SEEN.load(Ordering::Relaxed), 123);
}

#[test]
fn handler_refusal_is_resumed_behind_traffic() {
    static PHASE: AtomicU32 = AtomicU32::new(0);
    fn stubborn(msg: &ContextMessage, _private: usize) -> bool {
        match msg.kind() {
            MessageKind::User(_) => {
                PHASE.store(1, Ordering::Relaxed);
                false
            }
            MessageKind::ResumeClient => {
                PHASE.store(2, Ordering::Relaxed);
                true
            }
            _ => true,
        }
    }

    let _g = kernel_fixture();
    PHASE.store(0, Ordering::Relaxed);
    let ctx = make_context(4);
    start_context(ctx);

    let id = ctx.start_client(stubborn, 0).expect("attach");
    let msg = ctx.queue.try_recv().unwrap();
    ctx.process(msg);

    assert!(ctx.try_send(ContextMessage::to(id, 3, 0)));
    let msg = ctx.queue.try_recv().unwrap();
    assert!(ctx.process(msg));
    assert_eq!(PHASE.load(Ordering::Relaxed), 1);

    // The refusal turned into a queued ResumeClient.
    let msg = ctx.queue.try_recv().expect("resume message");
    assert_eq!(msg.kind(), MessageKind::ResumeClient);
    assert!(ctx.process(msg));
    assert_eq!(PHASE.load(Ordering::Relaxed), 2);
}

#[test]
fn producer_consumer_through_depth_one_queue() {
    // A producer client pushes 0..=1500 through a depth-1 context queue to
    // a consumer client, suspending itself with `false` whenever the queue
    // is full, and finally broadcasts shutdown.
    static NEXT: AtomicU32 = AtomicU32::new(0);
    static RECEIVED: AtomicU32 = AtomicU32::new(0);
    static STOPS: AtomicU32 = AtomicU32::new(0);
    static CONSUMER: AtomicU16 = AtomicU16::new(0);
    static CTX: AtomicUsize = AtomicUsize::new(0);

    fn producer(msg: &ContextMessage, _private: usize) -> bool {
        // SAFETY: the test stores a 'static context before attaching.
        let ctx = unsafe { &*(CTX.load(Ordering::Relaxed) as *const Context) };
        match msg.kind() {
            MessageKind::StartClient | MessageKind::ResumeClient => {
                let consumer = CONSUMER.load(Ordering::Relaxed);
                let mut n = NEXT.load(Ordering::Relaxed);
                while n <= 1500 {
                    if ctx.try_send(ContextMessage::to(consumer, 0, n as usize)) {
                        n += 1;
                        NEXT.store(n, Ordering::Relaxed);
                    } else {
                        return false;
                    }
                }
                ctx.stop()
            }
            MessageKind::StopClient => {
                STOPS.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => true,
        }
    }

    fn consumer(msg: &ContextMessage, _private: usize) -> bool {
        match msg.kind() {
            MessageKind::User(0) => {
                let expected = RECEIVED.load(Ordering::Relaxed);
                assert_eq!(msg.data(), expected as usize);
                RECEIVED.store(expected + 1, Ordering::Relaxed);
                true
            }
            MessageKind::StopClient => {
                STOPS.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => true,
        }
    }

    let _g = kernel_fixture();
    NEXT.store(0, Ordering::Relaxed);
    RECEIVED.store(0, Ordering::Relaxed);
    STOPS.store(0, Ordering::Relaxed);

    let ctx = make_context(1);
    start_context(ctx);
    CTX.store(ctx as *const Context as usize, Ordering::Relaxed);

    let consumer_id = ctx.start_client(consumer, 0).expect("consumer");
    CONSUMER.store(consumer_id, Ordering::Relaxed);
    // Depth-1 queue: deliver the consumer's StartClient before attaching
    // the producer so its StartClient fits.
    let msg = ctx.queue.try_recv().unwrap();
    ctx.process(msg);
    ctx.start_client(producer, 0).expect("producer");

    assert!(pump_until_stopped(ctx, 20_000), "context stalled or ran away");

    assert_eq!(RECEIVED.load(Ordering::Relaxed), 1501);
    assert_eq!(STOPS.load(Ordering::Relaxed), 2);
    assert_eq!(client_count(ctx), 0);
    assert!(ctx.queue.try_recv().is_none());
}

#[test]
fn messages_behind_stop_context_are_discarded() {
    static USERS: AtomicU32 = AtomicU32::new(0);
    fn sink(msg: &ContextMessage, _private: usize) -> bool {
        if matches!(msg.kind(), MessageKind::User(_)) {
            USERS.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    let _g = kernel_fixture();
    USERS.store(0, Ordering::Relaxed);
    let ctx = make_context(8);
    start_context(ctx);

    ctx.start_client(sink, 0).expect("attach");
    let msg = ctx.queue.try_recv().unwrap();
    ctx.process(msg);

    assert!(ctx.stop());
    assert!(ctx.try_send(ContextMessage::broadcast(1, 0)));
    assert!(ctx.try_send(ContextMessage::broadcast(2, 0)));

    // The loop exits at StopContext and discards the rest unseen.
    assert!(pump_until_stopped(ctx, 10));
    while ctx.queue.try_recv().is_some() {}
    assert_eq!(USERS.load(Ordering::Relaxed), 0);
}

#[test]
fn context_timer_delivers_through_the_queue() {
    let _g = kernel_fixture();
    let ctx = make_context(4);
    start_context(ctx);

    let timer: &'static ContextTimer = Box::leak(Box::new(ContextTimer::new()));
    assert!(timer.start(ctx, 5, ContextMessage::broadcast(42, 77)));

    advance_tick_count(4);
    assert!(ctx.queue.try_recv().is_none());
    advance_tick_count(1);
    let msg = ctx.queue.try_recv().expect("timer message");
    assert_eq!(msg.kind(), MessageKind::User(42));
    assert_eq!(msg.data(), 77);

    // One-shot: no further deliveries.
    advance_tick_count(50);
    assert!(ctx.queue.try_recv().is_none());
}
