//! Ternos shared ABI types.
//!
//! This crate provides the canonical definitions for the types and constants
//! shared between kernel subsystems and application code. Having a single
//! source of truth eliminates duplicate definitions and mismatched constants
//! between crates.
//!
//! Everything here is plain data: no statics, no unsafe, no dependencies.

#![no_std]
#![forbid(unsafe_code)]

pub mod thread;

pub use thread::{
    DEFAULT_TICK_HZ, IDLE_PRIORITY, INVALID_THREAD_ID, MAX_CONTEXT_CLIENTS, MAX_PRIORITIES,
    MAX_THREADS, MAX_TIMERS, MIN_STACK_SIZE, STACK_FILL_BYTE, ThreadEntry, ThreadId, ThreadState,
};
