#![no_std]

#[cfg(test)]
extern crate std;

pub mod alignment;
pub mod cpu;
pub mod klog;
pub mod list;
pub mod numfmt;
pub mod spinlock;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u32, align_down_usize, align_up_u32, align_up_usize};
pub use alignment::{align_down_usize as align_down, align_up_usize as align_up};
pub use klog::{
    KlogLevel, KlogSink, klog_get_level, klog_init, klog_is_enabled, klog_register_sink,
    klog_set_level,
};
pub use list::{IndexList, Link, LinkArena, ListIter, NO_NODE};
pub use numfmt::NumBuf;
pub use spinlock::{IrqMutex, IrqMutexGuard};
