//! Kernel assertions and fault reporting.
//!
//! Programmer errors (API misuse, invariant violations) funnel through
//! [`kassert!`]: the failure is logged, the registered crash hook fires (if
//! any), and the running thread is forced into its termination path. The
//! kernel itself keeps going.
//!
//! Unrecoverable hardware faults (bus, memory, usage) arrive from the port's
//! fault vectors as a [`FaultRegs`] snapshot. The dump avoids `core::fmt`
//! for the register values — a fault handler cannot assume a healthy stack,
//! so the line is assembled with the stack-only formatters and pushed
//! straight at the log sink. Afterwards the kernel either halts or kills the
//! offending thread, per [`FaultPolicy`].

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use ternos_lib::{NumBuf, klog_error};

use crate::hooks;
use crate::sched;

// ---------------------------------------------------------------------------
// Assertions
// ---------------------------------------------------------------------------

/// Kernel assertion. On failure: log, fire the crash hook, and transition
/// the running thread to its termination path.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {{
        if !$cond {
            $crate::fault::assert_failed(stringify!($cond), file!(), line!());
        }
    }};
    ($cond:expr, $msg:expr) => {{
        if !$cond {
            $crate::fault::assert_failed($msg, file!(), line!());
        }
    }};
}

/// Out-of-line assertion failure path. Public for the macro only.
pub fn assert_failed(what: &str, file: &str, line: u32) {
    klog_error!("ASSERT: {} at {}:{}", what, file, line);
    hooks::crash();
    sched::terminate_running_thread();
}

// ---------------------------------------------------------------------------
// Fault policy
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Dump and halt the system.
    Halt = 0,
    /// Dump, then kill the running thread and keep scheduling (only
    /// possible for faults taken from thread context).
    KillThread = 1,
}

static POLICY: AtomicU8 = AtomicU8::new(FaultPolicy::Halt as u8);

pub fn set_fault_policy(policy: FaultPolicy) {
    POLICY.store(policy as u8, Ordering::Relaxed);
}

pub fn fault_policy() -> FaultPolicy {
    match POLICY.load(Ordering::Relaxed) {
        1 => FaultPolicy::KillThread,
        _ => FaultPolicy::Halt,
    }
}

// ---------------------------------------------------------------------------
// Fault status decoding
// ---------------------------------------------------------------------------

bitflags! {
    /// Configurable Fault Status Register bits (memory, bus, and usage
    /// fault groups merged, as the hardware lays them out).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        const IACCVIOL   = 1 << 0;
        const DACCVIOL   = 1 << 1;
        const MUNSTKERR  = 1 << 3;
        const MSTKERR    = 1 << 4;
        const MMARVALID  = 1 << 7;
        const IBUSERR    = 1 << 8;
        const PRECISERR  = 1 << 9;
        const IMPRECISERR = 1 << 10;
        const UNSTKERR   = 1 << 11;
        const STKERR     = 1 << 12;
        const BFARVALID  = 1 << 15;
        const UNDEFINSTR = 1 << 16;
        const INVSTATE   = 1 << 17;
        const INVPC      = 1 << 18;
        const NOCP       = 1 << 19;
        const UNALIGNED  = 1 << 24;
        const DIVBYZERO  = 1 << 25;
    }
}

impl FaultStatus {
    /// Human-readable name of the most significant cause present.
    pub fn describe(self) -> &'static str {
        if self.contains(Self::DIVBYZERO) {
            "divide by zero"
        } else if self.contains(Self::UNALIGNED) {
            "unaligned access"
        } else if self.contains(Self::UNDEFINSTR) {
            "undefined instruction"
        } else if self.contains(Self::INVSTATE) {
            "invalid state"
        } else if self.contains(Self::INVPC) {
            "invalid PC"
        } else if self.contains(Self::NOCP) {
            "coprocessor denied"
        } else if self.intersects(Self::IBUSERR | Self::PRECISERR | Self::IMPRECISERR) {
            "bus error"
        } else if self.intersects(Self::STKERR | Self::UNSTKERR | Self::MSTKERR | Self::MUNSTKERR)
        {
            "stacking error"
        } else if self.intersects(Self::IACCVIOL | Self::DACCVIOL) {
            "memory access violation"
        } else {
            "fault"
        }
    }
}

// ---------------------------------------------------------------------------
// Fault dump
// ---------------------------------------------------------------------------

/// Register snapshot captured by the fault vector: the hardware-stacked
/// frame plus the status registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct FaultRegs {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
    pub sp: u32,
    pub cfsr: u32,
    pub hfsr: u32,
    pub mmfar: u32,
    pub bfar: u32,
}

fn hex(buf: &mut NumBuf, value: u32) -> &str {
    // SAFETY: the formatter emits ASCII only.
    unsafe { core::str::from_utf8_unchecked(buf.u32_hex(value)) }
}

fn dump_pair(a: &'static str, av: u32, b: &'static str, bv: u32) {
    let mut ba = NumBuf::new();
    let mut bb = NumBuf::new();
    klog_error!("  {}={} {}={}", a, hex(&mut ba, av), b, hex(&mut bb, bv));
}

/// Dump a fault and resolve it per the configured policy.
///
/// `from_isr` must be true when the fault was taken from handler context or
/// before the scheduler started; those faults always halt, because there is
/// no thread to kill.
pub fn fault_report(regs: &FaultRegs, from_isr: bool) -> ! {
    let status = FaultStatus::from_bits_truncate(regs.cfsr);
    klog_error!("FAULT: {}", status.describe());
    dump_pair("r0", regs.r0, "r1", regs.r1);
    dump_pair("r2", regs.r2, "r3", regs.r3);
    dump_pair("r12", regs.r12, "lr", regs.lr);
    dump_pair("pc", regs.pc, "psr", regs.xpsr);
    dump_pair("sp", regs.sp, "cfsr", regs.cfsr);
    dump_pair("hfsr", regs.hfsr, "mmfar", regs.mmfar);
    dump_pair("bfar", regs.bfar, "thread", sched::current_thread() as u32);

    if !from_isr && fault_policy() == FaultPolicy::KillThread {
        sched::terminate_running_thread();
        // The pended switch fires once the fault handler unwinds; spin until
        // it takes us out.
        loop {
            crate::arch::wait_for_event();
        }
    }

    loop {
        crate::arch::wait_for_event();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfsr_decoding_prefers_specific_causes() {
        let s = FaultStatus::DIVBYZERO | FaultStatus::DACCVIOL;
        assert_eq!(s.describe(), "divide by zero");
        assert_eq!(FaultStatus::PRECISERR.describe(), "bus error");
        assert_eq!(FaultStatus::DACCVIOL.describe(), "memory access violation");
        assert_eq!(FaultStatus::empty().describe(), "fault");
    }

    #[test]
    fn policy_round_trip() {
        set_fault_policy(FaultPolicy::KillThread);
        assert_eq!(fault_policy(), FaultPolicy::KillThread);
        set_fault_policy(FaultPolicy::Halt);
        assert_eq!(fault_policy(), FaultPolicy::Halt);
    }
}
