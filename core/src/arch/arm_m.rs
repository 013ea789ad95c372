//! Cortex-M port (ARMv7-M and later).
//!
//! # Context switching
//!
//! The scheduler runs exclusively inside PendSV, the lowest-priority
//! exception. Anything that wants a reschedule pends it and issues a
//! barrier; when no other handler is active the switch exception runs,
//! saves the software frame (r4–r11 plus EXC_RETURN, and the high FP
//! registers when the frame is extended) onto the outgoing process stack,
//! calls [`crate::sched::scheduler_entry`] with the outgoing PSP, and
//! restores the incoming thread from the PSP it returns.
//!
//! # Tick
//!
//! SysTick is a 24-bit down-counter. In normal operation it reloads every
//! tick and the handler advances kernel time. During tickless idle the
//! counter is re-programmed for a multi-tick span; the handler then only
//! latches "expired" and the idle thread reconciles elapsed time when it
//! wakes (see [`tickless_end`]).
//!
//! Exception priorities: PendSV and SysTick sit at the lowest priority so
//! kernel entry never preempts an application ISR; fault handlers sit at
//! the highest configurable priority so faults inside the kernel are still
//! taken.

use core::sync::atomic::{AtomicBool, Ordering};

use cortex_m::peripheral::{DCB, DWT, SCB, SYST};

use crate::fault::{FaultRegs, fault_report};
use crate::sched;

use cortex_m_rt as _;

const SYST_CSR_ENABLE: u32 = 1 << 0;
const SYST_CSR_TICKINT: u32 = 1 << 1;
const SYST_CSR_CLKSOURCE: u32 = 1 << 2;
const SYST_CSR_COUNTFLAG: u32 = 1 << 16;
const SYST_MAX_RELOAD: u32 = 0x00FF_FFFF;

const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
const PENDSVSET: u32 = 1 << 28;

/// True while the idle thread has the tick re-programmed for a multi-tick
/// sleep; the SysTick handler must not advance kernel time then.
static TICKLESS: AtomicBool = AtomicBool::new(false);
static TICKLESS_EXPIRED: AtomicBool = AtomicBool::new(false);

/// One-time hardware setup: exception priorities, fault enables, cycle
/// counter, periodic tick. Called by `kernel_start` before the first thread
/// is launched; the board must have clocks configured by then.
pub fn port_init() {
    // SAFETY: writes architectural system-control registers during single
    // threaded bring-up; we only lower exception priorities and enable
    // counters.
    unsafe {
        let scb = &*SCB::ptr();
        // Mem/bus/usage faults at highest configurable priority...
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // ...and enabled as separate vectors.
        scb.shcsr.modify(|v| v | 0b111 << 16);
        // PendSV and SysTick at the lowest priority.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Cycle counter for get-cycle-count and microsecond delays.
        let dcb = &*DCB::ptr();
        dcb.demcr.modify(|v| v | 1 << 24); // TRCENA
        let dwt = &*DWT::ptr();
        dwt.cyccnt.write(0);
        dwt.ctrl.modify(|v| v | 1); // CYCCNTENA
    }
    tick_rearm_periodic();
}

/// Pend the context-switch exception. Takes effect when the current
/// handler (if any) returns; from thread context, after the barrier.
#[inline]
pub fn pend_context_switch() {
    // SAFETY: ICSR is write-1-to-set; setting PENDSVSET is always benign.
    unsafe {
        core::ptr::write_volatile(ICSR, PENDSVSET);
    }
    ternos_lib::cpu::barrier();
}

// ---------------------------------------------------------------------------
// Thread stacks
// ---------------------------------------------------------------------------

/// Software-saved frame: r4-r11 + EXC_RETURN.
const SW_FRAME_BYTES: usize = 9 * 4;
/// Hardware-stacked frame: r0-r3, r12, lr, pc, xPSR.
const HW_FRAME_BYTES: usize = 8 * 4;

/// EXC_RETURN: return to thread mode, PSP, standard (non-FP) frame. The
/// lazy FP machinery switches a thread to the extended value on its own
/// the first time it touches the FPU.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Thumb bit in the EPSR.
const INITIAL_XPSR: u32 = 1 << 24;

/// Build the synthetic exception pair (hardware frame + software frame) a
/// fresh thread resumes from, and return its initial stack pointer.
pub fn init_stack(stack: &mut [u8], trampoline: usize, guard: usize, arg: usize) -> usize {
    // AAPCS requires 8-byte stack alignment at the frame.
    let top = (stack.as_ptr() as usize + stack.len()) & !7;
    let hw = top - HW_FRAME_BYTES;
    let sw = hw - SW_FRAME_BYTES;

    // SAFETY: the span [sw, top) lies inside the caller's stack slice.
    unsafe {
        let f = hw as *mut u32;
        f.write(arg as u32); // r0
        f.add(1).write(0); // r1
        f.add(2).write(0); // r2
        f.add(3).write(0); // r3
        f.add(4).write(0); // r12
        f.add(5).write(guard as u32 | 1); // lr: trap a stray return
        f.add(6).write(trampoline as u32 | 1); // pc, thumb
        f.add(7).write(INITIAL_XPSR); // xPSR

        let s = sw as *mut u32;
        for i in 0..8 {
            s.add(i).write(0); // r4-r11
        }
        s.add(8).write(EXC_RETURN_THREAD_PSP);
    }
    sw
}

/// Launch the first thread: adopt its stack as the process stack and
/// manually unwind the synthetic hardware frame into thread mode.
pub fn start_first_thread(sp: usize) -> ! {
    // SAFETY: `sp` points at a frame built by `init_stack`; after CONTROL
    // selects PSP the pops consume the hardware frame and branch into the
    // thread's entry trampoline. Never returns.
    unsafe {
        core::arch::asm!(
            "adds r0, #36",        // skip the software frame
            "msr psp, r0",
            "movs r0, #2",         // CONTROL.SPSEL = 1: thread mode uses PSP
            "msr control, r0",
            "isb",
            "pop {{r0-r3, r12}}",
            "pop {{r4}}",          // lr slot (return guard)
            "pop {{r5}}",          // pc (trampoline)
            "pop {{r6}}",          // xPSR (rebuilt by hardware)
            "mov lr, r4",
            "cpsie i",
            "bx r5",
            in("r0") sp,
            options(noreturn),
        )
    }
}

// The context-switch exception itself. Hardware has already stacked the
// caller-saved half onto the PSP; we stack the callee-saved half (plus the
// high FP registers when the outgoing frame is extended), let the scheduler
// pick, and unstack symmetrically.
#[cfg(target_abi = "eabihf")]
core::arch::global_asm!(
    ".syntax unified",
    ".global PendSV",
    ".type PendSV, %function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl {sched}",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psp, r0",
    "    bx lr",
    sched = sym sched::scheduler_entry,
);

#[cfg(not(target_abi = "eabihf"))]
core::arch::global_asm!(
    ".syntax unified",
    ".global PendSV",
    ".type PendSV, %function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl {sched}",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    msr psp, r0",
    "    bx lr",
    sched = sym sched::scheduler_entry,
);

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
extern "C" fn SysTick() {
    if TICKLESS.load(Ordering::Acquire) {
        // Idle owns the counter; just latch the expiry for reconciliation.
        TICKLESS_EXPIRED.store(true, Ordering::Release);
        return;
    }
    sched::kernel_tick();
}

pub fn tick_stop() {
    // SAFETY: clearing the enable bit only pauses the counter.
    unsafe {
        (*SYST::ptr()).csr.modify(|v| v & !SYST_CSR_ENABLE);
    }
}

/// Arm the normal one-tick period and start counting.
pub fn tick_rearm_periodic() {
    let reload = sched::clock_cycles_per_tick().saturating_sub(1).min(SYST_MAX_RELOAD);
    // SAFETY: reprogramming SysTick with a bounded reload.
    unsafe {
        let syst = &*SYST::ptr();
        syst.rvr.write(reload);
        syst.cvr.write(0);
        syst.csr
            .write(SYST_CSR_ENABLE | SYST_CSR_TICKINT | SYST_CSR_CLKSOURCE);
    }
}

/// Longest tickless span the 24-bit down-counter can time.
pub fn max_sleep_ticks() -> u32 {
    (SYST_MAX_RELOAD / sched::clock_cycles_per_tick()).max(1)
}

/// Re-program the counter for a multi-tick sleep. Interrupts must be
/// disabled; the handler stays armed so the expiry can end a WFI.
pub fn tickless_begin(span_ticks: u32) {
    let cpt = sched::clock_cycles_per_tick();
    let reload = span_ticks
        .saturating_mul(cpt)
        .saturating_sub(1)
        .min(SYST_MAX_RELOAD);
    TICKLESS_EXPIRED.store(false, Ordering::Release);
    TICKLESS.store(true, Ordering::Release);
    // SAFETY: reprogramming SysTick for the sleep window.
    unsafe {
        let syst = &*SYST::ptr();
        syst.rvr.write(reload);
        syst.cvr.write(0);
        syst.csr
            .write(SYST_CSR_ENABLE | SYST_CSR_TICKINT | SYST_CSR_CLKSOURCE);
    }
}

/// End the tickless window and return how many ticks actually elapsed,
/// splitting the rolled-over case (the full span passed, possibly latched
/// by the handler) from the woke-early case (derive elapsed time from the
/// remaining count). Re-arms the one-tick period before returning.
pub fn tickless_end(span_ticks: u32) -> u32 {
    let cpt = sched::clock_cycles_per_tick();

    // Reading CSR clears COUNTFLAG, so fold it into the latched expiry.
    // SAFETY: register reads.
    let (csr, remaining) = unsafe {
        let syst = &*SYST::ptr();
        (syst.csr.read(), syst.cvr.read())
    };
    let rolled = TICKLESS_EXPIRED.swap(false, Ordering::AcqRel) || csr & SYST_CSR_COUNTFLAG != 0;
    TICKLESS.store(false, Ordering::Release);

    let elapsed = if rolled {
        span_ticks
    } else {
        let slept_cycles = span_ticks.saturating_mul(cpt).saturating_sub(remaining);
        (slept_cycles / cpt).min(span_ticks)
    };

    tick_rearm_periodic();
    elapsed
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

pub fn wait_for_event() {
    cortex_m::asm::wfe();
}

// ---------------------------------------------------------------------------
// Fault vectors
// ---------------------------------------------------------------------------

fn read_fault_regs() -> FaultRegs {
    let psp = cortex_m::register::psp::read();
    // SAFETY: reads the hardware-stacked frame at the faulting thread's PSP
    // and the architectural fault status registers.
    unsafe {
        let f = psp as *const u32;
        let scb = &*SCB::ptr();
        FaultRegs {
            r0: f.read(),
            r1: f.add(1).read(),
            r2: f.add(2).read(),
            r3: f.add(3).read(),
            r12: f.add(4).read(),
            lr: f.add(5).read(),
            pc: f.add(6).read(),
            xpsr: f.add(7).read(),
            sp: psp,
            cfsr: scb.cfsr.read(),
            hfsr: scb.hfsr.read(),
            mmfar: scb.mmfar.read(),
            bfar: scb.bfar.read(),
        }
    }
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
extern "C" fn MemoryManagement() {
    fault_report(&read_fault_regs(), !sched::is_started());
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
extern "C" fn BusFault() {
    fault_report(&read_fault_regs(), !sched::is_started());
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
extern "C" fn UsageFault() {
    fault_report(&read_fault_regs(), !sched::is_started());
}
