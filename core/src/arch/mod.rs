//! Architecture ports.
//!
//! The kernel proper is portable; everything that touches a register lives
//! behind this module's API:
//!
//! - context-switch plumbing: [`pend_context_switch`], stack frame
//!   construction, and first-thread launch;
//! - system-tick control, including the tickless window used by the idle
//!   thread;
//! - the low-power wait instructions.
//!
//! The Cortex-M port (`arm_m`) is selected when building for `arm`/`none`
//! targets and requires ARMv7-M or later. Every other target
//! gets the hosted port: logically-equivalent stubs that let the kernel's
//! state machines run under host unit tests (no real context switching, but
//! every queue, list, and decision path is live).

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod arm_m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use arm_m::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted::*;
