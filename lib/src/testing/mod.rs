//! In-kernel test support.
//!
//! Kernel subsystems keep their hardware-dependent suites in dedicated
//! `*_tests.rs` files compiled behind the `builtin-tests` feature; a board
//! test image calls the generated `run_*_suite` functions and reports the
//! [`TestRunSummary`]. Pure logic is tested with ordinary `#[cfg(test)]`
//! modules on the host instead — this harness is for what needs real
//! threads and a real tick.

pub mod harness;

mod assertions;

pub use harness::{TestRunSummary, TestSuiteDesc, TestSuiteResult, cycles_to_ms, run_suites};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

/// Run one test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => crate::klog_debug!("TEST PASS: {}", name),
        TestResult::Skipped => crate::klog_debug!("TEST SKIP: {}", name),
        TestResult::Fail => crate::klog_error!("TEST FAIL: {}", name),
    }
    result
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_error!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_error!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

/// Define a named suite from a list of `fn() -> TestResult` functions.
///
/// Generates `run_<name>_suite()` plus a `<NAME>_SUITE` descriptor for use
/// with [`run_suites`].
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::TestSuiteResult {
                let start = $crate::cpu::cycle_count();
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                let elapsed_cycles = $crate::cpu::cycle_count().wrapping_sub(start);
                $crate::testing::TestSuiteResult {
                    name: stringify!($suite_name),
                    total,
                    passed,
                    failed: total.saturating_sub(passed),
                    elapsed_cycles,
                }
            }

            pub static [<$suite_name:upper _SUITE>]: $crate::testing::TestSuiteDesc =
                $crate::testing::TestSuiteDesc {
                    name: stringify!($suite_name),
                    run: [<run_ $suite_name _suite>],
                };
        }
    };
}
