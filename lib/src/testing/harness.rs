//! Test harness types: suite descriptors, per-suite results, run summary.

/// Result of executing a single test suite.
#[derive(Clone, Copy, Debug)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub elapsed_cycles: u32,
}

/// A registered suite: its name and entry point.
#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: &'static str,
    pub run: fn() -> TestSuiteResult,
}

/// Aggregate outcome of a full run.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestRunSummary {
    pub suites: u32,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestRunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Convert a cycle delta to milliseconds given the core clock in kHz.
pub fn cycles_to_ms(cycles: u32, cycles_per_ms: u32) -> u32 {
    if cycles_per_ms == 0 {
        return 0;
    }
    cycles / cycles_per_ms
}

/// Run every suite in `suites`, logging per-suite lines and returning the
/// aggregate summary.
pub fn run_suites(suites: &[TestSuiteDesc]) -> TestRunSummary {
    let mut summary = TestRunSummary::default();
    for desc in suites {
        crate::klog_info!("SUITE {}: starting", desc.name);
        let result = (desc.run)();
        crate::klog_info!(
            "SUITE {}: {}/{} passed",
            result.name,
            result.passed,
            result.total
        );
        summary.suites += 1;
        summary.total += result.total;
        summary.passed += result.passed;
        summary.failed += result.failed;
    }
    summary
}
