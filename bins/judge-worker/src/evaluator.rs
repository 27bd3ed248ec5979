/// Test Evaluator - Classification and Scoring
///
/// **Core Responsibility:**
/// Turn raw sandbox outcomes and captured output into per-case statuses,
/// then fold them into the submission verdict and score.
///
/// **Critical Properties:**
/// - Knows nothing about namespaces, cgroups or ptrace
/// - Knows nothing about the message bus
/// - Pure functions: (outcome, output, expected) → status
///
/// **Normalization Rules (applied to both sides, comparison only):**
/// - `\r\n` → `\n`
/// - Trailing whitespace at the end of the output is ignored
/// - Leading and internal whitespace is significant
/// - Case sensitive, no float tolerance
///
/// **Aggregation priority:**
/// system_error > runtime_error > time_limit_exceeded > memory_limit_exceeded
/// > output_limit_exceeded > wrong_answer > accepted. No cases → system_error.

use judge_common::types::{CaseStatus, TestCase, TestCaseResult, Verdict};

use crate::sandbox::{ExecStatus, ExecutionOutcome};

/// Normalize output for comparison
pub fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n").trim_end().to_string()
}

/// Compare program output with the expected answer
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Map a sandbox status to a case status. `None` means the program ran
/// cleanly and its output still has to be compared.
pub fn classify(status: ExecStatus) -> Option<CaseStatus> {
    match status {
        ExecStatus::Accepted => None,
        ExecStatus::TimeLimitExceeded => Some(CaseStatus::TimeLimitExceeded),
        ExecStatus::MemoryLimitExceeded => Some(CaseStatus::MemoryLimitExceeded),
        ExecStatus::OutputLimitExceeded => Some(CaseStatus::OutputLimitExceeded),
        // a compile failure while running a case means the binary could not start
        ExecStatus::RuntimeError | ExecStatus::CompileError => Some(CaseStatus::RuntimeError),
        ExecStatus::SystemError => Some(CaseStatus::SystemError),
    }
}

/// Evaluate one executed test case
///
/// `time_used` is CPU time; a time limit verdict reports at least the
/// adjusted limit so the figure never looks like it fit.
pub fn evaluate_case(
    outcome: &ExecutionOutcome,
    case: &TestCase,
    stdout: String,
    stderr: String,
    adjusted_time_ms: u64,
) -> TestCaseResult {
    let status = classify(outcome.status).unwrap_or_else(|| {
        if outputs_match(&stdout, &case.expected_output) {
            CaseStatus::Accepted
        } else {
            CaseStatus::WrongAnswer
        }
    });

    let time_used = if status == CaseStatus::TimeLimitExceeded {
        outcome.cpu_time_ms.max(adjusted_time_ms)
    } else {
        outcome.cpu_time_ms
    };

    TestCaseResult {
        case_id: case.case_id,
        status,
        time_used,
        memory_used: outcome.memory_kb,
        output: stdout,
        error_output: stderr,
        expected_output: case.expected_output.clone(),
    }
}

/// Result for a case the sandbox could not run at all
pub fn system_error_case(case: &TestCase, message: String) -> TestCaseResult {
    TestCaseResult {
        case_id: case.case_id,
        status: CaseStatus::SystemError,
        time_used: 0,
        memory_used: 0,
        output: String::new(),
        error_output: message,
        expected_output: case.expected_output.clone(),
    }
}

fn severity(status: CaseStatus) -> u8 {
    match status {
        CaseStatus::SystemError => 6,
        CaseStatus::RuntimeError => 5,
        CaseStatus::TimeLimitExceeded => 4,
        CaseStatus::MemoryLimitExceeded => 3,
        CaseStatus::OutputLimitExceeded => 2,
        CaseStatus::WrongAnswer => 1,
        CaseStatus::Accepted => 0,
    }
}

/// Fold per-case statuses into the submission verdict
pub fn aggregate(results: &[TestCaseResult]) -> Verdict {
    results
        .iter()
        .map(|r| r.status)
        .max_by_key(|status| severity(*status))
        .map(Verdict::from)
        .unwrap_or(Verdict::SystemError)
}

/// Even weight per case: floor(100 × accepted / total)
pub fn score(results: &[TestCaseResult], total_cases: usize) -> u32 {
    if total_cases == 0 {
        return 0;
    }
    let accepted = results
        .iter()
        .filter(|r| r.status == CaseStatus::Accepted)
        .count();
    (100 * accepted / total_cases) as u32
}
