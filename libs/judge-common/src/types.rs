use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest scheduling class (normal submissions)
pub const PRIORITY_NORMAL: u8 = 3;
/// Highest scheduling class (contest submissions)
pub const PRIORITY_CONTEST: u8 = 1;

fn default_priority() -> u8 {
    PRIORITY_NORMAL
}

/// Lifecycle state of a judge task inside a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    SystemError,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Accepted => "accepted",
            CaseStatus::WrongAnswer => "wrong_answer",
            CaseStatus::TimeLimitExceeded => "time_limit_exceeded",
            CaseStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            CaseStatus::OutputLimitExceeded => "output_limit_exceeded",
            CaseStatus::RuntimeError => "runtime_error",
            CaseStatus::SystemError => "system_error",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict of a submission across all of its test cases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    CompileError,
    SystemError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::OutputLimitExceeded => "output_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::CompileError => "compile_error",
            Verdict::SystemError => "system_error",
        }
    }
}

impl From<CaseStatus> for Verdict {
    fn from(status: CaseStatus) -> Self {
        match status {
            CaseStatus::Accepted => Verdict::Accepted,
            CaseStatus::WrongAnswer => Verdict::WrongAnswer,
            CaseStatus::TimeLimitExceeded => Verdict::TimeLimitExceeded,
            CaseStatus::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
            CaseStatus::OutputLimitExceeded => Verdict::OutputLimitExceeded,
            CaseStatus::RuntimeError => Verdict::RuntimeError,
            CaseStatus::SystemError => Verdict::SystemError,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One test case of a problem.
///
/// `time_limit_ms` and `memory_limit_mb` are per-case overrides; 0 means
/// "use the task defaults".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub case_id: u32,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub time_limit_ms: u64,
    #[serde(default)]
    pub memory_limit_mb: u64,
}

/// Message consumed from the `judge_task` stream.
///
/// Test cases and limits are optional: the problem service is the
/// authority for both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeTaskMessage {
    pub submission_id: i64,
    pub problem_id: i64,
    pub user_id: i64,
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cases: Option<Vec<TestCase>>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Problem metadata returned by the problem service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetail {
    pub problem_id: i64,
    #[serde(default)]
    pub title: String,
    /// Milliseconds
    pub time_limit: u64,
    /// Megabytes
    pub memory_limit: u64,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub case_id: u32,
    pub status: CaseStatus,
    /// Milliseconds of CPU time
    pub time_used: u64,
    /// Kilobytes of peak resident memory
    pub memory_used: u64,
    pub output: String,
    pub error_output: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileInfo {
    pub success: bool,
    pub message: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeMeta {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub language_version: String,
}

/// Complete outcome of judging one submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub submission_id: i64,
    pub status: Verdict,
    pub score: u32,
    pub time_used: u64,
    pub memory_used: u64,
    pub compile_info: CompileInfo,
    pub test_cases: Vec<TestCaseResult>,
    pub meta: JudgeMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JudgeResult {
    /// A result carrying no test cases, used for failures that happen
    /// before or instead of running the program
    pub fn system_error(
        submission_id: i64,
        node_id: &str,
        language_version: &str,
        message: impl Into<String>,
    ) -> Self {
        JudgeResult {
            submission_id,
            status: Verdict::SystemError,
            score: 0,
            time_used: 0,
            memory_used: 0,
            compile_info: CompileInfo::default(),
            test_cases: vec![],
            meta: JudgeMeta {
                node_id: node_id.to_string(),
                timestamp: Utc::now(),
                language_version: language_version.to_string(),
            },
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBody {
    pub verdict: Verdict,
    pub score: u32,
    pub time_used: u64,
    pub memory_used: u64,
    pub test_cases: Vec<TestCaseResult>,
}

/// Payload produced on the `judge_result` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub submission_id: i64,
    pub status: Verdict,
    pub result: ResultBody,
    pub compile_info: CompileInfo,
    pub judge_info: JudgeMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&JudgeResult> for ResultMessage {
    fn from(result: &JudgeResult) -> Self {
        ResultMessage {
            submission_id: result.submission_id,
            status: result.status,
            result: ResultBody {
                verdict: result.status,
                score: result.score,
                time_used: result.time_used,
                memory_used: result.memory_used,
                test_cases: result.test_cases.clone(),
            },
            compile_info: result.compile_info.clone(),
            judge_info: result.meta.clone(),
            message: result.message.clone(),
            timestamp: result.meta.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current_test_case: u32,
    pub total_test_cases: u32,
}

/// Payload produced on the `status_update` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub submission_id: i64,
    pub status: TaskState,
    pub progress: Progress,
    pub timestamp: DateTime<Utc>,
}

/// Payload produced on the `dead_letter` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_message: String,
    pub error: String,
    pub topic: String,
    pub partition: i32,
    pub offset: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_message_defaults() {
        let raw = r#"{
            "submission_id": 42,
            "problem_id": 7,
            "user_id": 3,
            "language": "cpp",
            "code": "int main(){}"
        }"#;
        let msg: JudgeTaskMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.priority, PRIORITY_NORMAL);
        assert!(msg.test_cases.is_none());
        assert!(msg.time_limit.is_none());
    }

    #[test]
    fn test_status_strings_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&CaseStatus::TimeLimitExceeded).unwrap(),
            "\"time_limit_exceeded\""
        );
        assert_eq!(
            serde_json::to_string(&Verdict::CompileError).unwrap(),
            "\"compile_error\""
        );
        assert_eq!(serde_json::to_string(&TaskState::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(Verdict::from(CaseStatus::WrongAnswer), Verdict::WrongAnswer);
    }

    #[test]
    fn test_result_message_shape() {
        let result = JudgeResult::system_error(9, "node-a", "g++ 13", "invalid time limit");
        let msg = ResultMessage::from(&result);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["submission_id"], 9);
        assert_eq!(value["status"], "system_error");
        assert_eq!(value["result"]["verdict"], "system_error");
        assert_eq!(value["result"]["score"], 0);
        assert_eq!(value["message"], "invalid time limit");
        assert!(value["timestamp"].is_string());
        assert!(value["compile_info"].is_object());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }
}
