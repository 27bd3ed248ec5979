/// Verdict Engine - Drives One Task End to End
///
/// **Core Responsibility:**
/// validate → work dir → compile → run each case in order → aggregate.
///
/// **Critical Architectural Boundary:**
/// - Engine knows the ORDER of steps and the limits of each step
/// - Process isolation lives behind the `Executor` trait
/// - Status classification and scoring live in the evaluator
///
/// **Failure handling:**
/// - Validation failures are a `system_error` result, never retried
/// - A sandbox setup failure while compiling fails the task (retried by
///   the scheduler); while running a case it is that case's `system_error`
/// - Cancellation is checked between cases; inside a case the sandbox
///   kills the child
/// - The first non-accepted case stops the run
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use judge_common::config::{JudgeConfig, LimitsConfig, SandboxConfig};
use judge_common::language::LanguageRecipe;
use judge_common::types::{CaseStatus, CompileInfo, JudgeMeta, JudgeResult, TestCase, TestCaseResult, Verdict};

use crate::cancel::{CancelReason, CancelToken};
use crate::config::LanguageRegistry;
use crate::evaluator;
use crate::sandbox::{ExecStatus, ExecutionOutcome, Executor, SandboxError, SandboxSpec};
use crate::scheduler::{JudgeTask, TaskContext, TaskProcessor};
use crate::workdir::WorkDir;

const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";
const COMPILE_ERROR_FILE: &str = "compile_error.txt";
const TRUNCATION_MARKER: &str = "\n... (truncated)";
/// Slack between the CPU limit and the wall-clock limit of a case
const WALL_TIME_SLACK_MS: u64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid submission id")]
    SubmissionId,
    #[error("code is empty")]
    EmptyCode,
    #[error("code length exceeds limit")]
    CodeTooLong,
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("no test cases")]
    NoTestCases,
    #[error("invalid time limit")]
    TimeLimit,
    #[error("invalid memory limit")]
    MemoryLimit,
    #[error("code contains a forbidden pattern")]
    ForbiddenPattern,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task deadline exceeded")]
    DeadlineExceeded,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CancelReason> for EngineError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::User => EngineError::Cancelled,
            CancelReason::Deadline => EngineError::DeadlineExceeded,
        }
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), EngineError> {
    match cancel.reason() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

/// Limits of one case after applying overrides and language multipliers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseLimits {
    pub time_ms: u64,
    pub memory_kb: u64,
}

impl CaseLimits {
    pub fn for_case(task: &JudgeTask, case: &TestCase, recipe: &LanguageRecipe) -> Self {
        let time = if case.time_limit_ms > 0 { case.time_limit_ms } else { task.time_limit_ms };
        let memory = if case.memory_limit_mb > 0 { case.memory_limit_mb } else { task.memory_limit_mb };
        CaseLimits {
            time_ms: (time as f64 * recipe.time_multiplier).ceil() as u64,
            memory_kb: (memory as f64 * recipe.memory_multiplier * 1024.0).ceil() as u64,
        }
    }

    pub fn memory_mb(&self) -> u64 {
        (self.memory_kb + 1023) / 1024
    }
}

/// Cut a compiler message at `limit` bytes on a char boundary
pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], TRUNCATION_MARKER)
}

fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

pub struct VerdictEngine {
    node_id: String,
    registry: LanguageRegistry,
    executor: Arc<dyn Executor>,
    limits: LimitsConfig,
    sandbox: SandboxConfig,
    temp_dir: PathBuf,
    forbidden: Vec<Regex>,
}

impl VerdictEngine {
    pub fn new(config: &JudgeConfig, registry: LanguageRegistry, executor: Arc<dyn Executor>) -> Result<Self> {
        let forbidden = config
            .limits
            .forbidden_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid forbidden pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(VerdictEngine {
            node_id: config.node_id.clone(),
            registry,
            executor,
            limits: config.limits.clone(),
            sandbox: config.sandbox.clone(),
            temp_dir: config.paths.temp_dir.clone(),
            forbidden,
        })
    }

    /// Check a task against the node's limits
    pub fn validate(&self, task: &JudgeTask) -> Result<&LanguageRecipe, ValidationError> {
        if task.submission_id <= 0 {
            return Err(ValidationError::SubmissionId);
        }
        if task.code.trim().is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        if task.code.len() > self.limits.max_code_length {
            return Err(ValidationError::CodeTooLong);
        }
        let recipe = self
            .registry
            .get(&task.language)
            .map_err(|e| ValidationError::UnsupportedLanguage(e.0))?;
        if task.test_cases.is_empty() {
            return Err(ValidationError::NoTestCases);
        }
        if task.time_limit_ms == 0 || task.time_limit_ms > self.limits.max_time_limit_ms {
            return Err(ValidationError::TimeLimit);
        }
        if task.memory_limit_mb == 0 || task.memory_limit_mb > self.limits.max_memory_limit_mb {
            return Err(ValidationError::MemoryLimit);
        }
        if self.forbidden.iter().any(|re| re.is_match(&task.code)) {
            return Err(ValidationError::ForbiddenPattern);
        }
        Ok(recipe)
    }

    #[instrument(skip_all, fields(task_id = %task.task_id, submission_id = task.submission_id, language = %task.language))]
    pub async fn judge(&self, task: &JudgeTask, ctx: &TaskContext) -> Result<JudgeResult, EngineError> {
        check_cancel(&ctx.cancel)?;

        let recipe = match self.validate(task) {
            Ok(recipe) => recipe,
            Err(e) => {
                warn!(error = %e, "Task rejected by validation");
                let version = self
                    .registry
                    .get(&task.language)
                    .map(|r| r.version.clone())
                    .unwrap_or_default();
                return Ok(JudgeResult::system_error(task.submission_id, &self.node_id, &version, e.to_string()));
            }
        };

        let work_dir = WorkDir::create(
            &self.temp_dir,
            task.submission_id,
            self.sandbox.jail_uid,
            self.sandbox.jail_gid,
        )?;
        let source_name = recipe.source_file_name();
        work_dir.write_file(&source_name, &task.code)?;

        let compile_info = if recipe.is_compiled {
            self.compile(task, recipe, &work_dir, &ctx.cancel).await?
        } else {
            CompileInfo {
                success: true,
                message: String::new(),
                time_ms: 0,
            }
        };

        if !compile_info.success {
            info!(time_ms = compile_info.time_ms, "Compilation failed");
            return Ok(JudgeResult {
                submission_id: task.submission_id,
                status: Verdict::CompileError,
                score: 0,
                time_used: 0,
                memory_used: 0,
                compile_info,
                test_cases: vec![],
                meta: self.meta(recipe),
                message: None,
            });
        }

        let total = task.test_cases.len();
        let mut results: Vec<TestCaseResult> = Vec::with_capacity(total);
        let mut max_time = 0;
        let mut max_memory = 0;

        for (index, case) in task.test_cases.iter().enumerate() {
            check_cancel(&ctx.cancel)?;
            ctx.progress.set_current(index as u32 + 1);

            let result = self.run_case(task, recipe, case, &work_dir, &ctx.cancel).await?;
            debug!(case_id = case.case_id, status = %result.status, time_ms = result.time_used, memory_kb = result.memory_used, "Case finished");

            max_time = max_time.max(result.time_used);
            max_memory = max_memory.max(result.memory_used);
            let stop = result.status != CaseStatus::Accepted;
            results.push(result);
            if stop {
                break;
            }
        }

        let status = evaluator::aggregate(&results);
        let score = evaluator::score(&results, total);
        info!(verdict = %status, score, cases_run = results.len(), total, "Task judged");

        Ok(JudgeResult {
            submission_id: task.submission_id,
            status,
            score,
            time_used: max_time,
            memory_used: max_memory,
            compile_info,
            test_cases: results,
            meta: self.meta(recipe),
            message: None,
        })
    }

    async fn compile(
        &self,
        task: &JudgeTask,
        recipe: &LanguageRecipe,
        work_dir: &WorkDir,
        cancel: &CancelToken,
    ) -> Result<CompileInfo, EngineError> {
        let argv = recipe
            .compile_argv(&recipe.source_file_name(), &recipe.executable)
            .ok_or_else(|| EngineError::Internal(format!("language '{}' has no compile command", recipe.name)))?;

        let spec = SandboxSpec {
            uid: self.sandbox.jail_uid,
            gid: self.sandbox.jail_gid,
            work_dir: work_dir.path().to_path_buf(),
            chroot: self.chroot(),
            time_limit_ms: recipe.compile_timeout_ms,
            wall_time_limit_ms: recipe.compile_timeout_ms,
            memory_limit_kb: self.limits.compile_memory_mb * 1024,
            stack_limit_kb: self.limits.max_stack_size_kb,
            file_size_limit_kb: self.limits.compile_file_size_kb,
            process_limit: self.sandbox.max_processes,
            syscall_whitelist: vec![],
            enable_seccomp: false,
            input_path: None,
            output_path: work_dir.join(COMPILE_OUTPUT_FILE),
            error_path: work_dir.join(COMPILE_ERROR_FILE),
            env: recipe.env_pairs(),
            cgroup_group: format!("{}/{}_compile", recipe.name, task.task_id),
        };

        let outcome = self.executor.execute(&argv[0], &argv[1..], &spec, cancel).await?;
        if outcome.cancelled {
            return Err(cancel.reason().unwrap_or(CancelReason::User).into());
        }

        let success = outcome.status == ExecStatus::Accepted && work_dir.join(&recipe.executable).exists();
        let mut message = read_lossy(&spec.error_path);
        if message.trim().is_empty() {
            message = read_lossy(&spec.output_path);
        }
        if !success && message.trim().is_empty() {
            message = match outcome.status {
                ExecStatus::TimeLimitExceeded => "compilation time limit exceeded".to_string(),
                ExecStatus::MemoryLimitExceeded => "compilation memory limit exceeded".to_string(),
                ExecStatus::OutputLimitExceeded => "compiler output too large".to_string(),
                _ => "compilation failed".to_string(),
            };
        }

        Ok(CompileInfo {
            success,
            message: truncate_message(&message, self.limits.compile_message_limit),
            time_ms: outcome.wall_time_ms,
        })
    }

    async fn run_case(
        &self,
        task: &JudgeTask,
        recipe: &LanguageRecipe,
        case: &TestCase,
        work_dir: &WorkDir,
        cancel: &CancelToken,
    ) -> Result<TestCaseResult, EngineError> {
        let limits = CaseLimits::for_case(task, case, recipe);
        let input_path = work_dir.write_file(&format!("input_{}.txt", case.case_id), &case.input)?;
        let output_path = work_dir.join(format!("output_{}.txt", case.case_id));
        let error_path = work_dir.join(format!("error_{}.txt", case.case_id));

        let argv = recipe.execute_argv(&recipe.source_file_name(), &recipe.executable, limits.memory_mb());
        let spec = SandboxSpec {
            uid: self.sandbox.jail_uid,
            gid: self.sandbox.jail_gid,
            work_dir: work_dir.path().to_path_buf(),
            chroot: self.chroot(),
            time_limit_ms: limits.time_ms,
            wall_time_limit_ms: limits.time_ms + WALL_TIME_SLACK_MS,
            memory_limit_kb: limits.memory_kb,
            stack_limit_kb: self.limits.max_stack_size_kb,
            file_size_limit_kb: self.limits.max_file_size_kb,
            process_limit: recipe.max_processes,
            syscall_whitelist: recipe.syscall_whitelist.clone(),
            enable_seccomp: self.sandbox.enable_seccomp && recipe.enable_seccomp,
            input_path: Some(input_path),
            output_path: output_path.clone(),
            error_path: error_path.clone(),
            env: recipe.env_pairs(),
            cgroup_group: format!("{}/{}_case_{}", recipe.name, task.task_id, case.case_id),
        };

        let outcome: ExecutionOutcome = match self.executor.execute(&argv[0], &argv[1..], &spec, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(case_id = case.case_id, error = %e, "Sandbox failed to run case");
                return Ok(evaluator::system_error_case(case, e.to_string()));
            }
        };
        if outcome.cancelled {
            return Err(cancel.reason().unwrap_or(CancelReason::User).into());
        }

        let stdout = read_lossy(&output_path);
        let stderr = read_lossy(&error_path);
        Ok(evaluator::evaluate_case(&outcome, case, stdout, stderr, limits.time_ms))
    }

    fn chroot(&self) -> Option<PathBuf> {
        if self.sandbox.enable_chroot {
            self.sandbox.chroot_dir.clone()
        } else {
            None
        }
    }

    fn meta(&self, recipe: &LanguageRecipe) -> JudgeMeta {
        JudgeMeta {
            node_id: self.node_id.clone(),
            timestamp: chrono::Utc::now(),
            language_version: recipe.version.clone(),
        }
    }
}

#[async_trait]
impl TaskProcessor for VerdictEngine {
    async fn process(&self, task: Arc<JudgeTask>, ctx: TaskContext) -> Result<JudgeResult, EngineError> {
        self.judge(&task, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::config::tests::recipe;
    use crate::scheduler::task::tests::sample_task;
    use crate::scheduler::task::TaskEntry;
    use std::sync::Mutex;

    type Behaviour = dyn Fn(&str, &SandboxSpec) -> Result<ExecutionOutcome, SandboxError> + Send + Sync;

    /// Executor double: records every call and delegates to a closure
    struct FakeExecutor {
        calls: Mutex<Vec<(String, Vec<String>, SandboxSpec)>>,
        behaviour: Box<Behaviour>,
    }

    impl FakeExecutor {
        fn new<F>(behaviour: F) -> Arc<Self>
        where
            F: Fn(&str, &SandboxSpec) -> Result<ExecutionOutcome, SandboxError> + Send + Sync + 'static,
        {
            Arc::new(FakeExecutor {
                calls: Mutex::new(vec![]),
                behaviour: Box::new(behaviour),
            })
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn execute(
            &self,
            program: &str,
            args: &[String],
            spec: &SandboxSpec,
            _cancel: &CancelToken,
        ) -> Result<ExecutionOutcome, SandboxError> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec(), spec.clone()));
            (self.behaviour)(program, spec)
        }
    }

    fn outcome(status: ExecStatus) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            exit_code: Some(0),
            signal: None,
            cpu_time_ms: 10,
            wall_time_ms: 15,
            memory_kb: 1024,
            output_bytes: 0,
            cancelled: false,
        }
    }

    /// Compiles by touching the executable; runs by summing the input
    fn adder(program: &str, spec: &SandboxSpec) -> Result<ExecutionOutcome, SandboxError> {
        if program == "g++" {
            fs::write(spec.work_dir.join("main"), b"").unwrap();
            return Ok(outcome(ExecStatus::Accepted));
        }
        let input = fs::read_to_string(spec.input_path.as_ref().unwrap()).unwrap();
        let sum: i64 = input.split_whitespace().map(|t| t.parse::<i64>().unwrap()).sum();
        fs::write(&spec.output_path, format!("{}\n", sum)).unwrap();
        Ok(outcome(ExecStatus::Accepted))
    }

    struct Fixture {
        engine: VerdictEngine,
        temp: tempfile::TempDir,
    }

    fn fixture(executor: Arc<dyn Executor>) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let mut config = JudgeConfig::default();
        config.node_id = "node-test".to_string();
        config.paths.temp_dir = temp.path().to_path_buf();
        config.sandbox.jail_uid = nix::unistd::getuid().as_raw();
        config.sandbox.jail_gid = nix::unistd::getgid().as_raw();
        config.limits.max_code_length = 64;
        config.limits.compile_message_limit = 32;
        config.limits.forbidden_patterns = vec![r"#\s*include\s*<sys/socket\.h>".to_string()];

        let mut python = recipe("python");
        python.is_compiled = false;
        python.compile_command = None;
        python.file_extension = "py".to_string();
        python.execute_command = "python3 {source}".to_string();
        python.time_multiplier = 3.0;
        python.memory_multiplier = 2.0;

        let mut java = recipe("java");
        java.execute_command = "java -Xmx{memory_limit}m Main".to_string();

        let registry = LanguageRegistry::from_recipes(vec![recipe("cpp"), python, java]).unwrap();
        Fixture {
            engine: VerdictEngine::new(&config, registry, executor).unwrap(),
            temp,
        }
    }

    fn task(code: &str, cases: &[(&str, &str)]) -> JudgeTask {
        let mut task = sample_task(42, 3);
        task.task_id = "task_42_1".to_string();
        task.code = code.to_string();
        task.test_cases = cases
            .iter()
            .enumerate()
            .map(|(i, (input, expected))| TestCase {
                case_id: i as u32 + 1,
                input: input.to_string(),
                expected_output: expected.to_string(),
                time_limit_ms: 0,
                memory_limit_mb: 0,
            })
            .collect();
        task
    }

    fn context(task: &JudgeTask) -> TaskContext {
        TaskEntry::new(task.clone(), 1).context()
    }

    #[tokio::test]
    async fn test_happy_path_accepted() {
        let exec = FakeExecutor::new(adder);
        let fx = fixture(exec.clone());
        let task = task("int main(){}", &[("1 2", "3"), ("5 10", "15")]);
        let ctx = context(&task);

        let result = fx.engine.judge(&task, &ctx).await.unwrap();
        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.score, 100);
        assert!(result.compile_info.success);
        assert_eq!(result.test_cases.len(), 2);
        assert!(result.test_cases.iter().all(|c| c.status == CaseStatus::Accepted));
        assert_eq!(result.meta.node_id, "node-test");
        assert_eq!(ctx.progress.current(), 2);

        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let (compile_prog, _, compile_spec) = &calls[0];
        assert_eq!(compile_prog, "g++");
        assert!(!compile_spec.enable_seccomp);
        assert_eq!(compile_spec.memory_limit_kb, 512 * 1024);
        assert_eq!(compile_spec.cgroup_group, "cpp/task_42_1_compile");

        let (run_prog, _, run_spec) = &calls[1];
        assert_eq!(run_prog, "./main");
        assert_eq!(run_spec.time_limit_ms, 1000);
        assert_eq!(run_spec.wall_time_limit_ms, 2000);
        assert_eq!(run_spec.memory_limit_kb, 128 * 1024);
        assert_eq!(run_spec.cgroup_group, "cpp/task_42_1_case_1");
        assert!(run_spec.input_path.as_ref().unwrap().ends_with("input_1.txt"));
    }

    #[tokio::test]
    async fn test_work_dir_removed_after_judging() {
        let fx = fixture(FakeExecutor::new(adder));
        let task = task("int main(){}", &[("1 2", "3")]);
        fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(fs::read_dir(fx.temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_answer_short_circuits() {
        let exec = FakeExecutor::new(adder);
        let fx = fixture(exec.clone());
        let task = task("int main(){}", &[("1 2", "3"), ("1 2", "4"), ("2 2", "4")]);

        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::WrongAnswer);
        assert_eq!(result.score, 33);
        assert_eq!(result.test_cases.len(), 2);
        assert_eq!(result.test_cases[1].output.trim_end(), "3");
        assert_eq!(result.test_cases[1].expected_output, "4");
        // compile + two cases; the third never ran
        assert_eq!(exec.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_compile_error() {
        let fx = fixture(FakeExecutor::new(|_, spec| {
            fs::write(&spec.error_path, "main.cpp:1:18: error: expected expression").unwrap();
            let mut out = outcome(ExecStatus::RuntimeError);
            out.exit_code = Some(1);
            Ok(out)
        }));
        let task = task("int main(){ return", &[("", "")]);

        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::CompileError);
        assert!(!result.compile_info.success);
        assert!(result.compile_info.message.starts_with("main.cpp:1:18: error"));
        assert!(result.compile_info.message.ends_with("... (truncated)"));
        assert!(result.test_cases.is_empty());
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn test_compile_without_executable_fails() {
        let fx = fixture(FakeExecutor::new(|_, _| Ok(outcome(ExecStatus::Accepted))));
        let task = task("int main(){}", &[("", "")]);
        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::CompileError);
        assert_eq!(result.compile_info.message, "compilation failed");
    }

    #[tokio::test]
    async fn test_time_limit_case() {
        let fx = fixture(FakeExecutor::new(|program, spec| {
            if program == "g++" {
                return adder(program, spec);
            }
            let mut out = outcome(ExecStatus::TimeLimitExceeded);
            out.cpu_time_ms = 480;
            out.signal = Some(nix::libc::SIGXCPU);
            Ok(out)
        }));
        let mut task = task("int main(){while(1);}", &[("", "")]);
        task.time_limit_ms = 500;

        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::TimeLimitExceeded);
        assert!(result.test_cases[0].time_used >= 500);
        assert_eq!(result.time_used, 500);
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_case_system_error() {
        let fx = fixture(FakeExecutor::new(|program, spec| {
            if program == "g++" {
                return adder(program, spec);
            }
            Err(SandboxError::Cgroup("memory controller missing".to_string()))
        }));
        let task = task("int main(){}", &[("1 2", "3"), ("1 1", "2")]);

        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::SystemError);
        assert_eq!(result.test_cases.len(), 1);
        assert!(result.test_cases[0].error_output.contains("memory controller missing"));
    }

    #[tokio::test]
    async fn test_sandbox_failure_while_compiling_fails_task() {
        let fx = fixture(FakeExecutor::new(|_, _| Err(SandboxError::Cgroup("busy".to_string()))));
        let task = task("int main(){}", &[("1 2", "3")]);
        let err = fx.engine.judge(&task, &context(&task)).await.unwrap_err();
        assert!(matches!(err, EngineError::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_interpreted_language_skips_compile() {
        let exec = FakeExecutor::new(|_, spec| {
            fs::write(&spec.output_path, "hi").unwrap();
            Ok(outcome(ExecStatus::Accepted))
        });
        let fx = fixture(exec.clone());
        let mut task = task("print('hi')", &[("", "hi")]);
        task.language = "python".to_string();

        let result = fx.engine.judge(&task, &context(&task)).await.unwrap();
        assert_eq!(result.status, Verdict::Accepted);
        assert!(result.compile_info.success);

        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "python3");
        assert_eq!(calls[0].1, vec!["main.py".to_string()]);
        // multipliers 3.0 and 2.0
        assert_eq!(calls[0].2.time_limit_ms, 3000);
        assert_eq!(calls[0].2.memory_limit_kb, 256 * 1024);
    }

    #[tokio::test]
    async fn test_memory_placeholder_uses_adjusted_limit() {
        let exec = FakeExecutor::new(|program, spec| {
            if program == "g++" {
                fs::write(spec.work_dir.join("main"), b"").unwrap();
            }
            Ok(outcome(ExecStatus::Accepted))
        });
        let fx = fixture(exec.clone());
        let mut task = task("class Main {}", &[("", "")]);
        task.language = "java".to_string();
        task.test_cases[0].memory_limit_mb = 64;

        fx.engine.judge(&task, &context(&task)).await.unwrap();
        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls[1].1, vec!["-Xmx64m".to_string(), "Main".to_string()]);
    }

    #[tokio::test]
    async fn test_validation_boundaries() {
        let fx = fixture(FakeExecutor::new(adder));

        let message = |task: JudgeTask| {
            let ctx = context(&task);
            let engine = &fx.engine;
            async move { engine.judge(&task, &ctx).await.unwrap().message.unwrap_or_default() }
        };

        let too_long = task(&"x".repeat(65), &[("", "")]);
        assert_eq!(message(too_long).await, "code length exceeds limit");

        let at_limit = task(&"x".repeat(64), &[("", "")]);
        assert!(fx.engine.validate(&at_limit).is_ok());

        let mut zero_time = task("int main(){}", &[("", "")]);
        zero_time.time_limit_ms = 0;
        assert_eq!(message(zero_time).await, "invalid time limit");

        let mut huge_time = task("int main(){}", &[("", "")]);
        huge_time.time_limit_ms = 10_001;
        assert_eq!(message(huge_time).await, "invalid time limit");

        let no_cases = task("int main(){}", &[]);
        let ctx = context(&no_cases);
        let result = fx.engine.judge(&no_cases, &ctx).await.unwrap();
        assert_eq!(result.status, Verdict::SystemError);
        assert_eq!(result.message.as_deref(), Some("no test cases"));

        let mut cobol = task("int main(){}", &[("", "")]);
        cobol.language = "cobol".to_string();
        assert_eq!(message(cobol).await, "unsupported language: cobol");

        let socket = task("#include <sys/socket.h>", &[("", "")]);
        assert_eq!(message(socket).await, "code contains a forbidden pattern");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture(FakeExecutor::new(adder));
        let task = task("int main(){}", &[("1 2", "3")]);
        let (handle, token) = cancel_pair();
        let ctx = TaskContext {
            cancel: token,
            ..context(&task)
        };

        handle.cancel(CancelReason::User);
        assert!(matches!(fx.engine.judge(&task, &ctx).await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_before_start() {
        let fx = fixture(FakeExecutor::new(adder));
        let task = task("int main(){}", &[("1 2", "3")]);
        let (handle, token) = cancel_pair();
        handle.cancel(CancelReason::Deadline);
        let ctx = TaskContext {
            cancel: token,
            ..context(&task)
        };

        let err = fx.engine.judge(&task, &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_killed_case_reports_cancellation() {
        let fx = fixture(FakeExecutor::new(|program, spec| {
            if program == "g++" {
                return adder(program, spec);
            }
            let mut out = outcome(ExecStatus::SystemError);
            out.cancelled = true;
            Ok(out)
        }));
        let task = task("int main(){}", &[("1 2", "3")]);

        let err = fx.engine.judge(&task, &context(&task)).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(fs::read_dir(fx.temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncate_message_on_char_boundary() {
        assert_eq!(truncate_message("short", 10), "short");
        let truncated = truncate_message("ééé", 3);
        assert_eq!(truncated, format!("é{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_case_limit_overrides() {
        let mut java = recipe("java");
        java.time_multiplier = 2.0;
        java.memory_multiplier = 1.5;
        let task = sample_task(1, 3);
        let mut case = task.test_cases[0].clone();

        let limits = CaseLimits::for_case(&task, &case, &java);
        assert_eq!(limits, CaseLimits { time_ms: 2000, memory_kb: 192 * 1024 });

        case.time_limit_ms = 300;
        case.memory_limit_mb = 10;
        let limits = CaseLimits::for_case(&task, &case, &java);
        assert_eq!(limits.time_ms, 600);
        assert_eq!(limits.memory_mb(), 15);
    }
}
