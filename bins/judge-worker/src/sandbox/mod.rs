//! Sandboxed Executor - Isolate-and-Run Primitive
//!
//! **Core Responsibility:**
//! Run one program under namespace, cgroup, seccomp and rlimit isolation with
//! redirected I/O, and report how it terminated.
//!
//! **Isolation, in the order it is applied in the child:**
//! - New PID, network and mount namespaces (mounts made private)
//! - Optional chroot with the work dir bind-mounted at `/sandbox`
//! - stdin/stdout/stderr dup2'd from files the supervisor opened
//! - rlimits: CPU, stack, file size, core (address space optional)
//! - Unprivileged uid/gid, `no_new_privs`
//! - ptrace attach, then the seccomp whitelist, then exec
//!
//! The cgroup is created by the supervisor and the child is placed in it
//! before it is released to exec.
//!
//! With namespaces the cloned child is PID 1 of its namespace and would be
//! immune to SIGSEGV, SIGFPE, SIGXCPU and SIGXFSZ. It stays as init instead:
//! the program runs in a forked grandchild and the init relays its wait
//! status over a pipe. CPU time and peak RSS still come from wait4 on the
//! init, which accounts the reaped grandchild.
pub mod cgroup;
mod child;
pub mod pipe;
pub mod seccomp;
mod supervisor;

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::libc;
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::Resource;
use nix::unistd::{Gid, Uid};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use judge_common::config::SandboxConfig;

use crate::cancel::CancelToken;
use cgroup::{CgroupGuard, CgroupLimits};
use child::{ChildPlan, ExecArgs};
use pipe::{ChildFailure, SandboxPipe};
use supervisor::{KillReason, RawExit, Watch};

const CHILD_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_PATH: &str = "/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create pipe: {0}")]
    Pipe(Errno),
    #[error("failed to clone child: {0}")]
    Clone(Errno),
    #[error("cgroup error: {0}")]
    Cgroup(String),
    #[error("child setup failed: {0}")]
    ChildSetup(ChildFailure),
    #[error("wait failed: {0}")]
    Wait(Errno),
    #[error("program not found: {0}")]
    ProgramNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("seccomp is not supported on this architecture")]
    SeccompUnsupported,
    #[error("sandbox thread failed: {0}")]
    Join(String),
}

/// Terminal status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Accepted,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    CompileError,
    SystemError,
}

/// Everything needed to isolate one process
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub uid: u32,
    pub gid: u32,
    pub work_dir: PathBuf,
    pub chroot: Option<PathBuf>,
    pub time_limit_ms: u64,
    pub wall_time_limit_ms: u64,
    pub memory_limit_kb: u64,
    /// 0 means unlimited
    pub stack_limit_kb: u64,
    pub file_size_limit_kb: u64,
    pub process_limit: u64,
    pub syscall_whitelist: Vec<i64>,
    pub enable_seccomp: bool,
    /// `None` reads from /dev/null
    pub input_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
    pub env: Vec<(String, String)>,
    /// `<language>/<taskgroup>` below the configured cgroup prefix
    pub cgroup_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub output_bytes: u64,
    /// Killed because the task was cancelled
    pub cancelled: bool,
}

/// Seam between the verdict engine and process isolation
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        spec: &SandboxSpec,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

/// Kernel-backed executor
#[derive(Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

#[async_trait]
impl Executor for Sandbox {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        spec: &SandboxSpec,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let sandbox = self.clone();
        let program = program.to_string();
        let args = args.to_vec();
        let spec = spec.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || sandbox.run(&program, &args, &spec, &cancel))
            .await
            .map_err(|e| SandboxError::Join(e.to_string()))?
    }
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        if !config.cgroup_root.join("memory").is_dir() {
            warn!(
                cgroup_root = %config.cgroup_root.display(),
                "cgroup v1 memory hierarchy not found, executions will fail"
            );
        }
        Sandbox { config }
    }

    /// Blocking execution. Runs on a dedicated thread.
    fn run(
        &self,
        program: &str,
        args: &[String],
        spec: &SandboxSpec,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let stdin = match &spec.input_path {
            Some(path) => open_read(path)?,
            None => open_read(Path::new("/dev/null"))?,
        };
        let stdout = open_write(&spec.output_path)?;
        let stderr = open_write(&spec.error_path)?;

        let filter = if spec.enable_seccomp {
            Some(
                seccomp::build_filter(&spec.syscall_whitelist)
                    .ok_or(SandboxError::SeccompUnsupported)?,
            )
        } else {
            None
        };

        let path_env = spec
            .env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
            .unwrap_or(DEFAULT_PATH);
        let resolved = child::resolve_program(program, path_env, spec.chroot.as_deref())
            .ok_or_else(|| SandboxError::ProgramNotFound(program.to_string()))?;

        if let Some(root) = &spec.chroot {
            let target = root.join("sandbox");
            fs::create_dir_all(&target)
                .map_err(|source| SandboxError::Open { path: target, source })?;
        }

        let go_pipe = SandboxPipe::new().map_err(SandboxError::Pipe)?;
        let report_pipe = SandboxPipe::new().map_err(SandboxError::Pipe)?;
        let status_pipe = if self.config.enable_namespaces {
            Some(SandboxPipe::new().map_err(SandboxError::Pipe)?)
        } else {
            None
        };

        let plan = ChildPlan {
            program: c_string(resolved.to_string_lossy().as_ref())?,
            argv: std::iter::once(program)
                .chain(args.iter().map(String::as_str))
                .map(c_string)
                .collect::<Result<_, _>>()?,
            envp: build_env(&spec.env)?,
            work_dir: spec.work_dir.clone(),
            chroot: spec
                .chroot
                .as_ref()
                .map(|root| (root.clone(), root.join("sandbox"))),
            new_mount_namespace: self.config.enable_namespaces,
            stdin: stdin.as_raw_fd(),
            stdout: stdout.as_raw_fd(),
            stderr: stderr.as_raw_fd(),
            rlimits: rlimits(spec, self.config.limit_address_space),
            uid: Uid::from_raw(spec.uid),
            gid: Gid::from_raw(spec.gid),
            filter,
            go_fd: go_pipe.read_fd(),
            report_fd: report_pipe.write_fd(),
            status_fd: status_pipe.as_ref().map(SandboxPipe::write_fd),
        };
        let exec_args = ExecArgs::new(&plan);

        let cgroup = CgroupGuard::create(
            &self.config,
            &spec.cgroup_group,
            &CgroupLimits {
                memory_bytes: (spec.memory_limit_kb * 1024) as i64,
                max_processes: process_budget(spec.process_limit, self.config.enable_namespaces),
            },
        )?;

        let flags = if self.config.enable_namespaces {
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWNS
        } else {
            CloneFlags::empty()
        };
        let mut stack = vec![0u8; CHILD_STACK_SIZE];

        #[allow(unused_unsafe)]
        let pid = unsafe {
            clone(
                Box::new(|| child::run(&plan, &exec_args)),
                &mut stack,
                flags,
                Some(libc::SIGCHLD),
            )
        }
        .map_err(SandboxError::Clone)?;

        let go = go_pipe.into_go_writer();
        let report = report_pipe.into_report_reader();
        let relayed = status_pipe.map(SandboxPipe::into_status_reader);
        debug!(pid = pid.as_raw(), cgroup = %cgroup.name(), program = %program, "Spawned child");

        if let Err(e) = cgroup.add_process(pid) {
            drop(go);
            supervisor::abort_child(pid);
            return Err(e);
        }
        if let Err(errno) = go.release() {
            supervisor::abort_child(pid);
            return Err(SandboxError::Pipe(errno));
        }

        let mut exit = supervisor::supervise(
            pid,
            &Watch {
                wall_limit: Duration::from_millis(spec.wall_time_limit_ms),
                memory_limit_bytes: spec.memory_limit_kb * 1024,
                poll_interval: Duration::from_millis(self.config.poll_interval_ms),
                cancel,
                cgroup: &cgroup,
            },
        )?;

        if let Some(failure) = report.read_failure() {
            return Err(SandboxError::ChildSetup(failure));
        }
        if let Some(status) = relayed.as_ref().and_then(|reader| reader.read_status()) {
            supervisor::apply_relayed(&mut exit, status);
        }

        let usage = cgroup.memory_usage();
        let peak_kb = measured_memory_kb(usage.max_usage_bytes, exit.max_rss_kb);
        let output_bytes = fs::metadata(&spec.output_path).map(|m| m.len()).unwrap_or(0);

        let cancelled = exit.killed_by == Some(KillReason::Cancelled);
        let status = if cancelled {
            ExecStatus::SystemError
        } else {
            classify(&exit, spec, peak_kb, usage.fail_count, output_bytes)
        };

        debug!(
            pid = pid.as_raw(),
            status = ?status,
            exit_code = ?exit.exit_code,
            signal = ?exit.signal,
            cpu_ms = exit.cpu_time_ms,
            wall_ms = exit.wall_time_ms,
            memory_kb = peak_kb,
            "Child terminated"
        );

        Ok(ExecutionOutcome {
            status,
            exit_code: exit.exit_code,
            signal: exit.signal,
            cpu_time_ms: exit.cpu_time_ms,
            wall_time_ms: exit.wall_time_ms,
            memory_kb: peak_kb,
            output_bytes,
            cancelled,
        })
    }
}

fn open_read(path: &Path) -> Result<File, SandboxError> {
    File::open(path).map_err(|source| SandboxError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn open_write(path: &Path) -> Result<File, SandboxError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| SandboxError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn c_string(value: &str) -> Result<CString, SandboxError> {
    CString::new(value).map_err(|_| SandboxError::InvalidArgument(value.to_string()))
}

/// Minimal environment: PATH plus the recipe's additions
fn build_env(env: &[(String, String)]) -> Result<Vec<CString>, SandboxError> {
    let mut pairs = Vec::with_capacity(env.len() + 1);
    if !env.iter().any(|(k, _)| k == "PATH") {
        pairs.push(c_string(&format!("PATH={}", DEFAULT_PATH))?);
    }
    for (key, value) in env {
        pairs.push(c_string(&format!("{}={}", key, value))?);
    }
    Ok(pairs)
}

/// Resource limits set in the child as (resource, soft, hard)
fn rlimits(spec: &SandboxSpec, limit_address_space: bool) -> Vec<(Resource, u64, u64)> {
    let cpu_secs = (spec.time_limit_ms + 999) / 1000 + 1;
    let stack = if spec.stack_limit_kb == 0 {
        libc::RLIM_INFINITY
    } else {
        spec.stack_limit_kb * 1024
    };
    // limit + 1: exactly the limit passes, anything longer shows on disk
    let fsize = spec.file_size_limit_kb * 1024 + 1;

    let mut limits = vec![
        // SIGXCPU at the soft limit, SIGKILL one second later
        (Resource::RLIMIT_CPU, cpu_secs, cpu_secs + 1),
        (Resource::RLIMIT_STACK, stack, stack),
        (Resource::RLIMIT_FSIZE, fsize, fsize),
        (Resource::RLIMIT_CORE, 0, 0),
    ];
    if limit_address_space {
        let bytes = spec.memory_limit_kb * 1024;
        limits.push((Resource::RLIMIT_AS, bytes, bytes));
    }
    limits
}

/// Peak memory in KB. The cgroup charge is preferred: `ru_maxrss` of a
/// cloned child also counts pages inherited from the supervisor before exec.
fn measured_memory_kb(cgroup_max_bytes: u64, max_rss_kb: u64) -> u64 {
    if cgroup_max_bytes > 0 {
        cgroup_max_bytes / 1024
    } else {
        max_rss_kb
    }
}

/// Value for pids.max: the namespace init counts against it too
fn process_budget(process_limit: u64, namespace_init: bool) -> i64 {
    let budget = process_limit.max(1) + u64::from(namespace_init);
    budget as i64
}

/// Map a raw termination to an execution status
fn classify(
    exit: &RawExit,
    spec: &SandboxSpec,
    peak_kb: u64,
    fail_count: u64,
    output_bytes: u64,
) -> ExecStatus {
    let status = match exit.signal {
        Some(libc::SIGXCPU) => ExecStatus::TimeLimitExceeded,
        Some(libc::SIGXFSZ) => ExecStatus::OutputLimitExceeded,
        Some(libc::SIGKILL) => {
            if exit.killed_by == Some(KillReason::Memory)
                || peak_kb >= spec.memory_limit_kb
                || fail_count > 0
            {
                ExecStatus::MemoryLimitExceeded
            } else if exit.killed_by == Some(KillReason::WallTime)
                || exit.cpu_time_ms > spec.time_limit_ms
            {
                ExecStatus::TimeLimitExceeded
            } else {
                ExecStatus::RuntimeError
            }
        }
        Some(_) => ExecStatus::RuntimeError,
        None => {
            if exit.cpu_time_ms > spec.time_limit_ms {
                ExecStatus::TimeLimitExceeded
            } else if peak_kb > spec.memory_limit_kb {
                ExecStatus::MemoryLimitExceeded
            } else if exit.exit_code.unwrap_or(0) != 0 {
                ExecStatus::RuntimeError
            } else {
                ExecStatus::Accepted
            }
        }
    };

    if output_bytes > spec.file_size_limit_kb * 1024 {
        return ExecStatus::OutputLimitExceeded;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            uid: 65534,
            gid: 65534,
            work_dir: PathBuf::from("/tmp/judge/w"),
            chroot: None,
            time_limit_ms: 1000,
            wall_time_limit_ms: 2000,
            memory_limit_kb: 128 * 1024,
            stack_limit_kb: 0,
            file_size_limit_kb: 10 * 1024,
            process_limit: 1,
            syscall_whitelist: vec![],
            enable_seccomp: false,
            input_path: None,
            output_path: PathBuf::from("/tmp/judge/w/output_1.txt"),
            error_path: PathBuf::from("/tmp/judge/w/error_1.txt"),
            env: vec![],
            cgroup_group: "cpp/task_1_1_case_1".to_string(),
        }
    }

    fn exited(code: i32, cpu_ms: u64) -> RawExit {
        RawExit {
            exit_code: Some(code),
            cpu_time_ms: cpu_ms,
            ..RawExit::default()
        }
    }

    fn signaled(sig: i32, killed_by: Option<KillReason>) -> RawExit {
        RawExit {
            signal: Some(sig),
            cpu_time_ms: 10,
            killed_by,
            ..RawExit::default()
        }
    }

    #[test]
    fn test_classify_normal_exit() {
        assert_eq!(classify(&exited(0, 10), &spec(), 1024, 0, 3), ExecStatus::Accepted);
        assert_eq!(classify(&exited(1, 10), &spec(), 1024, 0, 3), ExecStatus::RuntimeError);
        assert_eq!(classify(&exited(0, 1500), &spec(), 1024, 0, 3), ExecStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_classify_signals() {
        let s = spec();
        assert_eq!(classify(&signaled(libc::SIGXCPU, None), &s, 0, 0, 0), ExecStatus::TimeLimitExceeded);
        assert_eq!(classify(&signaled(libc::SIGXFSZ, None), &s, 0, 0, 0), ExecStatus::OutputLimitExceeded);
        assert_eq!(classify(&signaled(libc::SIGSEGV, None), &s, 0, 0, 0), ExecStatus::RuntimeError);
        assert_eq!(classify(&signaled(libc::SIGSYS, None), &s, 0, 0, 0), ExecStatus::RuntimeError);
    }

    #[test]
    fn test_classify_sigkill() {
        let s = spec();
        // OOM killer inside the cgroup
        assert_eq!(
            classify(&signaled(libc::SIGKILL, None), &s, s.memory_limit_kb, 1, 0),
            ExecStatus::MemoryLimitExceeded
        );
        assert_eq!(
            classify(&signaled(libc::SIGKILL, Some(KillReason::WallTime)), &s, 100, 0, 0),
            ExecStatus::TimeLimitExceeded
        );
        assert_eq!(
            classify(&signaled(libc::SIGKILL, Some(KillReason::Memory)), &s, 100, 0, 0),
            ExecStatus::MemoryLimitExceeded
        );
        assert_eq!(classify(&signaled(libc::SIGKILL, None), &s, 100, 0, 0), ExecStatus::RuntimeError);
    }

    #[test]
    fn test_output_size_overrides() {
        let s = spec();
        let over = s.file_size_limit_kb * 1024 + 1;
        assert_eq!(classify(&exited(0, 10), &s, 1024, 0, over), ExecStatus::OutputLimitExceeded);
    }

    #[test]
    fn test_output_stopped_by_file_size_limit() {
        let s = spec();
        let limit = s.file_size_limit_kb * 1024;
        // exactly at the limit is fine
        assert_eq!(classify(&exited(0, 10), &s, 1024, 0, limit), ExecStatus::Accepted);

        // RLIMIT_FSIZE halts a flood one byte past the limit, whether the
        // program then dies of SIGXFSZ or ignores EFBIG and exits cleanly
        let halted = rlimits(&s, false)
            .into_iter()
            .find(|(r, _, _)| *r == Resource::RLIMIT_FSIZE)
            .map(|(_, soft, _)| soft)
            .unwrap();
        assert_eq!(classify(&exited(0, 10), &s, 1024, 0, halted), ExecStatus::OutputLimitExceeded);
        assert_eq!(classify(&exited(1, 10), &s, 1024, 0, halted), ExecStatus::OutputLimitExceeded);
        assert_eq!(
            classify(&signaled(libc::SIGXFSZ, None), &s, 1024, 0, halted),
            ExecStatus::OutputLimitExceeded
        );
    }

    #[test]
    fn test_process_budget_counts_init() {
        assert_eq!(process_budget(1, false), 1);
        assert_eq!(process_budget(1, true), 2);
        assert_eq!(process_budget(0, true), 2);
        assert_eq!(process_budget(64, true), 65);
    }

    #[test]
    fn test_rlimits() {
        let mut s = spec();
        s.time_limit_ms = 1500;
        let limits = rlimits(&s, false);
        assert_eq!(limits[0], (Resource::RLIMIT_CPU, 3, 4));
        assert_eq!(limits[1].1, libc::RLIM_INFINITY);
        assert_eq!(limits[2], (Resource::RLIMIT_FSIZE, 10 * 1024 * 1024 + 1, 10 * 1024 * 1024 + 1));
        assert!(!limits.iter().any(|(r, _, _)| *r == Resource::RLIMIT_AS));

        let limits = rlimits(&s, true);
        assert!(limits.iter().any(|(r, soft, _)| *r == Resource::RLIMIT_AS && *soft == 128 * 1024 * 1024));
    }

    #[test]
    fn test_env_always_has_path() {
        let env = build_env(&[("JAVA_HOME".to_string(), "/opt/jdk".to_string())]).unwrap();
        assert_eq!(env[0].to_str().unwrap(), "PATH=/usr/bin:/bin");
        assert_eq!(env[1].to_str().unwrap(), "JAVA_HOME=/opt/jdk");

        let env = build_env(&[("PATH".to_string(), "/opt/bin".to_string())]).unwrap();
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_measured_memory_prefers_cgroup() {
        assert_eq!(measured_memory_kb(4 * 1024 * 1024, 30_000), 4096);
        assert_eq!(measured_memory_kb(0, 30_000), 30_000);
    }
}
