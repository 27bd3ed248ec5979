// Supervisor side of an execution: wait loop, limit checks, kill
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use super::cgroup::CgroupGuard;
use super::SandboxError;
use crate::cancel::CancelToken;

/// Why the supervisor killed the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    WallTime,
    Memory,
    Cancelled,
}

/// How the child terminated, before classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time_ms: u64,
    pub max_rss_kb: u64,
    pub wall_time_ms: u64,
    pub killed_by: Option<KillReason>,
}

pub struct Watch<'a> {
    pub wall_limit: Duration,
    pub memory_limit_bytes: u64,
    pub poll_interval: Duration,
    pub cancel: &'a CancelToken,
    pub cgroup: &'a CgroupGuard,
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Poll the child until it terminates, enforcing the wall-time limit,
/// the memory ceiling and cancellation between polls.
pub fn supervise(pid: Pid, watch: &Watch<'_>) -> Result<RawExit, SandboxError> {
    let start = Instant::now();
    let mut killed_by: Option<KillReason> = None;
    let mut attached = false;

    loop {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::wait4(
                pid.as_raw(),
                &mut status,
                libc::WNOHANG | libc::__WALL,
                &mut usage,
            )
        };

        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(SandboxError::Wait(errno));
        }

        if rc == 0 {
            if killed_by.is_none() {
                killed_by = check_limits(start, watch);
                if let Some(reason) = killed_by {
                    debug!(pid = pid.as_raw(), reason = ?reason, "Killing child");
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
            thread::sleep(watch.poll_interval);
            continue;
        }

        if libc::WIFSTOPPED(status) {
            resume_traced(pid, libc::WSTOPSIG(status), &mut attached);
            continue;
        }

        let mut exit = RawExit {
            cpu_time_ms: timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime),
            max_rss_kb: usage.ru_maxrss.max(0) as u64,
            wall_time_ms: start.elapsed().as_millis() as u64,
            killed_by,
            ..RawExit::default()
        };
        if libc::WIFEXITED(status) {
            exit.exit_code = Some(libc::WEXITSTATUS(status));
        } else if libc::WIFSIGNALED(status) {
            exit.signal = Some(libc::WTERMSIG(status));
        } else {
            continue;
        }
        return Ok(exit);
    }
}

/// Resume a tracee after a stop, forwarding any real signal. The first
/// SIGTRAP is the exec stop: from there on the tracee dies with its tracer.
pub fn resume_traced(pid: Pid, sig: i32, attached: &mut bool) {
    if !*attached && sig == libc::SIGTRAP {
        *attached = true;
        let _ = ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL);
        let _ = ptrace::cont(pid, None::<Signal>);
        return;
    }
    let inject = if sig == libc::SIGTRAP {
        None
    } else {
        Signal::try_from(sig).ok()
    };
    let _ = ptrace::cont(pid, inject);
}

/// Replace the init's own termination with the program's, as relayed
pub fn apply_relayed(exit: &mut RawExit, status: i32) {
    if libc::WIFEXITED(status) {
        exit.exit_code = Some(libc::WEXITSTATUS(status));
        exit.signal = None;
    } else if libc::WIFSIGNALED(status) {
        exit.exit_code = None;
        exit.signal = Some(libc::WTERMSIG(status));
    }
}

fn check_limits(start: Instant, watch: &Watch<'_>) -> Option<KillReason> {
    if watch.cancel.is_cancelled() {
        return Some(KillReason::Cancelled);
    }
    if start.elapsed() > watch.wall_limit {
        return Some(KillReason::WallTime);
    }
    if watch.cgroup.memory_usage().max_usage_bytes > watch.memory_limit_bytes {
        return Some(KillReason::Memory);
    }
    None
}

/// Kill and reap a child that never got released
pub fn abort_child(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };
        if rc >= 0 || Errno::last() != Errno::EINTR {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_ms() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 345_678,
        };
        assert_eq!(timeval_ms(tv), 2345);
    }

    #[test]
    fn test_relayed_signal_replaces_init_exit() {
        let mut exit = RawExit {
            exit_code: Some(0),
            cpu_time_ms: 40,
            ..RawExit::default()
        };
        // raw status of a process killed by SIGSEGV
        apply_relayed(&mut exit, libc::SIGSEGV);
        assert_eq!(exit.signal, Some(libc::SIGSEGV));
        assert_eq!(exit.exit_code, None);
        assert_eq!(exit.cpu_time_ms, 40);
    }

    #[test]
    fn test_relayed_exit_code() {
        let mut exit = RawExit {
            exit_code: Some(0),
            ..RawExit::default()
        };
        // raw status of exit(3)
        apply_relayed(&mut exit, 3 << 8);
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.signal, None);
    }
}
