// Code that runs in the cloned child between clone and exec.
//
// Everything here is prepared by the supervisor beforehand; the child only
// performs syscalls and never allocates or logs.
//
// In a new PID namespace the cloned child is PID 1, and the kernel drops
// default-action signals sent to it. It then stays behind as a minimal init:
// it forks the program, traces and reaps it, and relays its wait status.
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc::{self, sock_filter};
use nix::mount::{mount, MsFlags};
use nix::sys::ptrace;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, chroot, dup2, setgid, setgroups, setuid, Gid, Pid, Uid};

use super::pipe::{child_relay_status, child_report, child_wait_go};
use super::supervisor::resume_traced;

/// Exit code used when setup fails before exec
pub const SETUP_FAILED_EXIT: i32 = 127;

pub struct ChildPlan {
    pub program: CString,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    pub work_dir: PathBuf,
    /// (chroot root, bind target of the work dir inside it)
    pub chroot: Option<(PathBuf, PathBuf)>,
    pub new_mount_namespace: bool,
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
    /// (resource, soft, hard)
    pub rlimits: Vec<(Resource, u64, u64)>,
    pub uid: Uid,
    pub gid: Gid,
    pub filter: Option<Vec<sock_filter>>,
    pub go_fd: RawFd,
    pub report_fd: RawFd,
    /// Set when the child runs as namespace init
    pub status_fd: Option<RawFd>,
}

/// Pointer arrays for execve, built before clone
pub struct ExecArgs {
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

impl ExecArgs {
    pub fn new(plan: &ChildPlan) -> Self {
        let terminate = |strings: &[CString]| -> Vec<*const libc::c_char> {
            strings
                .iter()
                .map(|s| s.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect()
        };
        ExecArgs {
            argv: terminate(&plan.argv),
            envp: terminate(&plan.envp),
        }
    }
}

/// Entry point of the cloned child. Only returns on failure, or as init
/// once the program has been reaped.
pub fn run(plan: &ChildPlan, exec: &ExecArgs) -> isize {
    if !child_wait_go(plan.go_fd) {
        child_report(plan.report_fd, "wait for supervisor", Errno::ECANCELED);
        return SETUP_FAILED_EXIT as isize;
    }

    match plan.status_fd {
        Some(status_fd) => run_init(plan, exec, status_fd),
        None => exec_program(plan, exec),
    }
}

fn exec_program(plan: &ChildPlan, exec: &ExecArgs) -> isize {
    if let Err((step, errno)) = prepare(plan) {
        child_report(plan.report_fd, step, errno);
        return SETUP_FAILED_EXIT as isize;
    }

    unsafe {
        libc::execve(plan.program.as_ptr(), exec.argv.as_ptr(), exec.envp.as_ptr());
    }
    child_report(plan.report_fd, "execve", Errno::last());
    SETUP_FAILED_EXIT as isize
}

fn run_init(plan: &ChildPlan, exec: &ExecArgs, status_fd: RawFd) -> isize {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        child_report(plan.report_fd, "fork program", Errno::last());
        return SETUP_FAILED_EXIT as isize;
    }
    if pid == 0 {
        let code = exec_program(plan, exec);
        unsafe { libc::_exit(code as i32) }
    }

    match reap_program(Pid::from_raw(pid)) {
        Some(status) => {
            child_relay_status(status_fd, status);
            0
        }
        None => SETUP_FAILED_EXIT as isize,
    }
}

/// Wait for the traced program to terminate, resuming it at every stop.
/// Returns its raw wait status.
fn reap_program(pid: Pid) -> Option<libc::c_int> {
    let mut attached = false;
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };
        if rc < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return None;
        }
        if libc::WIFSTOPPED(status) {
            resume_traced(pid, libc::WSTOPSIG(status), &mut attached);
            continue;
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            return Some(status);
        }
    }
}

type StepResult = Result<(), (&'static str, Errno)>;

fn step<T>(name: &'static str, result: nix::Result<T>) -> StepResult {
    result.map(|_| ()).map_err(|errno| (name, errno))
}

fn prepare(plan: &ChildPlan) -> StepResult {
    if plan.new_mount_namespace {
        step(
            "make mounts private",
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            ),
        )?;
    }

    match &plan.chroot {
        Some((root, target)) => {
            step(
                "bind work dir",
                mount(
                    Some(plan.work_dir.as_path()),
                    target.as_path(),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                ),
            )?;
            step("chroot", chroot(root.as_path()))?;
            step("chdir", chdir(Path::new("/sandbox")))?;
        }
        None => step("chdir", chdir(plan.work_dir.as_path()))?,
    }

    step("redirect stdin", dup2(plan.stdin, libc::STDIN_FILENO))?;
    step("redirect stdout", dup2(plan.stdout, libc::STDOUT_FILENO))?;
    step("redirect stderr", dup2(plan.stderr, libc::STDERR_FILENO))?;

    for (resource, soft, hard) in &plan.rlimits {
        step("setrlimit", setrlimit(*resource, *soft, *hard))?;
    }

    step("setgroups", setgroups(&[plan.gid]))?;
    step("setgid", setgid(plan.gid))?;
    step("setuid", setuid(plan.uid))?;

    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        return Err(("no_new_privs", Errno::last()));
    }

    step("ptrace traceme", ptrace::traceme())?;

    if let Some(filter) = &plan.filter {
        super::seccomp::install(filter).map_err(|errno| ("seccomp", errno))?;
    }

    Ok(())
}

/// Resolve `program` the way execvp would, but in the supervisor.
/// With a chroot, PATH entries are looked up under the new root.
pub fn resolve_program(program: &str, path_env: &str, root: Option<&Path>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    path_env
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            let on_disk = match root {
                Some(root) => root.join(candidate.strip_prefix("/").unwrap_or(candidate)),
                None => candidate.clone(),
            };
            on_disk.is_file()
        })
}
