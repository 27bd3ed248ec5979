// Pipes used for the supervisor/child handshake.
//
// Both ends are opened close-on-exec: a successful exec in the child closes
// its copy, so an empty report pipe means the target started.
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::unistd::{self, close, pipe2};

pub struct SandboxPipe {
    read: RawFd,
    write: RawFd,
}

/// Supervisor side of the report pipe
pub struct ReportReader(RawFd);

/// Supervisor side of the go pipe
pub struct GoWriter(RawFd);

/// Supervisor side of the status pipe written by the namespace init
pub struct StatusReader(RawFd);

/// Failure reported by the child before exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFailure {
    pub step: String,
    pub errno: Errno,
}

impl std::fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.step, self.errno.desc())
    }
}

impl SandboxPipe {
    pub fn new() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(SandboxPipe { read, write })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read
    }

    pub fn write_fd(&self) -> RawFd {
        self.write
    }

    /// Keep the read end in the supervisor
    pub fn into_report_reader(self) -> ReportReader {
        let _ = close(self.write);
        let reader = ReportReader(self.read);
        std::mem::forget(self);
        reader
    }

    /// Keep the read end in the supervisor
    pub fn into_status_reader(self) -> StatusReader {
        let _ = close(self.write);
        let reader = StatusReader(self.read);
        std::mem::forget(self);
        reader
    }

    /// Keep the write end in the supervisor
    pub fn into_go_writer(self) -> GoWriter {
        let _ = close(self.read);
        let writer = GoWriter(self.write);
        std::mem::forget(self);
        writer
    }
}

impl Drop for SandboxPipe {
    fn drop(&mut self) {
        let _ = close(self.read);
        let _ = close(self.write);
    }
}

impl ReportReader {
    /// Read the child's failure report. Blocks until every write end is
    /// closed, which happens at exec or exit of the child.
    pub fn read_failure(&self) -> Option<ChildFailure> {
        let mut buf = [0u8; 128];
        let mut len = 0;
        loop {
            match unistd::read(self.0, &mut buf[len..]) {
                Ok(0) => break,
                Ok(n) => {
                    len += n;
                    if len == buf.len() {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        decode_failure(&buf[..len])
    }
}

impl Drop for ReportReader {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl StatusReader {
    /// Raw wait status of the program, as relayed by the init. `None` when
    /// the init died before relaying.
    pub fn read_status(&self) -> Option<i32> {
        let mut buf = [0u8; 4];
        let mut len = 0;
        while len < buf.len() {
            match unistd::read(self.0, &mut buf[len..]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        (len == buf.len()).then(|| i32::from_le_bytes(buf))
    }
}

impl Drop for StatusReader {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl GoWriter {
    /// Release the child. Dropping without calling this makes the child abort.
    pub fn release(self) -> nix::Result<()> {
        unistd::write(self.0, &[1u8]).map(|_| ())
    }
}

impl Drop for GoWriter {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

/// Child side: block until the supervisor releases us.
/// Returns false when the supervisor gave up.
pub fn child_wait_go(fd: RawFd) -> bool {
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
        if n == 1 {
            return true;
        }
        if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        return false;
    }
}

/// Child side: report a failed setup step. Allocation free.
pub fn child_report(fd: RawFd, step: &'static str, errno: Errno) {
    let mut buf = [0u8; 128];
    buf[..4].copy_from_slice(&(errno as i32).to_le_bytes());
    let step = step.as_bytes();
    let len = step.len().min(buf.len() - 4);
    buf[4..4 + len].copy_from_slice(&step[..len]);
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), 4 + len);
    }
}

/// Init side: hand the program's raw wait status to the supervisor
pub fn child_relay_status(fd: RawFd, status: libc::c_int) {
    let buf = status.to_le_bytes();
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

fn decode_failure(bytes: &[u8]) -> Option<ChildFailure> {
    if bytes.len() < 4 {
        return None;
    }
    let mut code = [0u8; 4];
    code.copy_from_slice(&bytes[..4]);
    Some(ChildFailure {
        step: String::from_utf8_lossy(&bytes[4..]).into_owned(),
        errno: Errno::from_i32(i32::from_le_bytes(code)),
    })
}
