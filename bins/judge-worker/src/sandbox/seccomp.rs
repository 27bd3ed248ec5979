// Classic BPF whitelist filter for seccomp
use nix::errno::Errno;
use nix::libc::{self, sock_filter, sock_fprog};

// BPF_LD | BPF_W | BPF_ABS
const BPF_LD_W_ABS: u16 = 0x20;
// BPF_JMP | BPF_JEQ | BPF_K
const BPF_JMP_JEQ_K: u16 = 0x15;
// BPF_JMP | BPF_JGE | BPF_K
const BPF_JMP_JGE_K: u16 = 0x35;
// BPF_RET | BPF_K
const BPF_RET_K: u16 = 0x06;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

/// Offsets into `struct seccomp_data`
const NR_OFFSET: u32 = 0;
const ARCH_OFFSET: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_003E);
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_00B7);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const AUDIT_ARCH: Option<u32> = None;

/// x32 ABI syscalls carry this bit on x86_64
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// Syscalls the target needs to start and terminate
const ALWAYS_ALLOWED: [libc::c_long; 3] = [libc::SYS_execve, libc::SYS_exit, libc::SYS_exit_group];

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Build the filter program for `whitelist`. Returns `None` on
/// architectures without a known audit arch value.
pub fn build_filter(whitelist: &[i64]) -> Option<Vec<sock_filter>> {
    let arch = AUDIT_ARCH?;

    let mut allowed: Vec<u32> = whitelist
        .iter()
        .copied()
        .chain(ALWAYS_ALLOWED.iter().map(|nr| *nr as i64))
        .filter(|nr| *nr >= 0)
        .map(|nr| nr as u32)
        .collect();
    allowed.sort_unstable();
    allowed.dedup();

    let mut program = Vec::with_capacity(6 + allowed.len() * 2);
    program.push(stmt(BPF_LD_W_ABS, ARCH_OFFSET));
    program.push(jump(BPF_JMP_JEQ_K, arch, 1, 0));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS));
    program.push(stmt(BPF_LD_W_ABS, NR_OFFSET));
    if cfg!(target_arch = "x86_64") {
        program.push(jump(BPF_JMP_JGE_K, X32_SYSCALL_BIT, 0, 1));
        program.push(stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS));
    }
    for nr in allowed {
        program.push(jump(BPF_JMP_JEQ_K, nr, 0, 1));
        program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    }
    program.push(stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS));

    Some(program)
}

/// Install the filter on the calling thread. Requires `PR_SET_NO_NEW_PRIVS`
/// (or CAP_SYS_ADMIN). Called in the child between clone and exec.
pub fn install(program: &[sock_filter]) -> Result<(), Errno> {
    let prog = sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_ptr() as *mut sock_filter,
    };
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as libc::c_ulong,
            &prog as *const sock_fprog as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}
