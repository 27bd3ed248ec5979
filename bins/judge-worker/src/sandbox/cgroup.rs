// Per-execution cgroup v1 group under <prefix>/<language>/<taskgroup>
use std::thread;
use std::time::{Duration, Instant};

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::hierarchies::V1;
use cgroups_rs::memory::MemController;
use cgroups_rs::{Cgroup, CgroupPid, MaxValue};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use judge_common::config::SandboxConfig;

use super::SandboxError;

const SUBSYSTEMS: [&str; 5] = ["memory", "cpu", "cpuset", "pids", "blkio"];

/// Limits applied to one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimits {
    pub memory_bytes: i64,
    pub max_processes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub max_usage_bytes: u64,
    pub fail_count: u64,
}

/// Owns a cgroup for the lifetime of one execution. Dropping it kills
/// leftover tasks, waits for the group to drain and removes it.
pub struct CgroupGuard {
    name: String,
    cgroup: Cgroup,
    drain_timeout: Duration,
}

pub fn group_name(prefix: &str, group: &str) -> String {
    format!("{}/{}", prefix.trim_matches('/'), group.trim_matches('/'))
}

impl CgroupGuard {
    pub fn create(
        config: &SandboxConfig,
        group: &str,
        limits: &CgroupLimits,
    ) -> Result<Self, SandboxError> {
        let name = group_name(&config.cgroup_prefix, group);
        debug!(cgroup = %name, memory_bytes = limits.memory_bytes, "Creating cgroup");

        let memory = CgroupBuilder::new(&name)
            .memory()
            .memory_hard_limit(limits.memory_bytes);
        let memory = if config.enable_memsw {
            memory.memory_swap_limit(limits.memory_bytes)
        } else {
            memory
        };

        let builder = memory
            .done()
            .cpu()
            .shares(config.cpu_shares)
            .period(config.cpu_period_us)
            .quota(config.cpu_period_us as i64)
            .cpus(config.cpuset_cpus.clone())
            .mems(config.cpuset_mems.clone())
            .done()
            .pid()
            .maximum_number_of_processes(MaxValue::Value(limits.max_processes))
            .done()
            .blkio()
            .weight(config.blkio_weight)
            .done()
            .set_specified_controllers(SUBSYSTEMS.iter().map(|s| s.to_string()).collect());

        let cgroup = builder
            .build(Box::new(V1::new()))
            .map_err(|e| SandboxError::Cgroup(format!("create {}: {}", name, e)))?;

        Ok(CgroupGuard {
            name,
            cgroup,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Place `pid` into every subsystem of the group
    pub fn add_process(&self, pid: Pid) -> Result<(), SandboxError> {
        self.cgroup
            .add_task(CgroupPid::from(pid.as_raw() as u64))
            .map_err(|e| SandboxError::Cgroup(format!("attach {} to {}: {}", pid, self.name, e)))
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        match self.cgroup.controller_of::<MemController>() {
            Some(memory) => {
                let stat = memory.memory_stat();
                MemoryUsage {
                    max_usage_bytes: stat.max_usage_in_bytes,
                    fail_count: stat.fail_cnt,
                }
            }
            None => MemoryUsage::default(),
        }
    }

    fn kill_remaining(&self) -> usize {
        let tasks = self.cgroup.tasks();
        for task in &tasks {
            let _ = kill(Pid::from_raw(task.pid as i32), Signal::SIGKILL);
        }
        tasks.len()
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        let deadline = Instant::now() + self.drain_timeout;
        while self.kill_remaining() > 0 {
            if Instant::now() >= deadline {
                warn!(cgroup = %self.name, "Cgroup did not drain before timeout");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        match self.cgroup.delete() {
            Ok(()) => debug!(cgroup = %self.name, "Removed cgroup"),
            Err(e) => warn!(cgroup = %self.name, error = %e, "Failed to remove cgroup"),
        }
    }
}
