// Judge node configuration, loaded from config/judge.json
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/judge.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub node_id: String,
    pub redis_url: String,
    pub languages_path: PathBuf,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub problem_service: ProblemServiceConfig,
    pub paths: PathsConfig,
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub task_stream: String,
    pub result_stream: String,
    pub status_stream: String,
    pub dead_letter_stream: String,
    pub consumer_group: String,
    pub read_count: usize,
    pub read_block_ms: usize,
    pub commit_interval_ms: u64,
    pub max_read_failures: u32,
    pub read_backoff_ms: u64,
    pub max_read_backoff_ms: u64,
    pub status_batch_size: usize,
    pub status_batch_timeout_ms: u64,
    pub status_queue_size: usize,
    pub stream_max_len: usize,
    pub result_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub queue_size: usize,
    pub task_timeout_secs: u64,
    pub retry_times: u32,
    pub retry_interval_secs: u64,
    pub dispatch_interval_ms: u64,
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
    pub avg_task_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemServiceConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub work_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enable_seccomp: bool,
    pub enable_chroot: bool,
    pub chroot_dir: Option<PathBuf>,
    pub enable_namespaces: bool,
    pub jail_uid: u32,
    pub jail_gid: u32,
    pub max_processes: u64,
    pub cgroup_root: PathBuf,
    pub cgroup_prefix: String,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub cpu_shares: u64,
    pub cpu_period_us: u64,
    pub blkio_weight: u16,
    pub limit_address_space: bool,
    pub enable_memsw: bool,
    pub drain_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_time_limit_ms: u64,
    pub max_memory_limit_mb: u64,
    pub max_output_size_kb: u64,
    pub max_stack_size_kb: u64,
    pub max_file_size_kb: u64,
    pub max_code_length: usize,
    pub forbidden_patterns: Vec<String>,
    pub compile_memory_mb: u64,
    pub compile_file_size_kb: u64,
    pub compile_message_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        let node = uuid::Uuid::new_v4().simple().to_string();
        Self {
            node_id: format!("judge-{}", &node[..8]),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            languages_path: PathBuf::from("config/languages.json"),
            bus: BusConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            problem_service: ProblemServiceConfig::default(),
            paths: PathsConfig::default(),
            sandbox: SandboxConfig::default(),
            limits: LimitsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            task_stream: "judge_task".to_string(),
            result_stream: "judge_result".to_string(),
            status_stream: "status_update".to_string(),
            dead_letter_stream: "dead_letter".to_string(),
            consumer_group: "judge-workers".to_string(),
            read_count: 16,
            read_block_ms: 1000,
            commit_interval_ms: 1000,
            max_read_failures: 10,
            read_backoff_ms: 100,
            max_read_backoff_ms: 10_000,
            status_batch_size: 64,
            status_batch_timeout_ms: 100,
            status_queue_size: 1024,
            stream_max_len: 100_000,
            result_ttl_secs: 86_400,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_size: 1000,
            task_timeout_secs: 300,
            retry_times: 2,
            retry_interval_secs: 5,
            dispatch_interval_ms: 100,
            retention_hours: 24,
            sweep_interval_secs: 600,
            avg_task_seconds: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            deadline_secs: 600,
        }
    }
}

impl Default for ProblemServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/v1".to_string(),
            timeout_ms: 5000,
            max_retries: 3,
            backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/judge"),
            temp_dir: PathBuf::from("/tmp/judge"),
            data_dir: PathBuf::from("/var/lib/judge/data"),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enable_seccomp: true,
            enable_chroot: false,
            chroot_dir: None,
            enable_namespaces: true,
            jail_uid: 65534,
            jail_gid: 65534,
            max_processes: 64,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_prefix: "judge".to_string(),
            cpuset_cpus: "0".to_string(),
            cpuset_mems: "0".to_string(),
            cpu_shares: 1024,
            cpu_period_us: 100_000,
            blkio_weight: 500,
            limit_address_space: false,
            enable_memsw: true,
            drain_timeout_ms: 5000,
            poll_interval_ms: 5,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_time_limit_ms: 10_000,
            max_memory_limit_mb: 1024,
            max_output_size_kb: 10 * 1024,
            max_stack_size_kb: 256 * 1024,
            max_file_size_kb: 10 * 1024,
            max_code_length: 64 * 1024,
            forbidden_patterns: vec![],
            compile_memory_mb: 512,
            compile_file_size_kb: 50 * 1024,
            compile_message_limit: 64 * 1024,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8089".to_string(),
        }
    }
}

impl JudgeConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Judge config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: JudgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Load from `JUDGE_CONFIG` (or the default path) and apply environment
    /// overrides. A missing default file yields the built-in defaults.
    pub fn load_default() -> Result<Self> {
        let mut config = match std::env::var("JUDGE_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) -> Result<()> {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(node_id) = lookup("JUDGE_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(workers) = lookup("JUDGE_MAX_WORKERS") {
            self.scheduler.max_workers = workers
                .parse()
                .with_context(|| format!("JUDGE_MAX_WORKERS is not a number: {}", workers))?;
        }
        if let Some(url) = lookup("JUDGE_PROBLEM_SERVICE_URL") {
            self.problem_service.base_url = url;
        }
        Ok(())
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id cannot be empty");
        }
        if self.scheduler.max_workers == 0 {
            bail!("scheduler.max_workers must be at least 1");
        }
        if self.scheduler.queue_size == 0 {
            bail!("scheduler.queue_size must be at least 1");
        }
        if self.limits.max_time_limit_ms == 0 || self.limits.max_memory_limit_mb == 0 {
            bail!("limits.max_time_limit_ms and limits.max_memory_limit_mb must be positive");
        }
        if self.sandbox.enable_chroot && self.sandbox.chroot_dir.is_none() {
            bail!("sandbox.enable_chroot requires sandbox.chroot_dir");
        }
        if self.sandbox.poll_interval_ms == 0 {
            bail!("sandbox.poll_interval_ms must be positive");
        }
        Ok(())
    }
}
