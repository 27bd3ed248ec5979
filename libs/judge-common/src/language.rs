// Language recipes: how to compile and execute one language
use serde::{Deserialize, Serialize};

pub const SOURCE_PLACEHOLDER: &str = "{source}";
pub const EXECUTABLE_PLACEHOLDER: &str = "{executable}";
pub const MEMORY_PLACEHOLDER: &str = "{memory_limit}";

fn default_executable() -> String {
    "main".to_string()
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_compile_timeout() -> u64 {
    10_000
}

fn default_max_processes() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

/// Immutable per-language configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageRecipe {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    /// Extension without the leading dot
    pub file_extension: String,
    /// Overrides `main.<ext>` (e.g. `Main.java`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_command: Option<String>,
    pub execute_command: String,
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_ms: u64,
    #[serde(default = "default_multiplier")]
    pub time_multiplier: f64,
    #[serde(default = "default_multiplier")]
    pub memory_multiplier: f64,
    #[serde(default = "default_max_processes")]
    pub max_processes: u64,
    #[serde(default)]
    pub syscall_whitelist: Vec<i64>,
    #[serde(default = "default_true")]
    pub is_compiled: bool,
    #[serde(default = "default_true")]
    pub enable_seccomp: bool,
    /// Extra `KEY=VALUE` pairs for the jailed process
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageRecipe>,
}

impl LanguageRecipe {
    /// File name the source code is written to
    pub fn source_file_name(&self) -> String {
        match &self.source_file {
            Some(name) => name.clone(),
            None => format!("main.{}", self.file_extension.trim_start_matches('.')),
        }
    }

    /// Compile command split into program and arguments
    pub fn compile_argv(&self, source: &str, executable: &str) -> Option<Vec<String>> {
        let template = self.compile_command.as_deref()?;
        let argv = render(template, |token| {
            token
                .replace(SOURCE_PLACEHOLDER, source)
                .replace(EXECUTABLE_PLACEHOLDER, executable)
        });
        if argv.is_empty() {
            None
        } else {
            Some(argv)
        }
    }

    /// Execute command split into program and arguments.
    ///
    /// `memory_limit_mb` feeds runtimes that size their own heap (`-Xmx`).
    pub fn execute_argv(&self, source: &str, executable: &str, memory_limit_mb: u64) -> Vec<String> {
        let memory = memory_limit_mb.to_string();
        render(&self.execute_command, |token| {
            token
                .replace(SOURCE_PLACEHOLDER, source)
                .replace(EXECUTABLE_PLACEHOLDER, executable)
                .replace(MEMORY_PLACEHOLDER, &memory)
        })
    }

    /// `KEY=VALUE` pairs split on the first `=`
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Structural checks applied when recipes are loaded
    pub fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("language name cannot be empty".to_string());
        }
        if self.file_extension.trim().is_empty() {
            return Err(format!("language '{}' has no file extension", self.name));
        }
        if self.execute_command.split_whitespace().next().is_none() {
            return Err(format!("language '{}' has an empty execute command", self.name));
        }
        if self.is_compiled
            && self
                .compile_command
                .as_deref()
                .map_or(true, |c| c.split_whitespace().next().is_none())
        {
            return Err(format!(
                "language '{}' is compiled but has no compile command",
                self.name
            ));
        }
        if !(self.time_multiplier > 0.0) || !(self.memory_multiplier > 0.0) {
            return Err(format!(
                "language '{}' must have positive time and memory multipliers",
                self.name
            ));
        }
        if self.max_processes == 0 {
            return Err(format!("language '{}' must allow at least one process", self.name));
        }
        Ok(())
    }
}

fn render<F: Fn(&str) -> String>(template: &str, substitute: F) -> Vec<String> {
    template.split_whitespace().map(substitute).collect()
}
