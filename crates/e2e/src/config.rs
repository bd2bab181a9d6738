//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::playwright::PlaywrightConfig;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding one skeleton per template (`rsc-vite`, `rsc-parcel`)
    pub templates_dir: PathBuf,

    /// Parent directory for scaffolded projects (None = system temp dir)
    pub work_dir: Option<PathBuf>,

    /// Leave project directories on disk after each case
    pub keep_projects: bool,

    /// Output directory for results
    pub output_dir: PathBuf,

    /// Maximum number of cases executing at once
    pub concurrency: usize,

    /// Child process timing
    pub process: ProcessConfig,

    /// Build tool invocation
    pub tools: ToolConfig,

    /// Browser driver
    pub browser: PlaywrightConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
            work_dir: None,
            keep_projects: false,
            output_dir: PathBuf::from("test-results"),
            concurrency: 2,
            process: ProcessConfig::default(),
            tools: ToolConfig::default(),
            browser: PlaywrightConfig::default(),
        }
    }
}

/// Timing knobs for spawned build tools and servers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// How long a server gets to accept its first connection
    pub readiness_timeout_secs: u64,

    /// Delay between readiness probes
    pub poll_interval_ms: u64,

    /// Timeout for a single TCP connect attempt
    pub connect_timeout_ms: u64,

    /// Upper bound for a production build
    pub build_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL on stop
    pub shutdown_grace_ms: u64,

    /// How long a server must stay alive after its port first answers
    pub settle_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 60,
            poll_interval_ms: 100,
            connect_timeout_ms: 500,
            build_timeout_secs: 300,
            shutdown_grace_ms: 500,
            settle_ms: 500,
        }
    }
}

impl ProcessConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// How the build tools are reached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Package manager used to run the template's scripts
    pub package_manager: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            package_manager: "pnpm".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `RSC_E2E_*` overrides from the process environment
    pub fn apply_env(&mut self) -> E2eResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> E2eResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RSC_E2E_TEMPLATES_DIR") {
            self.templates_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RSC_E2E_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(dir));
        }
        if let Some(keep) = lookup("RSC_E2E_KEEP_PROJECTS") {
            self.keep_projects = parse_flag("RSC_E2E_KEEP_PROJECTS", &keep)?;
        }
        if let Some(pm) = lookup("RSC_E2E_PACKAGE_MANAGER") {
            self.tools.package_manager = pm;
        }
        if let Some(secs) = lookup("RSC_E2E_READINESS_TIMEOUT_SECS") {
            self.process.readiness_timeout_secs = parse_number("RSC_E2E_READINESS_TIMEOUT_SECS", &secs)?;
        }
        if let Some(n) = lookup("RSC_E2E_CONCURRENCY") {
            self.concurrency = parse_number("RSC_E2E_CONCURRENCY", &n)?;
        }
        Ok(())
    }

    /// Reject settings that would make a run hang or never start
    pub fn validate(&self) -> E2eResult<()> {
        if self.concurrency == 0 {
            return Err(E2eError::Config("concurrency must be at least 1".to_string()));
        }
        if self.process.readiness_timeout_secs == 0 || self.process.build_timeout_secs == 0 {
            return Err(E2eError::Config("process timeouts must be non-zero".to_string()));
        }
        if self.browser.script_timeout_secs == 0 {
            return Err(E2eError::Config("browser.script_timeout_secs must be non-zero".to_string()));
        }
        if self.tools.package_manager.trim().is_empty() {
            return Err(E2eError::Config("tools.package_manager is empty".to_string()));
        }
        Ok(())
    }
}

/// `templates/` at the workspace root
fn default_templates_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("templates")
}

fn parse_flag(key: &str, value: &str) -> E2eResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(E2eError::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> E2eResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| E2eError::Config(format!("{key}: expected a number, got '{value}'")))
}
