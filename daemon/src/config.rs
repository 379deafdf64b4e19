use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Identity this node executes jobs for. Jobs whose `target_identity`
    /// differs are never touched.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_poll_interval", with = "common::duration::serde_str")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

fn default_bind_addr() -> String { common::DEFAULT_API_ADDR.to_string() }
fn default_poll_interval() -> Duration { Duration::from_secs(10) }
fn default_max_concurrent() -> u32 { 3 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            poll_interval: default_poll_interval(),
            max_concurrent_jobs: default_max_concurrent(),
            execution_mode: ExecutionMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_timeout", with = "common::duration::serde_str")]
    pub timeout: Duration,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
    /// When non-empty, the first word of every script line must be listed here.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
    /// Parent directory for per-job work dirs. System temp dir when unset.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    /// Persistent per-job output dirs live under `<output_root>/<job id>`.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_cpu_seconds: Option<u64>,
    #[serde(default)]
    pub min_free_memory_mb: Option<u64>,
    /// Age after which a RUNNING job is reported as stale. Defaults to 3x timeout.
    #[serde(default, with = "optional_duration")]
    pub stale_after: Option<Duration>,
}

fn default_interpreter() -> String { "bash".to_string() }
fn default_timeout() -> Duration { Duration::from_secs(300) }
fn default_max_output_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_script_bytes() -> usize { 1024 * 1024 }
fn default_blocked_commands() -> Vec<String> {
    [
        "rm", "rmdir", "del", "format", "fdisk", "mkfs", "dd", "chmod", "chown", "sudo", "su",
        "passwd", "crontab", "at", "systemctl", "service",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_blocked_patterns() -> Vec<String> {
    vec![":(){".to_string(), "/etc/shadow".to_string(), "/dev/sd".to_string()]
}
fn default_env_allowlist() -> Vec<String> {
    ["PATH", "LANG", "LC_ALL", "TZ"].iter().map(|s| s.to_string()).collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout: default_timeout(),
            max_output_bytes: default_max_output_bytes(),
            max_script_bytes: default_max_script_bytes(),
            blocked_commands: default_blocked_commands(),
            allowed_commands: Vec::new(),
            blocked_patterns: default_blocked_patterns(),
            env_allowlist: default_env_allowlist(),
            work_root: None,
            output_root: None,
            max_memory_mb: None,
            max_cpu_seconds: None,
            min_free_memory_mb: None,
            stale_after: None,
        }
    }
}

impl SandboxConfig {
    pub fn stale_after(&self) -> Duration {
        self.stale_after.unwrap_or(self.timeout.saturating_mul(3))
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.max_memory_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

mod optional_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&common::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| common::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    /// Separate file for job stdout/stderr summaries.
    pub jobs_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            jobs_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_completed_after", with = "common::duration::serde_str")]
    pub completed_after: Duration,
}

fn default_completed_after() -> Duration { Duration::from_secs(30 * 86_400) }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_after: default_completed_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        let config = match ext {
            "yaml" | "yml" => Self::from_yaml_file(path)?,
            "toml" => Self::from_toml_file(path)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        };
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        Ok(config)
    }

    /// Rejects values the dispatcher loop and the sandbox cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.poll_interval.is_zero() {
            anyhow::bail!("server.poll_interval must be greater than zero");
        }
        if self.sandbox.timeout.is_zero() {
            anyhow::bail!("sandbox.timeout must be greater than zero");
        }
        Ok(())
    }

    /// Load `path` if given, else the system config if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let system = Path::new(common::DEFAULT_CONFIG_PATH);
                if system.exists() {
                    Self::from_file(system)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Identity precedence: explicit override, `SANDRUN_IDENTITY`, config file.
    pub fn resolve_identity(&mut self, cli_identity: Option<String>) -> Result<String> {
        let identity = cli_identity
            .or_else(|| std::env::var("SANDRUN_IDENTITY").ok())
            .or_else(|| self.node.identity.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("No node identity configured (set node.identity, SANDRUN_IDENTITY or --identity)")
            })?;
        self.node.identity = Some(identity.clone());
        Ok(identity)
    }

    pub fn queue_dir(&self) -> PathBuf {
        if let Some(dir) = &self.node.queue_dir {
            return dir.clone();
        }
        let system = Path::new(common::DEFAULT_QUEUE_DIR);
        if system.parent().map(|p| p.exists()).unwrap_or(false) {
            system.to_path_buf()
        } else {
            PathBuf::from(common::USER_QUEUE_DIR)
        }
    }
}
