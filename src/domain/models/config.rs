//! Configuration model.
//!
//! The merged record produced by the loader and consumed read-only by the
//! pool, the intervention handler, the worktree manager, and the
//! surrounding orchestrator. Keys are camelCase to match the on-disk
//! YAML format (`~/.config/squad/config.yaml`, `.claude/squad.yaml`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Merged operating parameters for the agent-execution substrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Project display name; derived from the project root basename when absent.
    #[serde(default)]
    pub project_name: Option<String>,

    /// Defaults applied to newly spawned agents.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Process pool admission control.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Intervention detection and timeout behavior.
    #[serde(default)]
    pub interventions: InterventionConfig,

    /// Worktree pool behavior.
    #[serde(default)]
    pub worktrees: WorktreePoolConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to newly spawned agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsConfig {
    /// Model identifier handed to agent subprocesses.
    #[serde(default = "default_model")]
    pub model: String,

    /// How many agents the orchestrator runs at once.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
}

fn default_model() -> String {
    "sonnet".to_string()
}

const fn default_max_concurrent_agents() -> usize {
    3
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_concurrent_agents: default_max_concurrent_agents(),
        }
    }
}

/// Queue discipline for the process pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    /// Waiters dequeue in insertion order.
    Fifo,
    /// Higher priority first; ties broken by insertion order.
    Priority,
}

impl QueueStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
        }
    }
}

/// Process pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum subprocesses running at once (at least 1).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Waiter queue discipline.
    #[serde(default = "default_queue_strategy")]
    pub queue_strategy: QueueStrategy,
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_queue_strategy() -> QueueStrategy {
    QueueStrategy::Fifo
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_strategy: default_queue_strategy(),
        }
    }
}

/// Intervention handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionConfig {
    /// How long a request stays pending before timing out, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Pending requests allowed per agent before new detections are dropped.
    #[serde(default = "default_max_pending_per_agent")]
    pub max_pending_per_agent: usize,

    /// Disarm all request timers when false.
    #[serde(default = "default_timeouts_enabled")]
    pub timeouts_enabled: bool,
}

const fn default_timeout_ms() -> u64 {
    300_000
}

const fn default_max_pending_per_agent() -> usize {
    5
}

const fn default_timeouts_enabled() -> bool {
    true
}

impl InterventionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_pending_per_agent: default_max_pending_per_agent(),
            timeouts_enabled: default_timeouts_enabled(),
        }
    }
}

/// Worktree pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreePoolConfig {
    /// Directory that hosts all managed worktrees.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Live allocations allowed per repository.
    #[serde(default = "default_max_per_repo")]
    pub max_per_repo: usize,

    /// Idle time after which an allocation counts as stale, in milliseconds.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Reclaim stale allocations automatically when capacity is needed.
    #[serde(default = "default_auto_cleanup")]
    pub auto_cleanup: bool,
}

fn default_base_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from(".squad/worktrees"),
        |dir| dir.join("squad").join("worktrees"),
    )
}

const fn default_max_per_repo() -> usize {
    8
}

const fn default_stale_threshold_ms() -> u64 {
    3_600_000
}

const fn default_auto_cleanup() -> bool {
    true
}

impl WorktreePoolConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

impl Default for WorktreePoolConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            max_per_repo: default_max_per_repo(),
            stale_threshold_ms: default_stale_threshold_ms(),
            auto_cleanup: default_auto_cleanup(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.model, "sonnet");
        assert_eq!(config.defaults.max_concurrent_agents, 3);
        assert_eq!(config.pool.max_concurrent, 4);
        assert_eq!(config.pool.queue_strategy, QueueStrategy::Fifo);
        assert_eq!(config.interventions.max_pending_per_agent, 5);
        assert!(config.interventions.timeouts_enabled);
        assert_eq!(config.worktrees.max_per_repo, 8);
        assert!(config.worktrees.auto_cleanup);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
projectName: demo
defaults:
  model: opus
  maxConcurrentAgents: 7
pool:
  maxConcurrent: 2
  queueStrategy: priority
interventions:
  defaultTimeoutMs: 1000
  maxPendingPerAgent: 2
  timeoutsEnabled: false
worktrees:
  baseDir: /tmp/squad-worktrees
  maxPerRepo: 3
  staleThresholdMs: 500
  autoCleanup: false
logging:
  level: debug
  format: json
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.project_name.as_deref(), Some("demo"));
        assert_eq!(config.defaults.model, "opus");
        assert_eq!(config.defaults.max_concurrent_agents, 7);
        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.pool.queue_strategy, QueueStrategy::Priority);
        assert_eq!(config.interventions.default_timeout(), Duration::from_secs(1));
        assert!(!config.interventions.timeouts_enabled);
        assert_eq!(config.worktrees.base_dir, PathBuf::from("/tmp/squad-worktrees"));
        assert_eq!(config.worktrees.max_per_repo, 3);
        assert_eq!(config.worktrees.stale_threshold(), Duration::from_millis(500));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_partial_yaml_uses_field_defaults() {
        let yaml = "pool:\n  maxConcurrent: 9\n";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.pool.max_concurrent, 9);
        assert_eq!(config.pool.queue_strategy, QueueStrategy::Fifo);
        assert_eq!(config.defaults.model, "sonnet");
    }

    #[test]
    fn test_invalid_queue_strategy_rejected() {
        let yaml = "pool:\n  queueStrategy: roundrobin\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
