//! Configuration loading with hierarchical merging.
//!
//! Precedence (lowest to highest): built-in defaults, the user file under
//! the platform config directory, the project file under the project root,
//! then `SQUAD_`-prefixed environment variables. Maps are merged key-wise;
//! scalars and sequences are replaced, not concatenated.

use std::path::{Path, PathBuf};

use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use tracing::debug;

use crate::domain::error::{ConfigError, FieldError};
use crate::domain::models::config::Config;

/// Prefix for environment overrides, e.g. `SQUAD_DEFAULTS_MODEL=opus`.
pub const ENV_PREFIX: &str = "SQUAD_";

/// User config path relative to the platform config directory.
pub const USER_CONFIG_RELATIVE: &str = "squad/config.yaml";

/// Project config path relative to the project root.
pub const PROJECT_CONFIG_RELATIVE: &str = ".claude/squad.yaml";

/// Directories that mark a project root, in probe order.
const PROJECT_MARKERS: &[&str] = &[".git", ".claude"];

/// A configuration layer that contributed to the merged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    UserFile(PathBuf),
    ProjectFile(PathBuf),
    Environment,
}

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    /// Contributing layers, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Nearest ancestor of the start dir carrying a project marker,
    /// or the start dir itself.
    pub project_path: PathBuf,
}

/// One-shot configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate the merged configuration, starting from `start_dir`.
    pub fn load(start_dir: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
        let project_path = Self::find_project_root(start_dir.as_ref());
        let user_file = dirs::config_dir().map(|dir| dir.join(USER_CONFIG_RELATIVE));
        let project_file = project_path.join(PROJECT_CONFIG_RELATIVE);

        let mut sources = vec![ConfigSource::Defaults];
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(ref path) = user_file {
            if path.is_file() {
                Self::check_parsable(path)?;
                figment = figment.merge(Yaml::file(path));
                sources.push(ConfigSource::UserFile(path.clone()));
            }
        }
        if project_file.is_file() {
            Self::check_parsable(&project_file)?;
            figment = figment.merge(Yaml::file(&project_file));
            sources.push(ConfigSource::ProjectFile(project_file.clone()));
        }
        if let Some(overlay) = env_overlay(ENV_PREFIX) {
            figment = figment.merge(Yaml::string(&overlay));
            sources.push(ConfigSource::Environment);
        }

        let mut config: Config = figment.extract().map_err(|err| {
            let errors = err
                .into_iter()
                .map(|entry| {
                    FieldError::new(entry.path.join("."), entry.kind.to_string())
                })
                .collect();
            ConfigError::ValidationFailed { errors }
        })?;

        if config.project_name.is_none() {
            config.project_name = project_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }

        Self::validate(&config)?;
        debug!(
            project = %project_path.display(),
            layers = sources.len(),
            "configuration loaded"
        );
        Ok(LoadedConfig {
            config,
            sources,
            project_path,
        })
    }

    /// Walk upward from `start_dir` to the first directory carrying a
    /// project marker; fall back to `start_dir`.
    pub fn find_project_root(start_dir: &Path) -> PathBuf {
        let mut dir = start_dir;
        loop {
            if PROJECT_MARKERS
                .iter()
                .any(|marker| dir.join(marker).is_dir())
            {
                return dir.to_path_buf();
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return start_dir.to_path_buf(),
            }
        }
    }

    /// A present-but-unparseable source is fatal before merging.
    fn check_parsable(path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::SourceUnreadable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        serde_yaml::from_str::<serde_yaml::Value>(&text).map_err(|err| {
            ConfigError::SourceUnreadable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        })?;
        Ok(())
    }

    /// Validate the merged record, collecting every offending field.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if config.defaults.model.is_empty() {
            errors.push(FieldError::new("defaults.model", "must not be empty"));
        }
        if config.defaults.max_concurrent_agents < 1 {
            errors.push(FieldError::new(
                "defaults.maxConcurrentAgents",
                "must be at least 1",
            ));
        }
        if config.pool.max_concurrent < 1 {
            errors.push(FieldError::new("pool.maxConcurrent", "must be at least 1"));
        }
        if config.interventions.default_timeout_ms == 0 {
            errors.push(FieldError::new(
                "interventions.defaultTimeoutMs",
                "must be positive",
            ));
        }
        if config.interventions.max_pending_per_agent < 1 {
            errors.push(FieldError::new(
                "interventions.maxPendingPerAgent",
                "must be at least 1",
            ));
        }
        if config.worktrees.base_dir.as_os_str().is_empty() {
            errors.push(FieldError::new("worktrees.baseDir", "must not be empty"));
        }
        if config.worktrees.max_per_repo < 1 {
            errors.push(FieldError::new("worktrees.maxPerRepo", "must be at least 1"));
        }
        if config.worktrees.stale_threshold_ms == 0 {
            errors.push(FieldError::new(
                "worktrees.staleThresholdMs",
                "must be positive",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            errors.push(FieldError::new(
                "logging.level",
                "must be one of: trace, debug, info, warn, error",
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            errors.push(FieldError::new(
                "logging.format",
                "must be one of: json, pretty",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed { errors })
        }
    }
}

/// Render `PREFIX`-ed environment variables as a YAML overlay document.
///
/// The trailing variable name is split on underscore, lowercased, and
/// canonicalized into the config tree's camelCase keys; values parse as
/// boolean, integer, comma-list, or string, in that order.
fn env_overlay(prefix: &str) -> Option<String> {
    let mut root = serde_yaml::Mapping::new();
    let mut any = false;

    for (name, raw) in std::env::vars() {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let segments: Vec<String> = rest
            .split('_')
            .filter(|segment| !segment.is_empty())
            .map(|segment| canonical_segment(&segment.to_lowercase()).to_string())
            .collect();
        if segments.is_empty() {
            continue;
        }
        insert_path(&mut root, &segments, parse_env_value(&raw));
        any = true;
    }

    if !any {
        return None;
    }
    serde_yaml::to_string(&serde_yaml::Value::Mapping(root)).ok()
}

/// Map a lowercased env segment to the config tree's camelCase key.
fn canonical_segment(segment: &str) -> &str {
    match segment {
        "projectname" => "projectName",
        "maxconcurrentagents" => "maxConcurrentAgents",
        "maxconcurrent" => "maxConcurrent",
        "queuestrategy" => "queueStrategy",
        "defaulttimeoutms" => "defaultTimeoutMs",
        "maxpendingperagent" => "maxPendingPerAgent",
        "timeoutsenabled" => "timeoutsEnabled",
        "basedir" => "baseDir",
        "maxperrepo" => "maxPerRepo",
        "stalethresholdms" => "staleThresholdMs",
        "autocleanup" => "autoCleanup",
        other => other,
    }
}

fn insert_path(map: &mut serde_yaml::Mapping, segments: &[String], value: serde_yaml::Value) {
    let key = serde_yaml::Value::String(segments[0].clone());
    if segments.len() == 1 {
        map.insert(key, value);
        return;
    }
    let child = map
        .entry(key)
        .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    if !child.is_mapping() {
        *child = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    if let serde_yaml::Value::Mapping(child_map) = child {
        insert_path(child_map, &segments[1..], value);
    }
}

fn parse_env_value(raw: &str) -> serde_yaml::Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return serde_yaml::Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return serde_yaml::Value::Bool(false);
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return serde_yaml::Value::Number(int.into());
    }
    if trimmed.contains(',') {
        return serde_yaml::Value::Sequence(
            trimmed
                .split(',')
                .map(|item| serde_yaml::Value::String(item.trim().to_string()))
                .collect(),
        );
    }
    serde_yaml::Value::String(trimmed.to_string())
}
