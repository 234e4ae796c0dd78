//! Configuration file loading (§6 of the spec).
//!
//! `config.json` lives at the "solution root" — the nearest ancestor of the
//! running executable that contains a `config.json` file. All other paths
//! in the config are resolved relative to that root's parent directory by
//! the caller; this module only loads and token-expands the raw values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerMapping {
    #[serde(rename = "ExecutablePath")]
    pub executable_path: String,
    #[serde(rename = "OutputDirectory")]
    pub output_directory: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub watch_directory: PathBuf,
    pub timeout_seconds: u64,
    pub max_retry_count: u32,
    pub log_directory: PathBuf,
    pub jobs_directory: PathBuf,
    pub queue_base_directory: PathBuf,
    pub mutex_name: String,
    pub mappings: HashMap<String, WorkerMapping>,
    #[serde(default = "default_true")]
    pub ignore_hidden_and_system_files: bool,
    #[serde(default)]
    pub default_worker_for_root: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Walk up from `start` looking for the nearest ancestor directory that
    /// contains a `config.json`, load and parse it.
    pub fn discover_and_load(start: &Path) -> Result<(Self, PathBuf), ConfigError> {
        let root = Self::discover_root(start).ok_or(ConfigError::NotFound)?;
        let path = root.join("config.json");
        let config = Self::load(&path)?;
        Ok((config, root))
    }

    fn discover_root(start: &Path) -> Option<PathBuf> {
        let mut dir = if start.is_file() {
            start.parent()?.to_path_buf()
        } else {
            start.to_path_buf()
        };
        loop {
            if dir.join("config.json").is_file() {
                return Some(dir);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Re-read only the two tunables the Processor is allowed to hot-reload
    /// (§4.4.d): `TimeoutSeconds` and `MaxRetryCount`. Any other change in
    /// the file is ignored by design — live config reload never mutates
    /// paths or mappings while a dispatch loop is running.
    pub fn reload_tunables(&mut self, path: &Path) -> Result<bool, ConfigError> {
        let fresh = Self::load(path)?;
        let changed =
            fresh.timeout_seconds != self.timeout_seconds || fresh.max_retry_count != self.max_retry_count;
        self.timeout_seconds = fresh.timeout_seconds;
        self.max_retry_count = fresh.max_retry_count;
        Ok(changed)
    }
}

/// Expand `{username}`, `{day}` and `$VAR`/`%VAR%`-style OS environment
/// variables embedded in a worker's `ExecutablePath`. An
/// `FILEJOBROUTER_WORKER_<KEY>` environment variable, if set, overrides the
/// configured path outright before expansion runs.
pub fn resolve_executable_path(
    worker_key: &str,
    mapping: &WorkerMapping,
    user: &str,
    day: chrono::NaiveDate,
) -> String {
    let override_var = format!("FILEJOBROUTER_WORKER_{}", worker_key.to_uppercase());
    let template = std::env::var(&override_var).unwrap_or_else(|_| mapping.executable_path.clone());

    let expanded = template
        .replace("{username}", user)
        .replace("{day}", &paths::day_string(day));

    expand_env_vars(&expanded)
}

/// Expand `$VAR` and `${VAR}` references against the current process
/// environment, leaving unknown references untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if braced {
                if next == '}' {
                    chars.next();
                    break;
                }
            } else if !(next.is_ascii_alphanumeric() || next == '_') {
                break;
            }
            name.push(next);
            chars.next();
        }
        match std::env::var(&name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if braced {
                    out.push('}');
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    const SAMPLE: &str = r#"{
        "WatchDirectory": "/w",
        "TimeoutSeconds": 30,
        "MaxRetryCount": 2,
        "LogDirectory": "/logs",
        "JobsDirectory": "/jobs",
        "QueueBaseDirectory": "/queue",
        "MutexName": "FileJobRouterDevice",
        "Mappings": {
            "abc": {"ExecutablePath": "/bin/abc", "OutputDirectory": "/out/abc"}
        },
        "IgnoreHiddenAndSystemFiles": true,
        "DefaultWorkerForRoot": "abc"
    }"#;

    #[test]
    fn loads_well_formed_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.max_retry_count, 2);
        assert_eq!(config.default_worker_for_root.as_deref(), Some("abc"));
        assert!(config.mappings.contains_key("abc"));
    }

    #[test]
    fn discovers_root_from_nested_start_dir() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), SAMPLE);
        let nested = dir.path().join("bin").join("sub");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, root) = Config::discover_and_load(&nested).unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(config.timeout_seconds, 30);
    }

    #[test]
    fn discover_fails_when_no_ancestor_has_config() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let result = Config::discover_and_load(&nested);
        assert!(matches!(result, Err(ConfigError::NotFound)));
    }

    #[test]
    fn reload_tunables_only_touches_timeout_and_retry() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let mut config = Config::load(&path).unwrap();

        let updated = SAMPLE.replace("\"TimeoutSeconds\": 30", "\"TimeoutSeconds\": 99");
        write_config(dir.path(), &updated);

        let changed = config.reload_tunables(&path).unwrap();
        assert!(changed);
        assert_eq!(config.timeout_seconds, 99);
        assert_eq!(config.watch_directory, PathBuf::from("/w"));
    }

    #[test]
    fn expands_username_and_day_tokens() {
        let mapping = WorkerMapping {
            executable_path: "/opt/{username}/{day}/run".into(),
            output_directory: "/out".into(),
        };
        let day = chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let resolved = resolve_executable_path("abc", &mapping, "alice", day);
        assert_eq!(resolved, "/opt/alice/2026-07-28/run");
    }

    #[test]
    #[serial]
    fn worker_env_override_wins_over_mapping() {
        let mapping = WorkerMapping {
            executable_path: "/opt/default".into(),
            output_directory: "/out".into(),
        };
        std::env::set_var("FILEJOBROUTER_WORKER_ABC", "/opt/overridden");
        let day = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let resolved = resolve_executable_path("abc", &mapping, "alice", day);
        std::env::remove_var("FILEJOBROUTER_WORKER_ABC");
        assert_eq!(resolved, "/opt/overridden");
    }

    #[test]
    #[serial]
    fn expands_plain_env_vars() {
        std::env::set_var("FJR_TEST_ROOT", "/srv/apps");
        let resolved = expand_env_vars("$FJR_TEST_ROOT/bin/run");
        std::env::remove_var("FJR_TEST_ROOT");
        assert_eq!(resolved, "/srv/apps/bin/run");
    }
}
