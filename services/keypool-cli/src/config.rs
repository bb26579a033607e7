//! Configuration types and loading
//!
//! Config path precedence: `--config` > `KEYPOOL_CONFIG` env var > `keypool.toml`.
//! Keys come from the `KEYPOOL_KEYS` env var (comma-separated) or `keys_file`,
//! never from the TOML itself, so the config file can be shared without
//! leaking credentials.

use common::Secret;
use key_pool::PoolConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    /// Resolved key material, filled in by `load`.
    #[serde(skip)]
    pub resolved_keys: Vec<Secret<String>>,
}

/// Where pool state is persisted
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

/// Key source settings
#[derive(Debug, Default, Deserialize)]
pub struct KeysConfig {
    /// File with one key per line; blank lines and `#` comments are skipped.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file, then resolve keys.
    ///
    /// Key resolution order:
    /// 1. KEYPOOL_KEYS env var
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config
            .pool
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if config.storage.path.as_os_str().is_empty() {
            return Err(common::Error::Config("storage.path must not be empty".into()));
        }

        let keys = if let Ok(raw) = std::env::var("KEYPOOL_KEYS") {
            parse_key_list(&raw, ',')
        } else if let Some(ref keys_file) = config.keys.keys_file {
            let raw = std::fs::read_to_string(keys_file).map_err(|source| {
                common::Error::KeysFile {
                    path: keys_file.clone(),
                    source,
                }
            })?;
            parse_key_list(&raw, '\n')
        } else {
            Vec::new()
        };

        if keys.is_empty() {
            return Err(common::Error::Config(
                "no keys configured: set KEYPOOL_KEYS or keys.keys_file".into(),
            ));
        }
        config.resolved_keys = keys;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or KEYPOOL_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("KEYPOOL_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("keypool.toml")
    }

    /// Keys in configured order, ready to hand to the pool.
    pub fn key_list(&self) -> Vec<String> {
        self.resolved_keys
            .iter()
            .map(|k| k.expose().clone())
            .collect()
    }
}

fn parse_key_list(raw: &str, separator: char) -> Vec<Secret<String>> {
    raw.split(separator)
        .map(str::trim)
        .filter(|k| !k.is_empty() && !k.starts_with('#'))
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_pool::FallbackPolicy;
    use std::sync::Mutex;

    /// Serializes tests that touch KEYPOOL_KEYS / KEYPOOL_CONFIG.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("keypool.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn keys_from_file_skip_comments_and_blanks() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };

        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys");
        std::fs::write(&keys_path, "# primary\nsk-one\n\n  sk-two  \n#sk-disabled\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[storage]
path = "/var/lib/keypool/state.json"

[keys]
keys_file = "{}"
"#,
                keys_path.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.key_list(), vec!["sk-one", "sk-two"]);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/keypool/state.json")
        );
    }

    #[test]
    fn env_keys_take_precedence_over_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys");
        std::fs::write(&keys_path, "sk-file\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[storage]\npath = \"state.json\"\n[keys]\nkeys_file = \"{}\"\n",
                keys_path.display()
            ),
        );

        unsafe { set_env("KEYPOOL_KEYS", "sk-env-1, sk-env-2,") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };

        assert_eq!(config.key_list(), vec!["sk-env-1", "sk-env-2"]);
    }

    #[test]
    fn pool_section_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[pool]
rate_limit_cooldown_secs = 120
fallback = "soonest_recovery"

[storage]
path = "state.json"
"#,
        );

        unsafe { set_env("KEYPOOL_KEYS", "sk-a") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };

        assert_eq!(config.pool.rate_limit_cooldown_secs, 120);
        assert_eq!(config.pool.transient_cooldown_secs, 30);
        assert_eq!(config.pool.fallback, FallbackPolicy::SoonestRecovery);
    }

    #[test]
    fn missing_keys_is_config_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[storage]\npath = \"state.json\"\n");

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::Config(_)), "got: {err}");
    }

    #[test]
    fn unreadable_keys_file_names_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[storage]\npath = \"state.json\"\n[keys]\nkeys_file = \"/nonexistent/keys\"\n",
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/keys"), "got: {err}");
    }

    #[test]
    fn invalid_pool_section_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[pool]\nstorage_key = \"\"\n[storage]\npath = \"state.json\"\n",
        );

        unsafe { set_env("KEYPOOL_KEYS", "sk-a") };
        let result = Config::load(&path);
        unsafe { remove_env("KEYPOOL_KEYS") };

        assert!(matches!(result, Err(common::Error::Config(_))));
    }

    #[test]
    fn missing_storage_section_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[pool]\n");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = Config::load(Path::new("/nonexistent/path/keypool.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn resolved_keys_are_redacted_in_debug() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[storage]\npath = \"state.json\"\n");

        unsafe { set_env("KEYPOOL_KEYS", "sk-very-secret") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("KEYPOOL_KEYS") };

        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"), "got: {debug}");
    }

    #[test]
    fn resolve_path_prefers_cli_then_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("KEYPOOL_CONFIG", "/etc/keypool/env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/tmp/cli.toml")),
            PathBuf::from("/tmp/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/keypool/env.toml")
        );
        unsafe { remove_env("KEYPOOL_CONFIG") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("keypool.toml"));
    }
}
