//! Config-file resolution and small process utilities shared by
//! `bitswap-core` and `bitswap-cli`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum UtilError {
    #[error("no config directory available on this platform")]
    NoConfigDir,
    #[error("failed to build config: {0}")]
    Build(#[from] config::ConfigError),
    #[error("failed to install Ctrl-C handler: {0}")]
    Ctrlc(#[from] ctrlc::Error),
}

/// Resolves `~/.config/<app_name>/<file_name>` (or the platform
/// equivalent via `dirs_next`), without checking that it exists.
pub fn config_path(app_name: &str, file_name: &str) -> Result<PathBuf, UtilError> {
    let mut root = dirs_next::config_dir().ok_or(UtilError::NoConfigDir)?;
    root.push(app_name);
    root.push(file_name);
    Ok(root)
}

/// Layers `T::default()` under zero or more optional config files (missing
/// files are skipped, present-but-unreadable ones are not) under
/// environment variables prefixed `env_prefix` (`_` separating nested
/// keys) under `overrides`, then deserializes the merged result as `T`.
///
/// Mirrors the defaults → file → env → overrides precedence the teacher's
/// config loader uses.
pub fn make_config<T>(
    defaults: &T,
    sources: &[Option<PathBuf>],
    env_prefix: &str,
    overrides: HashMap<String, String>,
) -> Result<T, UtilError>
where
    T: Serialize + DeserializeOwned,
{
    let defaults = config::Config::try_from(defaults)?;
    let mut builder = config::Config::builder().add_source(defaults);

    for source in sources.iter().flatten() {
        if source.exists() {
            debug!(path = %source.display(), "loading config file");
            builder = builder.add_source(config::File::from(source.as_path()));
        } else {
            debug!(path = %source.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(config::Environment::with_prefix(env_prefix).separator("__"));

    for (key, value) in overrides {
        builder = builder.set_override(key, value)?;
    }

    builder.build()?.try_deserialize()
}

/// Installs a Ctrl-C handler that runs `on_shutdown` once and ignores
/// further signals (`ctrlc::set_handler` already does the latter).
pub fn trap_signals(on_shutdown: impl Fn() + Send + 'static) -> Result<(), UtilError> {
    ctrlc::set_handler(move || {
        warn!("received interrupt, shutting down");
        on_shutdown();
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        count: u32,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Sample {
                count: 1,
                name: "default".to_string(),
            }
        }
    }

    #[test]
    fn make_config_falls_back_to_defaults_with_no_sources() {
        let cfg: Sample = make_config(&Sample::default(), &[], "BITSWAP_TEST", HashMap::new()).unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn make_config_applies_overrides_over_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("count".to_string(), "42".to_string());
        let cfg: Sample = make_config(&Sample::default(), &[], "BITSWAP_TEST", overrides).unwrap();
        assert_eq!(cfg.count, 42);
        assert_eq!(cfg.name, "default");
    }

    #[test]
    fn missing_config_file_is_skipped_not_errored() {
        let sources = vec![Some(PathBuf::from("/nonexistent/bitswap-test-config.toml"))];
        let cfg: Sample = make_config(&Sample::default(), &sources, "BITSWAP_TEST", HashMap::new()).unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn config_file_overrides_defaults_env_overrides_file() {
        let dir = testdir::testdir!();
        let path = dir.join("sample.toml");
        std::fs::write(&path, "count = 7\nname = \"from-file\"\n").unwrap();

        temp_env::with_var("BITSWAP_TEST__COUNT", Some("99"), || {
            let cfg: Sample =
                make_config(&Sample::default(), &[Some(path.clone())], "BITSWAP_TEST", HashMap::new()).unwrap();
            assert_eq!(cfg.count, 99);
            assert_eq!(cfg.name, "from-file");
        });
    }

    #[cfg(unix)]
    #[test]
    fn trap_signals_invokes_shutdown_on_sigint() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        static INSTALLED: std::sync::Once = std::sync::Once::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        // ctrlc::set_handler may only be called once per process; guard so
        // repeated test runs in the same binary don't panic on reinstall.
        let mut installed_now = false;
        INSTALLED.call_once(|| {
            trap_signals(move || fired_clone.store(true, Ordering::SeqCst)).unwrap();
            installed_now = true;
        });
        if !installed_now {
            return;
        }

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
