use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

/// The paths searched for a configuration file when the user doesn't specify one.
const DEFAULT_CONFIG_PATHS: [&str; 1] = ["/etc/graft/graft.toml"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub general: General,
    pub storage: Storage,
    pub file_store: FileStore,
    pub task_queue: TaskQueue,
    pub notifier: Notifier,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct General {
    pub log_level: String,

    /// Key used to encrypt connection secrets at rest. Must be at least 32 characters.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileStore {
    pub engine: crate::file_store::Engine,
    pub sqlite: Option<crate::file_store::sqlite::Config>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskQueue {
    pub engine: crate::task_queue::Engine,
    pub in_process: Option<crate::task_queue::in_process::Config>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Notifier {
    pub engine: crate::notify::Engine,
    pub webhook: Option<crate::notify::webhook::Config>,
}

impl Config {
    /// Returns a fully layered configuration: embedded defaults, then the config file
    /// (an explicit path or the first default location), then `GRAFT_*` env vars.
    ///
    /// Env vars use `__` to separate levels, e.g. `GRAFT_GENERAL__LOG_LEVEL=debug`.
    pub fn parse(path_override: &Option<String>) -> Result<Config> {
        let default_config_raw = EmbeddedConfigFS::get("default_config.toml")
            .context("Embedded default configuration file missing")?;
        let default_config = std::str::from_utf8(&default_config_raw.data)
            .context("Embedded default configuration is not valid utf-8")?;

        let mut figment = Figment::new().merge(Toml::string(default_config));

        match path_override {
            Some(path) => {
                figment = figment.merge(Toml::file(path));
            }
            None => {
                for path in DEFAULT_CONFIG_PATHS {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let config: Config = figment
            .merge(Env::prefixed("GRAFT_").split("__"))
            .extract()
            .context("Could not parse configuration")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_default_config() {
        let config = Config::parse(&None).unwrap();

        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.storage.path, "/tmp/graft.db");
        assert_eq!(config.task_queue.engine, crate::task_queue::Engine::InProcess);

        let in_process = config.task_queue.in_process.unwrap();
        assert_eq!(in_process.workers, 4);
        assert_eq!(in_process.tick_interval, 60);
    }

    #[test]
    fn default_encryption_key_fits_the_cipher() {
        let config = Config::parse(&None).unwrap();
        assert_eq!(config.general.encryption_key.len(), 32);
    }
}
