use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pairpref_blob::{BlobLocation, RequestPrices};
use pairpref_core::{FIRE_CELL, MAX_QUESTIONS};
use serde::{Deserialize, Serialize};

/// Runtime settings, read from an optional TOML file and then overridden by
/// command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Blob location holding the database, e.g. `s3://bucket` or `file://./data`.
    pub remote: String,
    pub cache_dir: PathBuf,
    /// Name of the database blob inside `remote`.
    pub database: String,
    /// Blob location holding `user_<id>.json` rater files.
    pub raters: String,
    pub max_questions: usize,
    pub hazard_marker: i64,
    pub log_level: String,
    pub prices: Option<RequestPrices>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: "file://./data".to_string(),
            cache_dir: std::env::temp_dir().join("pairpref"),
            database: "experiments.db".to_string(),
            raters: "file://./data/raters".to_string(),
            max_questions: MAX_QUESTIONS,
            hazard_marker: FIRE_CELL,
            log_level: "info".to_string(),
            prices: Some(RequestPrices {
                cheap_cents: 0.04,
                expensive_cents: 0.5,
            }),
        }
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (label, location) in [("remote", &config.remote), ("raters", &config.raters)] {
        location
            .parse::<BlobLocation>()
            .map_err(|err| anyhow!("{label} is not a valid blob location: {err}"))?;
    }
    if config.database.trim().is_empty() || config.database.contains('/') {
        return Err(anyhow!(
            "database must be a plain blob name, got {:?}",
            config.database
        ));
    }
    if config.max_questions == 0 {
        return Err(anyhow!("max_questions must be at least 1"));
    }
    if config.log_level.trim().is_empty() {
        return Err(anyhow!("log_level must be non-empty"));
    }
    if let Some(prices) = config.prices {
        if prices.cheap_cents < 0.0 || prices.expensive_cents < 0.0 {
            return Err(anyhow!("prices must not be negative"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create scratch dir: {err}"),
        };
        let path = dir.path().join("pairpref.toml");
        if let Err(err) = std::fs::write(&path, body) {
            panic!("failed to write config: {err}");
        }
        (dir, path)
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let (_dir, path) = write_config(
            r#"
remote = "s3://mrl-experiment-sqlite"
max_questions = 12

[prices]
cheap_cents = 0.1
expensive_cents = 1.0
"#,
        );

        let config = must(load(&path));
        assert_eq!(config.remote, "s3://mrl-experiment-sqlite");
        assert_eq!(config.max_questions, 12);
        assert_eq!(config.database, "experiments.db");
        assert_eq!(config.hazard_marker, FIRE_CELL);
        assert_eq!(
            config.prices,
            Some(RequestPrices {
                cheap_cents: 0.1,
                expensive_cents: 1.0,
            })
        );
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let (_dir, path) = write_config("remote = \"file://x\"\nsurprise = 1\n");
        assert!(load(&path).is_err());

        let (_dir, path) = write_config("remote = \"ftp://host/db\"\n");
        assert!(load(&path).is_err());

        let (_dir, path) = write_config("database = \"nested/experiments.db\"\n");
        assert!(load(&path).is_err());

        let (_dir, path) = write_config("max_questions = 0\n");
        assert!(load(&path).is_err());
    }

    #[test]
    fn defaults_validate() {
        must(validate(&Config::default()));
    }
}
