use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;
use crate::fsutil::Promote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactorConfig {
    /// Minimum number of new fragments that triggers a merge.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Merge anyway once this long has passed since the last update.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Period between polling sweeps.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Minimum period between registry-wide GC sweeps.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    /// Persist the registry snapshot every N processed activities.
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    #[serde(default = "default_state_path")]
    pub local_state_path: PathBuf,
    #[serde(default = "default_remote_state_path")]
    pub remote_state_path: String,
    /// Compute and log deletions without issuing them.
    #[serde(default)]
    pub remove_dry_run: bool,
    #[serde(default)]
    pub promote: Promote,
    /// Forget activities that fail the consistency check.
    #[serde(default)]
    pub recovery: bool,
    #[serde(default = "default_activity_types")]
    pub activity_types: Vec<String>,
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_delay_ms: default_max_delay_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            save_every: default_save_every(),
            local_state_path: default_state_path(),
            remote_state_path: default_remote_state_path(),
            remove_dry_run: false,
            promote: Promote::default(),
            recovery: false,
            activity_types: default_activity_types(),
            output: OutputMode::default(),
            store: StoreConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

/// Where merged traces are distributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// `<users_dir>/<owner>/<activity>/<traces_file>` for every owner.
    #[default]
    Owners,
    /// `<outputs_dir>/<activity>/<traces_file>`, once per activity.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_topics_dir")]
    pub topics_dir: String,
    #[serde(default = "default_traces_topic")]
    pub traces_topic: String,
    #[serde(default = "default_users_dir")]
    pub users_dir: String,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: String,
    #[serde(default = "default_traces_file")]
    pub traces_file: String,
    /// Directory backing the bucket for the filesystem store.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            topics_dir: default_topics_dir(),
            traces_topic: default_traces_topic(),
            users_dir: default_users_dir(),
            outputs_dir: default_outputs_dir(),
            traces_file: default_traces_file(),
            root: default_store_root(),
        }
    }
}

impl StoreConfig {
    /// Listing prefix for an activity's trace fragments.
    #[must_use]
    pub fn traces_prefix(&self, activity_id: &str) -> String {
        format!(
            "{}/{}/_id={activity_id}/",
            self.topics_dir, self.traces_topic
        )
    }

    /// Distributed output for one owner.
    #[must_use]
    pub fn owner_output_path(&self, owner: &str, activity_id: &str) -> String {
        format!(
            "{}/{owner}/{activity_id}/{}",
            self.users_dir, self.traces_file
        )
    }

    /// Distributed output shared by all owners.
    #[must_use]
    pub fn shared_output_path(&self, activity_id: &str) -> String {
        format!("{}/{activity_id}/{}", self.outputs_dir, self.traces_file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_directory_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_directory_user")]
    pub username: String,
    #[serde(default = "default_directory_password")]
    pub password: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_directory_host(),
            port: None,
            username: default_directory_user(),
            password: default_directory_password(),
        }
    }
}

impl DirectoryConfig {
    /// Base URL, e.g. `https://simva-api.example.org:8443`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{port}", self.protocol, self.host),
            None => format!("{}://{}", self.protocol, self.host),
        }
    }
}

const fn default_batch_size() -> usize {
    500
}

const fn default_max_delay_ms() -> u64 {
    5 * 60 * 1000
}

const fn default_refresh_interval_ms() -> u64 {
    10 * 60 * 1000
}

const fn default_gc_interval_ms() -> u64 {
    24 * 60 * 60 * 1000
}

const fn default_save_every() -> usize {
    5
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state")
}

fn default_remote_state_path() -> String {
    "state".to_string()
}

fn default_activity_types() -> Vec<String> {
    ["gameplay", "miniokafka", "rageminio"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_bucket() -> String {
    "traces".to_string()
}

fn default_topics_dir() -> String {
    "kafka-topics".to_string()
}

fn default_traces_topic() -> String {
    "traces".to_string()
}

fn default_users_dir() -> String {
    "users".to_string()
}

fn default_outputs_dir() -> String {
    "outputs".to_string()
}

fn default_traces_file() -> String {
    "traces_v2.json".to_string()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("bucket")
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_directory_host() -> String {
    "simva-api.simva.example.org".to_string()
}

fn default_directory_user() -> String {
    "admin".to_string()
}

fn default_directory_password() -> String {
    "password".to_string()
}

impl CompactorConfig {
    /// Load defaults, then the TOML file (if any), then environment overrides.
    ///
    /// With no explicit path, `<config_dir>/trace-compactor/config.toml` is
    /// used when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        toml::from_str::<Self>(&content).with_context(|| {
            format!(
                "{}: Failed to parse {}",
                ErrorCode::ConfigParseError,
                path.display()
            )
        })
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Variable names follow the deployment conventions (`BATCH_SIZE`,
    /// `MINIO_BUCKET`, `SIMVA_HOST`, ...). A value that does not parse is an
    /// error rather than a silent default.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = env("BATCH_SIZE") {
            self.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = env("MAX_DELAY") {
            self.max_delay_ms = parse_env("MAX_DELAY", &v)?;
        }
        if let Some(v) = env("REFRESH_INTERVAL") {
            self.refresh_interval_ms = parse_env("REFRESH_INTERVAL", &v)?;
        }
        if let Some(v) = env("GC_INTERVAL") {
            self.gc_interval_ms = parse_env("GC_INTERVAL", &v)?;
        }
        if let Some(v) = env("SAVE_EVERY") {
            self.save_every = parse_env("SAVE_EVERY", &v)?;
        }
        if let Some(v) = env("LOCAL_STATE") {
            self.local_state_path = PathBuf::from(v);
        }
        if let Some(v) = env("REMOTE_STATE") {
            self.remote_state_path = v;
        }
        if let Some(v) = env("REMOVE_DRY_RUN") {
            self.remove_dry_run = parse_bool("REMOVE_DRY_RUN", &v)?;
        }
        if let Some(v) = env("COPY_INSTEAD_OF_RENAME") {
            self.promote = if parse_bool("COPY_INSTEAD_OF_RENAME", &v)? {
                Promote::Copy
            } else {
                Promote::Rename
            };
        }
        if let Some(v) = env("RECOVERY") {
            self.recovery = parse_bool("RECOVERY", &v)?;
        }
        if let Some(v) = env("ACTIVITY_TYPES") {
            self.activity_types = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env("OUTPUT_MODE") {
            self.output = match v.trim().to_ascii_lowercase().as_str() {
                "owners" => OutputMode::Owners,
                "shared" => OutputMode::Shared,
                other => bail!(
                    "{}: OUTPUT_MODE must be `owners` or `shared`, got `{other}`",
                    ErrorCode::ConfigInvalid
                ),
            };
        }

        let store = &mut self.store;
        for (key, slot) in [
            ("MINIO_BUCKET", &mut store.bucket),
            ("MINIO_TOPICS_DIR", &mut store.topics_dir),
            ("MINIO_TRACES_TOPIC", &mut store.traces_topic),
            ("MINIO_USERS_DIR", &mut store.users_dir),
            ("MINIO_OUTPUTS_DIR", &mut store.outputs_dir),
            ("MINIO_TRACES_FILE", &mut store.traces_file),
        ] {
            if let Some(v) = env(key) {
                *slot = v;
            }
        }
        if let Some(v) = env("MINIO_ROOT") {
            store.root = PathBuf::from(v);
        }

        let directory = &mut self.directory;
        for (key, slot) in [
            ("SIMVA_PROTOCOL", &mut directory.protocol),
            ("SIMVA_HOST", &mut directory.host),
            ("SIMVA_USER", &mut directory.username),
            ("SIMVA_PASSWORD", &mut directory.password),
        ] {
            if let Some(v) = env(key) {
                *slot = v;
            }
        }
        if let Some(v) = env("SIMVA_PORT") {
            directory.port = Some(parse_env("SIMVA_PORT", &v)?);
        }

        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let code = ErrorCode::ConfigInvalid;
        if self.batch_size == 0 {
            bail!("{code}: batch_size must be at least 1");
        }
        if self.save_every == 0 {
            bail!("{code}: save_every must be at least 1");
        }
        if self.refresh_interval_ms == 0 {
            bail!("{code}: refresh_interval_ms must be positive");
        }
        if self.local_state_path.as_os_str().is_empty() {
            bail!("{code}: local_state_path must not be empty");
        }
        for (name, value) in [
            ("remote_state_path", &self.remote_state_path),
            ("store.bucket", &self.store.bucket),
            ("store.topics_dir", &self.store.topics_dir),
            ("store.traces_topic", &self.store.traces_topic),
            ("store.traces_file", &self.store.traces_file),
        ] {
            if value.trim().is_empty() {
                bail!("{code}: {name} must not be empty");
            }
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize config")
    }
}

/// `<config_dir>/trace-compactor/config.toml`, if a config dir exists.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("trace-compactor/config.toml"))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        anyhow::anyhow!("{}: {key}={raw:?} is not valid: {e}", ErrorCode::ConfigInvalid)
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!(
            "{}: {key}={raw:?} is not a boolean",
            ErrorCode::ConfigInvalid
        ),
    }
}
