//! Sync client configuration

use std::{
	io,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

pub const SYNC_CONFIG_FILE_NAME: &str = "sync_client.json";

const DEFAULT_SESSION_CLOSE_TIMEOUT_MS: u64 = 30_000;

/// When a closing session tears down its transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
	Immediately,
	#[default]
	AfterChangesUploaded,
}

/// Persisted settings of a sync client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,
	pub app_id: String,
	pub base_url: String,
	pub log_level: String,
	#[serde(default)]
	pub stop_policy: StopPolicy,
	/// Fail outstanding upload/download waits on non-fatal session errors
	#[serde(default)]
	pub cancel_waits_on_nonfatal_error: bool,
	#[serde(default = "default_session_close_timeout_ms")]
	pub session_close_timeout_ms: u64,
}

const fn default_session_close_timeout_ms() -> u64 {
	DEFAULT_SESSION_CLOSE_TIMEOUT_MS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to access config file <path='{}'>: {source}", .path.display())]
	FileIO {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("invalid config file: {0}")]
	SerdeJson(#[from] serde_json::Error),
	#[error("unknown config version: {0}")]
	UnknownVersion(u32),
}

impl SyncConfig {
	pub const CURRENT_VERSION: u32 = 2;

	pub fn new(app_id: impl Into<String>, base_url: impl Into<String>) -> Self {
		Self {
			version: Self::CURRENT_VERSION,
			app_id: app_id.into(),
			base_url: base_url.into(),
			log_level: "info".to_string(),
			stop_policy: StopPolicy::default(),
			cancel_waits_on_nonfatal_error: false,
			session_close_timeout_ms: DEFAULT_SESSION_CLOSE_TIMEOUT_MS,
		}
	}

	#[must_use]
	pub const fn session_close_timeout(&self) -> Duration {
		Duration::from_millis(self.session_close_timeout_ms)
	}

	/// Loads the config at `path`, migrating and rewriting it when it is outdated.
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		let bytes = fs::read(path).await.map_err(|source| ConfigError::FileIO {
			path: path.to_path_buf(),
			source,
		})?;
		let mut config = serde_json::from_slice::<Self>(&bytes)?;

		if config.version < Self::CURRENT_VERSION {
			info!(
				from = config.version,
				to = Self::CURRENT_VERSION,
				"Migrating sync config;"
			);
			config.migrate()?;
			config.save(path).await?;
		} else if config.version > Self::CURRENT_VERSION {
			return Err(ConfigError::UnknownVersion(config.version));
		}

		Ok(config)
	}

	/// Loads the config at `path`, or writes a fresh one built by `init` if none exists.
	pub async fn load_or_create(
		path: impl AsRef<Path>,
		init: impl FnOnce() -> Self + Send,
	) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		match Self::load(path).await {
			Err(ConfigError::FileIO { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "No sync config found, creating default;");
				let config = init();
				config.save(path).await?;
				Ok(config)
			}
			res => res,
		}
	}

	pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|source| ConfigError::FileIO {
					path: parent.to_path_buf(),
					source,
				})?;
		}

		fs::write(path, serde_json::to_vec_pretty(self)?)
			.await
			.map_err(|source| ConfigError::FileIO {
				path: path.to_path_buf(),
				source,
			})?;

		info!(path = %path.display(), "Saved sync config;");

		Ok(())
	}

	fn migrate(&mut self) -> Result<(), ConfigError> {
		loop {
			match self.version {
				// v2 introduced the stop policy and wait cancellation, both filled by serde defaults
				1 => self.version = 2,
				Self::CURRENT_VERSION => return Ok(()),
				v => return Err(ConfigError::UnknownVersion(v)),
			}
		}
	}
}
