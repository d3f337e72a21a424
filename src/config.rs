use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("cannot read config {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid config {path}: {source}")]
	Parse {
		path: String,
		#[source]
		source: toml::de::Error,
	},
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub database: DatabaseConfig,
	pub logging: LoggingConfig,
	pub transfer: TransferSettings,
	#[serde(rename = "storage")]
	pub storage_elements: Vec<StorageElementConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
	/// On-disk location. Ignored when `memory` is set.
	pub path: Option<PathBuf>,
	pub memory: bool,
	pub namespace: String,
	pub database: String,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		DatabaseConfig {
			path: None,
			memory: false,
			namespace: "reqman".into(),
			database: "reqman".into(),
		}
	}
}

impl DatabaseConfig {
	pub fn in_memory() -> Self {
		DatabaseConfig { memory: true, ..Default::default() }
	}

	/// Configured path, or `<data dir>/reqman/reqman.db`.
	pub fn resolved_path(&self) -> PathBuf {
		self.path.clone().unwrap_or_else(|| data_dir().join("reqman.db"))
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub filter: String,
	pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfig { filter: "info".into(), directory: None }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
	pub max_files_per_job: usize,
	pub max_attempts: u32,
	pub pin_lifetime_secs: u64,
	pub archive_timeout_secs: u64,
	pub default_priority: u8,
	pub activity: Option<String>,
	/// Protocols the transfer service may use, in order of preference.
	pub protocols: Vec<String>,
	pub credential: Option<String>,
	pub delegation_lifetime_secs: u64,
	/// Routes that must go through an intermediate storage element.
	#[serde(rename = "multihop")]
	pub multi_hop: Vec<MultiHopRoute>,
}

impl Default for TransferSettings {
	fn default() -> Self {
		TransferSettings {
			max_files_per_job: 100,
			max_attempts: 10,
			pin_lifetime_secs: 86_400,
			archive_timeout_secs: 86_400,
			default_priority: 3,
			activity: None,
			protocols: vec!["root".into(), "https".into(), "gsiftp".into(), "srm".into()],
			credential: None,
			delegation_lifetime_secs: 12 * 3600,
			multi_hop: Vec::new(),
		}
	}
}

impl TransferSettings {
	pub fn pin_lifetime(&self) -> Duration {
		Duration::from_secs(self.pin_lifetime_secs)
	}

	pub fn delegation_lifetime(&self) -> Duration {
		Duration::from_secs(self.delegation_lifetime_secs)
	}

	/// Intermediate hop for a source/target pair. `*` matches any element.
	pub fn multi_hop_for(&self, source: &str, target: &str) -> Option<String> {
		let matches = |pattern: &str, name: &str| pattern == "*" || pattern == name;
		self.multi_hop
			.iter()
			.find(|r| matches(&r.source, source) && matches(&r.target, target))
			.map(|r| r.via.clone())
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiHopRoute {
	pub source: String,
	pub target: String,
	pub via: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageElementConfig {
	pub name: String,
	#[serde(default)]
	pub tape: bool,
	/// Base URL per protocol; the LFN is appended.
	#[serde(default)]
	pub endpoints: BTreeMap<String, String>,
	#[serde(default)]
	pub read_protocols: Vec<String>,
	#[serde(default)]
	pub write_protocols: Vec<String>,
	#[serde(default)]
	pub staging_protocols: Vec<String>,
	#[serde(default)]
	pub space_token: Option<String>,
	#[serde(default)]
	pub archive_timeout: bool,
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.display().to_string(),
			source,
		})?;
		Self::parse(&text).map_err(|source| ConfigError::Parse {
			path: path.display().to_string(),
			source,
		})
	}

	pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(text)
	}

	/// Load the file if present, otherwise run on defaults.
	pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
		let default_path = data_dir().join("reqman.toml");
		let path = path.unwrap_or(&default_path);
		if path.exists() {
			Self::load(path)
		} else {
			Ok(Config::default())
		}
	}
}

fn data_dir() -> PathBuf {
	dirs::data_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("reqman")
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
[database]
memory = true

[logging]
filter = "reqman=debug"

[transfer]
max_files_per_job = 50
protocols = ["root", "srm"]

[[transfer.multihop]]
source = "CERN-RAW"
target = "*"
via = "CERN-BUFFER"

[[storage]]
name = "CERN-RAW"
tape = true
endpoints = { srm = "srm://srm.cern.ch/castor", root = "root://castor.cern.ch//castor" }
read_protocols = ["root", "srm"]
staging_protocols = ["srm"]

[[storage]]
name = "PIC-DST"
endpoints = { root = "root://xrootd.pic.es//pnfs" }
write_protocols = ["root"]
space_token = "LHCb-Disk"
"#;

	#[test]
	fn parses_full_sample() {
		let cfg = Config::parse(SAMPLE).unwrap();
		assert!(cfg.database.memory);
		assert_eq!(cfg.logging.filter, "reqman=debug");
		assert_eq!(cfg.transfer.max_files_per_job, 50);
		assert_eq!(cfg.transfer.max_attempts, 10);
		assert_eq!(cfg.storage_elements.len(), 2);
		assert!(cfg.storage_elements[0].tape);
		assert_eq!(cfg.storage_elements[1].space_token.as_deref(), Some("LHCb-Disk"));
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = Config::parse("").unwrap();
		assert_eq!(cfg.database.namespace, "reqman");
		assert_eq!(cfg.transfer.pin_lifetime(), Duration::from_secs(86_400));
		assert!(cfg.storage_elements.is_empty());
	}

	#[test]
	fn multi_hop_wildcards() {
		let cfg = Config::parse(SAMPLE).unwrap();
		assert_eq!(cfg.transfer.multi_hop_for("CERN-RAW", "PIC-DST").as_deref(), Some("CERN-BUFFER"));
		assert_eq!(cfg.transfer.multi_hop_for("PIC-DST", "CERN-RAW"), None);
	}

	#[test]
	fn load_reports_parse_errors_with_path() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("reqman.toml");
		fs::write(&path, "[transfer]\nmax_attempts = \"many\"\n").unwrap();

		let err = Config::load(&path).unwrap_err();
		assert!(matches!(err, ConfigError::Parse { .. }));
		assert!(err.to_string().contains("reqman.toml"));
	}

	#[test]
	fn missing_file_falls_back_to_defaults() {
		let tmp = tempfile::tempdir().unwrap();
		let cfg = Config::load_or_default(Some(&tmp.path().join("absent.toml"))).unwrap();
		assert_eq!(cfg.transfer.max_files_per_job, 100);
	}
}
