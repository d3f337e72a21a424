use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::StorageElementConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
	#[error("unknown storage element: {0}")]
	UnknownElement(String),

	#[error("{element} has no endpoint for protocol {protocol}")]
	UnsupportedProtocol { element: String, protocol: String },

	#[error("no common protocol between {source_se} and {target_se}")]
	NoCommonProtocol { source_se: String, target_se: String },

	#[error("invalid path {0}")]
	InvalidPath(String),
}

/// A named storage endpoint and the protocols it speaks.
#[derive(Debug, Clone)]
pub struct StorageElement {
	pub name: String,
	pub tape: bool,
	endpoints: BTreeMap<String, String>,
	read_protocols: Vec<String>,
	write_protocols: Vec<String>,
	staging_protocols: Vec<String>,
	pub space_token: Option<String>,
	pub archive_timeout: bool,
}

impl StorageElement {
	fn from_config(cfg: &StorageElementConfig) -> Self {
		StorageElement {
			name: cfg.name.clone(),
			tape: cfg.tape,
			endpoints: cfg.endpoints.clone(),
			read_protocols: cfg.read_protocols.clone(),
			write_protocols: cfg.write_protocols.clone(),
			staging_protocols: cfg.staging_protocols.clone(),
			space_token: cfg.space_token.clone(),
			archive_timeout: cfg.archive_timeout,
		}
	}

	/// Storage URL of `lfn` for the given protocol.
	pub fn url(&self, lfn: &str, protocol: &str) -> Result<String, StorageError> {
		if !lfn.starts_with('/') || lfn.contains("//") || lfn.chars().any(char::is_whitespace) {
			return Err(StorageError::InvalidPath(lfn.to_string()));
		}
		let base = self.endpoints.get(protocol).ok_or_else(|| StorageError::UnsupportedProtocol {
			element: self.name.clone(),
			protocol: protocol.to_string(),
		})?;
		Ok(format!("{}{}", base.trim_end_matches('/'), lfn))
	}

	pub fn can_read(&self, protocol: &str) -> bool {
		self.speaks(&self.read_protocols, protocol)
	}

	pub fn can_write(&self, protocol: &str) -> bool {
		self.speaks(&self.write_protocols, protocol)
	}

	/// Protocol used to bring files online, when this is a tape element.
	pub fn staging_protocol(&self) -> Option<&str> {
		if !self.tape {
			return None;
		}
		self.staging_protocols
			.iter()
			.find(|p| self.endpoints.contains_key(p.as_str()))
			.map(String::as_str)
	}

	// An empty protocol list means every configured endpoint.
	fn speaks(&self, list: &[String], protocol: &str) -> bool {
		self.endpoints.contains_key(protocol) && (list.is_empty() || list.iter().any(|p| p == protocol))
	}
}

/// Every storage element known to this installation.
#[derive(Debug, Clone, Default)]
pub struct StorageCatalog {
	elements: BTreeMap<String, StorageElement>,
}

impl StorageCatalog {
	pub fn from_config(configs: &[StorageElementConfig]) -> Self {
		let elements = configs
			.iter()
			.map(|c| (c.name.clone(), StorageElement::from_config(c)))
			.collect();
		StorageCatalog { elements }
	}

	pub fn element(&self, name: &str) -> Result<&StorageElement, StorageError> {
		self.elements
			.get(name)
			.ok_or_else(|| StorageError::UnknownElement(name.to_string()))
	}

	/// First allowed protocol the source can read and the target can write.
	pub fn negotiate(&self, source: &str, target: &str, allowed: &[String]) -> Result<String, StorageError> {
		let src = self.element(source)?;
		let dst = self.element(target)?;
		allowed
			.iter()
			.find(|p| src.can_read(p) && dst.can_write(p))
			.cloned()
			.ok_or_else(|| StorageError::NoCommonProtocol {
				source_se: source.to_string(),
				target_se: target.to_string(),
			})
	}

	/// Whether reading from `source` needs a stage-to-self hop before the
	/// real transfer: tape whose staging protocol is not the transfer one.
	pub fn needs_staging_hop(&self, source: &str, target: &str, allowed: &[String]) -> Result<bool, StorageError> {
		let src = self.element(source)?;
		let Some(staging) = src.staging_protocol() else {
			return Ok(false);
		};
		let transfer = self.negotiate(source, target, allowed)?;
		Ok(staging != transfer)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) fn sample_catalog() -> StorageCatalog {
		let cfg = crate::config::Config::parse(
			r#"
[[storage]]
name = "DISK-A"
endpoints = { root = "root://a.example.org//data", https = "https://a.example.org/data" }

[[storage]]
name = "DISK-B"
endpoints = { root = "root://b.example.org//data/" }
space_token = "VO-Disk"

[[storage]]
name = "TAPE-T"
tape = true
endpoints = { srm = "srm://t.example.org/tape", root = "root://t.example.org//tape" }
staging_protocols = ["srm"]
archive_timeout = true

[[storage]]
name = "TAPE-SRM"
tape = true
endpoints = { srm = "srm://s.example.org/tape" }
staging_protocols = ["srm"]
archive_timeout = true

[[storage]]
name = "BUFFER"
endpoints = { root = "root://buf.example.org//buffer" }
"#,
		)
		.unwrap();
		StorageCatalog::from_config(&cfg.storage_elements)
	}

	fn protocols() -> Vec<String> {
		vec!["root".into(), "https".into(), "srm".into()]
	}

	#[test]
	fn url_joins_endpoint_and_lfn() {
		let catalog = sample_catalog();
		let b = catalog.element("DISK-B").unwrap();
		assert_eq!(b.url("/vo/f1", "root").unwrap(), "root://b.example.org//data/vo/f1");
		assert!(matches!(b.url("/vo/f1", "srm"), Err(StorageError::UnsupportedProtocol { .. })));
		assert!(matches!(b.url("vo/f1", "root"), Err(StorageError::InvalidPath(_))));
	}

	#[test]
	fn negotiation_follows_allowed_order() {
		let catalog = sample_catalog();
		assert_eq!(catalog.negotiate("DISK-A", "DISK-B", &protocols()).unwrap(), "root");
		assert_eq!(catalog.negotiate("TAPE-SRM", "TAPE-T", &protocols()).unwrap(), "srm");
		assert!(matches!(
			catalog.negotiate("DISK-A", "TAPE-SRM", &protocols()),
			Err(StorageError::NoCommonProtocol { .. })
		));
		assert!(matches!(catalog.element("NOPE"), Err(StorageError::UnknownElement(_))));
	}

	#[test]
	fn staging_hop_only_when_protocols_differ() {
		let catalog = sample_catalog();
		assert!(catalog.needs_staging_hop("TAPE-T", "DISK-B", &protocols()).unwrap());
		assert!(!catalog.needs_staging_hop("TAPE-SRM", "TAPE-T", &protocols()).unwrap());
		assert!(!catalog.needs_staging_hop("DISK-A", "DISK-B", &protocols()).unwrap());
	}
}
