//! Contract with the external bulk file-transfer service.
//!
//! Replies are deserialized into the `Raw*` types and immediately normalised
//! into [`JobSnapshot`]; nothing past this module sees the loose wire shapes.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{TransferFileState, TransferJobStatus};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FtsError {
	/// The service no longer knows the job (expired or purged).
	#[error("transfer job not found on service: {0}")]
	NotFound(String),

	#[error("transfer service error: {0}")]
	Client(String),
}

/// Operations consumed from the transfer service.
pub trait FtsClient: Send + Sync {
	/// Submit a job, returning the service-issued job identifier.
	fn submit(&self, job: &JobSubmission) -> impl Future<Output = Result<String, FtsError>> + Send;

	/// Job state including every file of the job.
	fn job_status(&self, fts_guid: &str) -> impl Future<Output = Result<RawJobStatus, FtsError>> + Send;

	/// Cancel the whole job, returning the resulting job state.
	fn cancel(&self, fts_guid: &str) -> impl Future<Output = Result<String, FtsError>> + Send;

	fn delegate(&self, credential: &str, lifetime: Duration) -> impl Future<Output = Result<(), FtsError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmission {
	pub files: Vec<TransferDescriptor>,
	pub params: JobParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobParams {
	pub verify_checksum: bool,
	pub overwrite: bool,
	pub multihop: bool,
	pub priority: u8,
	/// Seconds the service may wait for staging; set for tape sources.
	pub bring_online: Option<u64>,
	/// Pin lifetime requested on the staged replica.
	pub copy_pin_lifetime: Option<u64>,
	pub archive_timeout: Option<u64>,
	pub source_spacetoken: Option<String>,
	pub spacetoken: Option<String>,
	pub job_metadata: JobMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
	pub job_id: String,
	pub operation_id: String,
	pub request_id: String,
}

/// One source→destination transfer inside a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferDescriptor {
	pub sources: Vec<String>,
	pub destinations: Vec<String>,
	pub checksum: Option<String>,
	pub filesize: u64,
	/// Only set on the transfer whose outcome maps back to a queue file.
	pub metadata: Option<FileMetadata>,
	pub activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
	pub file_id: String,
	#[serde(default)]
	pub lfn: Option<String>,
}

/// Job status reply as the service sends it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawJobStatus {
	pub job_state: String,
	#[serde(default)]
	pub reason: Option<String>,
	#[serde(default)]
	pub files: Vec<RawFileStatus>,
	#[serde(default)]
	pub job_metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawFileStatus {
	pub file_state: String,
	#[serde(default)]
	pub reason: Option<String>,
	/// Sometimes an object, sometimes a bare value, sometimes null.
	#[serde(default)]
	pub file_metadata: serde_json::Value,
	#[serde(default)]
	pub filesize: Option<u64>,
	#[serde(default)]
	pub tx_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
	pub state: TransferJobStatus,
	pub reason: Option<String>,
	pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
	pub state: TransferFileState,
	pub reason: Option<String>,
	pub metadata: Option<FileMetadata>,
	pub filesize: u64,
	pub tx_duration: f64,
}

impl RawJobStatus {
	pub fn normalize(self) -> Result<JobSnapshot, FtsError> {
		let state = self.job_state.parse::<TransferJobStatus>().map_err(FtsError::Client)?;
		let files = self
			.files
			.into_iter()
			.map(RawFileStatus::normalize)
			.collect::<Result<Vec<_>, _>>()?;
		Ok(JobSnapshot { state, reason: non_empty(self.reason), files })
	}
}

impl RawFileStatus {
	fn normalize(self) -> Result<FileSnapshot, FtsError> {
		let state = self.file_state.parse::<TransferFileState>().map_err(FtsError::Client)?;
		Ok(FileSnapshot {
			state,
			reason: non_empty(self.reason),
			metadata: FileMetadata::from_wire(&self.file_metadata),
			filesize: self.filesize.unwrap_or(0),
			tx_duration: self.tx_duration.unwrap_or(0.0),
		})
	}
}

impl FileMetadata {
	fn from_wire(value: &serde_json::Value) -> Option<FileMetadata> {
		use serde_json::Value;

		let scalar = |v: &Value| match v {
			Value::String(s) if !s.is_empty() => Some(s.clone()),
			Value::Number(n) => Some(n.to_string()),
			_ => None,
		};

		match value {
			Value::Object(map) => Some(FileMetadata {
				file_id: map.get("file_id").and_then(scalar)?,
				lfn: map.get("lfn").and_then(|v| v.as_str()).map(str::to_string),
			}),
			other => scalar(other).map(|file_id| FileMetadata { file_id, lfn: None }),
		}
	}
}

fn non_empty(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
pub mod testing {
	//! Scripted in-process stand-in for the transfer service.

	use std::{collections::HashMap, sync::Mutex};

	use super::*;

	#[derive(Default)]
	struct FakeState {
		next: u32,
		submitted: Vec<(String, JobSubmission)>,
		jobs: HashMap<String, RawJobStatus>,
		fail_submit: Option<String>,
		delegations: u32,
		cancels: u32,
	}

	#[derive(Default)]
	pub struct FakeFts {
		state: Mutex<FakeState>,
	}

	impl FakeFts {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn submitted(&self) -> Vec<(String, JobSubmission)> {
			self.state.lock().unwrap().submitted.clone()
		}

		pub fn delegations(&self) -> u32 {
			self.state.lock().unwrap().delegations
		}

		pub fn cancels(&self) -> u32 {
			self.state.lock().unwrap().cancels
		}

		pub fn fail_next_submit(&self, message: &str) {
			self.state.lock().unwrap().fail_submit = Some(message.to_string());
		}

		pub fn set_status(&self, guid: &str, status: RawJobStatus) {
			self.state.lock().unwrap().jobs.insert(guid.to_string(), status);
		}

		/// Move the job and every one of its files to `state`.
		pub fn settle(&self, guid: &str, job_state: &str, file_state: &str) {
			let mut st = self.state.lock().unwrap();
			if let Some(job) = st.jobs.get_mut(guid) {
				job.job_state = job_state.to_string();
				for f in &mut job.files {
					f.file_state = file_state.to_string();
					f.tx_duration = Some(2.5);
				}
			}
		}

		pub fn forget(&self, guid: &str) {
			self.state.lock().unwrap().jobs.remove(guid);
		}
	}

	impl FtsClient for FakeFts {
		async fn submit(&self, job: &JobSubmission) -> Result<String, FtsError> {
			let mut st = self.state.lock().unwrap();
			if let Some(msg) = st.fail_submit.take() {
				return Err(FtsError::Client(msg));
			}
			st.next += 1;
			let guid = format!("fts-{:04}", st.next);
			let files = job
				.files
				.iter()
				.map(|d| RawFileStatus {
					file_state: "SUBMITTED".into(),
					reason: None,
					file_metadata: d
						.metadata
						.as_ref()
						.map(|m| serde_json::to_value(m).unwrap())
						.unwrap_or(serde_json::Value::Null),
					filesize: Some(d.filesize),
					tx_duration: None,
				})
				.collect();
			st.jobs.insert(
				guid.clone(),
				RawJobStatus {
					job_state: "SUBMITTED".into(),
					reason: None,
					files,
					job_metadata: serde_json::to_value(&job.params.job_metadata).unwrap(),
				},
			);
			st.submitted.push((guid.clone(), job.clone()));
			Ok(guid)
		}

		async fn job_status(&self, fts_guid: &str) -> Result<RawJobStatus, FtsError> {
			let st = self.state.lock().unwrap();
			st.jobs
				.get(fts_guid)
				.cloned()
				.ok_or_else(|| FtsError::NotFound(fts_guid.to_string()))
		}

		async fn cancel(&self, fts_guid: &str) -> Result<String, FtsError> {
			let mut st = self.state.lock().unwrap();
			st.cancels += 1;
			let job = st
				.jobs
				.get_mut(fts_guid)
				.ok_or_else(|| FtsError::NotFound(fts_guid.to_string()))?;
			if matches!(job.job_state.as_str(), "FINISHED" | "FINISHEDDIRTY" | "FAILED" | "CANCELED") {
				return Ok(job.job_state.clone());
			}
			job.job_state = "CANCELED".into();
			for f in &mut job.files {
				if !matches!(f.file_state.as_str(), "FINISHED" | "FAILED") {
					f.file_state = "CANCELED".into();
				}
			}
			Ok(job.job_state.clone())
		}

		async fn delegate(&self, _credential: &str, _lifetime: Duration) -> Result<(), FtsError> {
			self.state.lock().unwrap().delegations += 1;
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn raw(files: serde_json::Value) -> RawJobStatus {
		serde_json::from_value(json!({
			"job_state": "ACTIVE",
			"reason": "",
			"files": files,
		}))
		.unwrap()
	}

	#[test]
	fn metadata_shapes_are_normalised() {
		let snap = raw(json!([
			{ "file_state": "FINISHED", "file_metadata": { "file_id": "01F", "lfn": "/vo/f1" }, "filesize": 100 },
			{ "file_state": "ACTIVE", "file_metadata": "01G" },
			{ "file_state": "ACTIVE", "file_metadata": 42 },
			{ "file_state": "SUBMITTED", "file_metadata": null },
			{ "file_state": "SUBMITTED" },
			{ "file_state": "SUBMITTED", "file_metadata": { "other": 1 } },
		]))
		.normalize()
		.unwrap();

		assert_eq!(snap.state, TransferJobStatus::Active);
		assert_eq!(snap.reason, None);
		let ids: Vec<Option<&str>> = snap.files.iter().map(|f| f.metadata.as_ref().map(|m| m.file_id.as_str())).collect();
		assert_eq!(ids, vec![Some("01F"), Some("01G"), Some("42"), None, None, None]);
		assert_eq!(snap.files[0].metadata.as_ref().unwrap().lfn.as_deref(), Some("/vo/f1"));
		assert_eq!(snap.files[0].filesize, 100);
	}

	#[test]
	fn unknown_state_is_a_service_error() {
		let err = raw(json!([{ "file_state": "TELEPORTED" }])).normalize().unwrap_err();
		assert!(matches!(err, FtsError::Client(_)));
	}
}
