use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::transfer_job::TransferError;
use crate::{
	fts::{FtsClient, FtsError, JobSnapshot},
	models::{File, FileStatus, Operation, TransferAccounting, TransferFileState, TransferJob, TransferJobStatus},
};

const LOST_ON_SERVICE: &str = "transfer job not found on service";

/// A file the service still reports as in flight inside a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct Inconsistency {
	pub file_id: String,
	pub file_state: TransferFileState,
	pub job_state: TransferJobStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
	/// Files whose state was taken from the service.
	pub updated: usize,
	/// Files released back to the queue (done, failed or retryable).
	pub released: usize,
	pub inconsistencies: Vec<Inconsistency>,
	/// Set only on the pass that produced the accounting record.
	pub accounting: Option<TransferAccounting>,
}

impl MonitorReport {
	pub fn check(&self, job_id: &str) -> Result<(), TransferError> {
		if self.inconsistencies.is_empty() {
			return Ok(());
		}
		Err(TransferError::Inconsistent { job: job_id.to_string(), files: self.inconsistencies.clone() })
	}
}

impl TransferJob {
	/// Poll the service and fold the job state back into `op`.
	///
	/// Safe to repeat: files already released from this job are not touched
	/// again and accounting is only produced once.
	pub async fn monitor<F: FtsClient>(
		&mut self,
		op: &mut Operation,
		max_attempts: u32,
		fts: &F,
	) -> Result<MonitorReport, TransferError> {
		let guid = self.fts_guid.clone().ok_or_else(|| TransferError::NotSubmitted(self.job_id.clone()))?;

		let snapshot = match fts.job_status(&guid).await {
			Ok(raw) => raw.normalize()?,
			Err(FtsError::NotFound(_)) => return Ok(self.lost_on_service(op, &guid, max_attempts)),
			Err(e) => return Err(e.into()),
		};

		let mut report = MonitorReport::default();
		let mut tracked = 0usize;
		let mut settled = 0usize;

		for snap in &snapshot.files {
			// Intermediate legs carry no metadata.
			let Some(meta) = &snap.metadata else { continue };
			tracked += 1;
			if snap.state.is_terminal() {
				settled += 1;
			}

			if let Some(tf) = self.file_mut(&meta.file_id) {
				tf.state = snap.state;
				tf.error = snap.reason.clone();
			}

			let Some(file) = op.file_mut(&meta.file_id) else {
				warn!(job_id = %self.job_id, file_id = %meta.file_id, "service reports a file unknown to the operation");
				continue;
			};
			if file.transfer_job.as_deref() != Some(guid.as_str()) {
				continue;
			}
			report.updated += 1;

			if snap.state.is_terminal() {
				file.transfer_job = None;
				if snap.state == TransferFileState::Finished {
					file.status = FileStatus::Done;
					file.error = None;
				} else {
					fail_attempt(file, snap.reason.as_deref(), max_attempts);
				}
				report.released += 1;
			} else if snapshot.state.is_terminal() {
				error!(
					job_id = %self.job_id,
					fts_guid = %guid,
					file_id = %meta.file_id,
					file_state = %snap.state,
					job_state = %snapshot.state,
					"terminal job with a non-terminal file"
				);
				report.inconsistencies.push(Inconsistency {
					file_id: meta.file_id.clone(),
					file_state: snap.state,
					job_state: snapshot.state,
				});
			}
		}

		self.completeness = match tracked {
			0 if snapshot.state.is_terminal() => 100,
			0 => 0,
			n => (settled * 100 / n) as u8,
		};
		if self.status != snapshot.state {
			debug!(job_id = %self.job_id, from = %self.status, to = %snapshot.state, "transfer job state changed");
		}
		self.status = snapshot.state;
		self.error = snapshot.reason.clone();
		self.last_update = Utc::now();

		if self.status.is_terminal() && self.accounting.is_none() {
			let accounting = self.account(&snapshot);
			info!(
				job_id = %self.job_id,
				status = %accounting.final_status,
				files = accounting.files_total,
				succeeded = accounting.files_succeeded,
				bytes = accounting.transferred_bytes,
				"transfer job finished"
			);
			self.accounting = Some(accounting.clone());
			report.accounting = Some(accounting);
		}

		Ok(report)
	}

	/// Cancel on the service. A job already canceled keeps its first reason;
	/// one the service has lost is failed locally.
	pub async fn cancel<F: FtsClient>(&mut self, reason: &str, fts: &F) -> Result<(), TransferError> {
		if self.status == TransferJobStatus::Canceled {
			return Ok(());
		}
		let guid = self.fts_guid.clone().ok_or_else(|| TransferError::NotSubmitted(self.job_id.clone()))?;

		let state = match fts.cancel(&guid).await {
			Ok(state) => state,
			Err(FtsError::NotFound(_)) => {
				warn!(job_id = %self.job_id, fts_guid = %guid, %reason, "transfer job to cancel no longer known to the service");
				self.fail_locally(&format!("{reason}: {LOST_ON_SERVICE}"));
				return Ok(());
			}
			Err(e) => return Err(e.into()),
		};
		self.status = state.parse().map_err(|e: String| TransferError::Service(FtsError::Client(e)))?;
		self.last_update = Utc::now();
		if self.status != TransferJobStatus::Canceled {
			info!(job_id = %self.job_id, fts_guid = %guid, status = %self.status, "transfer job ended before it could be canceled");
			return Ok(());
		}
		self.error = Some(reason.to_string());
		for tf in self.files.iter_mut().filter(|f| !f.state.is_terminal()) {
			tf.state = TransferFileState::Canceled;
		}
		info!(job_id = %self.job_id, fts_guid = %guid, %reason, "transfer job canceled");
		Ok(())
	}

	// The service forgot the job: fail it and give its files back.
	fn lost_on_service(&mut self, op: &mut Operation, guid: &str, max_attempts: u32) -> MonitorReport {
		warn!(job_id = %self.job_id, fts_guid = guid, "transfer job no longer known to the service");
		let mut report = MonitorReport::default();

		for file in op.files.iter_mut().filter(|f| f.transfer_job.as_deref() == Some(guid)) {
			file.transfer_job = None;
			fail_attempt(file, Some(LOST_ON_SERVICE), max_attempts);
			report.released += 1;
		}
		self.fail_locally(LOST_ON_SERVICE);
		report
	}

	fn fail_locally(&mut self, reason: &str) {
		for tf in self.files.iter_mut().filter(|f| !f.state.is_terminal()) {
			tf.state = TransferFileState::Failed;
			tf.error = Some(reason.to_string());
		}
		self.status = TransferJobStatus::Failed;
		self.error = Some(reason.to_string());
		self.completeness = 100;
		self.last_update = Utc::now();
	}

	fn account(&self, snapshot: &JobSnapshot) -> TransferAccounting {
		let tracked = snapshot.files.iter().filter(|f| f.metadata.is_some());
		let mut acc = TransferAccounting {
			job_id: self.job_id.clone(),
			source_se: self.source_se.clone(),
			target_se: self.target_se.clone(),
			final_status: snapshot.state,
			files_total: 0,
			files_succeeded: 0,
			transferred_bytes: 0,
			transfer_time: 0.0,
		};
		for f in tracked {
			acc.files_total += 1;
			acc.transfer_time += f.tx_duration;
			if f.state == TransferFileState::Finished {
				acc.files_succeeded += 1;
				acc.transferred_bytes += f.filesize;
			}
		}
		acc
	}
}

/// A failed attempt goes back to Waiting until the budget is spent.
fn fail_attempt(file: &mut File, reason: Option<&str>, max_attempts: u32) {
	file.error = Some(reason.unwrap_or("transfer failed").to_string());
	file.status = if file.attempt >= max_attempts { FileStatus::Failed } else { FileStatus::Waiting };
}
