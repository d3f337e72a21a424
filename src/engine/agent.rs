//! Drives Transfer operations: checks requests out of the queue, submits
//! their files as transfer jobs, and folds job progress back into the queue.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{
	job_store::{JobStore, JobStoreError},
	monitor::Inconsistency,
	queue::{QueueError, RequestQueue},
	transfer_job::{plan_jobs, TransferError},
};
use crate::{
	config::TransferSettings,
	fts::FtsClient,
	models::{FileStatus, Operation, OperationStatus, OperationType, Request, RequestStatus, TransferJob},
	storage::StorageCatalog,
};

#[derive(Debug, Error)]
pub enum AgentError {
	#[error(transparent)]
	Queue(#[from] QueueError),

	#[error(transparent)]
	Jobs(#[from] JobStoreError),

	#[error(transparent)]
	Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitSummary {
	pub jobs: usize,
	pub files_submitted: usize,
	pub files_rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
	pub polled: usize,
	/// Jobs whose request was checked out by an executor; retried next pass.
	pub deferred: usize,
	pub released: usize,
	pub finished: usize,
	pub canceled: usize,
	pub errors: usize,
	/// Job id with the offending file.
	pub inconsistencies: Vec<(String, Inconsistency)>,
}

pub struct TransferAgent<F> {
	queue: RequestQueue,
	jobs: JobStore,
	storage: StorageCatalog,
	settings: TransferSettings,
	fts: F,
}

impl<F: FtsClient> TransferAgent<F> {
	pub fn new(queue: RequestQueue, jobs: JobStore, storage: StorageCatalog, settings: TransferSettings, fts: F) -> Self {
		TransferAgent { queue, jobs, storage, settings, fts }
	}

	/// Hand the configured credential to the service. `false` when none is set.
	pub async fn delegate(&self) -> Result<bool, AgentError> {
		let Some(credential) = &self.settings.credential else {
			return Ok(false);
		};
		self.fts
			.delegate(credential, self.settings.delegation_lifetime())
			.await
			.map_err(TransferError::from)?;
		debug!(lifetime_secs = self.settings.delegation_lifetime_secs, "credential delegated");
		Ok(true)
	}

	/// Check out one waiting request whose current operation is a waiting
	/// Transfer, submit it and store it back. `Ok(None)` when the queue has
	/// nothing eligible.
	///
	/// A picked request with other work pending is not checked out and comes
	/// back with an empty summary, its `last_update` unchanged.
	pub async fn execute_next(&self) -> Result<Option<(String, SubmitSummary)>, AgentError> {
		let Some(candidate) = self.queue.get(None, false).await? else {
			return Ok(None);
		};
		let request_id = candidate.request_id.clone().unwrap_or_default();
		if !has_waiting_transfer(&candidate) {
			debug!(%request_id, "current operation is not a waiting transfer, left in queue");
			return Ok(Some((request_id, SubmitSummary::default())));
		}

		let mut request = match self.queue.get(Some(&request_id), true).await {
			Ok(Some(request)) if request.status == RequestStatus::Assigned => request,
			Ok(_) | Err(QueueError::AlreadyAssigned(_) | QueueError::NotFound(_)) => {
				debug!(%request_id, "request taken or finished meanwhile");
				return Ok(Some((request_id, SubmitSummary::default())));
			}
			Err(e) => return Err(e.into()),
		};
		let submitted = self.submit_request(&mut request).await;
		// Stored even on error: files already checked out must be persisted.
		self.queue.put(&mut request).await?;
		Ok(Some((request_id, submitted?)))
	}

	/// Submit the current operation of a request the caller holds.
	pub async fn submit_request(&self, request: &mut Request) -> Result<SubmitSummary, AgentError> {
		let mut summary = SubmitSummary::default();
		let request_id = request.request_id.clone().unwrap_or_default();

		let Some(op) = request.current_operation_mut() else {
			return Ok(summary);
		};
		if op.kind != OperationType::Transfer || op.status != OperationStatus::Waiting {
			debug!(%request_id, kind = %op.kind, status = %op.status, "nothing to submit");
			return Ok(summary);
		}

		let plans = match plan_jobs(op, &self.storage, &self.settings) {
			Ok(plans) => plans,
			Err(e @ (TransferError::Construction(_) | TransferError::Storage(_))) => {
				error!(%request_id, error = %e, "transfer operation cannot be executed");
				fail_available(op, &e.to_string());
				return Ok(summary);
			}
			Err(e) => return Err(e.into()),
		};

		for plan in plans {
			let mut job = TransferJob::new(&request_id, op, &plan, &self.settings);
			match job.submit(op, &self.storage, &self.settings, &self.fts).await {
				Ok(outcome) => {
					summary.files_rejected += outcome.rejected;
					if outcome.fts_guid.is_some() {
						self.jobs.save(&job).await?;
						summary.jobs += 1;
						summary.files_submitted += outcome.accepted;
					}
				}
				Err(e) if e.is_retryable() => {
					// Remaining files stay Waiting for the next cycle.
					warn!(%request_id, job_id = %job.job_id, error = %e, "submission failed, will retry");
					break;
				}
				Err(TransferError::Construction(reason)) => {
					error!(%request_id, job_id = %job.job_id, %reason, "transfer job cannot be built");
					for file_id in &plan.file_ids {
						if let Some(file) = op.file_mut(file_id) {
							file.status = FileStatus::Failed;
							file.error = Some(reason.clone());
						}
					}
				}
				Err(e) => return Err(e.into()),
			}
		}

		if summary.jobs > 0 {
			info!(%request_id, jobs = summary.jobs, files = summary.files_submitted, "transfer operation submitted");
		}
		Ok(summary)
	}

	/// Poll every active job once.
	pub async fn monitor_pass(&self) -> Result<MonitorSummary, AgentError> {
		let mut summary = MonitorSummary::default();

		for mut job in self.jobs.active().await? {
			let mut request = match self.queue.get(Some(&job.request_id), false).await {
				Ok(Some(request)) => request,
				Ok(None) => continue,
				Err(QueueError::NotFound(_)) => {
					warn!(job_id = %job.job_id, request_id = %job.request_id, "request of transfer job is gone");
					self.cancel_job(&mut job, "request deleted", &mut summary).await?;
					continue;
				}
				Err(e) => return Err(e.into()),
			};

			match request.status {
				RequestStatus::Assigned => {
					debug!(job_id = %job.job_id, request_id = %job.request_id, "request checked out, deferring");
					summary.deferred += 1;
					continue;
				}
				RequestStatus::Canceled => {
					self.cancel_job(&mut job, "request canceled", &mut summary).await?;
					continue;
				}
				_ => {}
			}

			let Some(op) = request.operation_mut(&job.operation_id) else {
				warn!(job_id = %job.job_id, operation_id = %job.operation_id, "operation of transfer job is gone");
				continue;
			};

			summary.polled += 1;
			let report = match job.monitor(op, self.settings.max_attempts, &self.fts).await {
				Ok(report) => report,
				Err(e) if e.is_retryable() => {
					warn!(job_id = %job.job_id, error = %e, "transfer job status unavailable");
					summary.errors += 1;
					continue;
				}
				Err(e) => return Err(e.into()),
			};

			// Queue first: a crash before the job is saved only repeats an
			// idempotent monitoring pass.
			if report.updated > 0 || report.released > 0 {
				self.queue.put(&mut request).await?;
			}
			if let Some(accounting) = &report.accounting {
				self.jobs.record_accounting(accounting).await?;
			}
			if job.is_terminal() {
				summary.finished += 1;
			}
			self.jobs.save(&job).await?;

			summary.released += report.released;
			summary
				.inconsistencies
				.extend(report.inconsistencies.into_iter().map(|i| (job.job_id.clone(), i)));
		}

		if summary.polled > 0 {
			info!(
				polled = summary.polled,
				finished = summary.finished,
				released = summary.released,
				deferred = summary.deferred,
				"monitoring pass done"
			);
		}
		Ok(summary)
	}

	async fn cancel_job(&self, job: &mut TransferJob, reason: &str, summary: &mut MonitorSummary) -> Result<(), AgentError> {
		// A job the service no longer knows comes back Failed and is saved
		// like any other, so it leaves the active set.
		match job.cancel(reason, &self.fts).await {
			Ok(()) => {
				summary.canceled += 1;
				self.jobs.save(job).await?;
			}
			Err(e) => {
				warn!(job_id = %job.job_id, error = %e, "could not cancel transfer job");
				summary.errors += 1;
			}
		}
		Ok(())
	}
}

fn has_waiting_transfer(request: &Request) -> bool {
	request
		.current_operation()
		.is_some_and(|op| op.kind == OperationType::Transfer && op.status == OperationStatus::Waiting)
}

fn fail_available(op: &mut Operation, reason: &str) {
	op.error = Some(reason.to_string());
	for file in op.files.iter_mut().filter(|f| f.is_available()) {
		file.status = FileStatus::Failed;
		file.error = Some(reason.to_string());
	}
}
