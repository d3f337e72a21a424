use surrealdb::types::SurrealValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
	db::{from_millis, DbHandle},
	models::{TransferAccounting, TransferFile, TransferJob, TransferJobStatus},
};

const JOB_FIELDS: &str = "job_id, request_id, operation_id, source_se, target_se, multi_hop_se, activity, priority, \
                          fts_guid, status, error, completeness, files, accounting, created, last_update";
const ACCOUNTING_FIELDS: &str = "job_id, source_se, target_se, final_status, files_total, files_succeeded, \
                                 transferred_bytes, transfer_time";

#[derive(Debug, Error)]
pub enum JobStoreError {
	#[error("transfer job not found: {0}")]
	NotFound(String),

	#[error("database error: {0}")]
	DbError(String),

	#[error("corrupt transfer job row: {0}")]
	Corrupt(String),
}

fn db_err(e: surrealdb::Error) -> JobStoreError {
	JobStoreError::DbError(e.to_string())
}

#[derive(Debug, Clone, SurrealValue)]
struct JobRow {
	job_id: String,
	request_id: String,
	operation_id: String,
	source_se: String,
	target_se: String,
	multi_hop_se: Option<String>,
	activity: Option<String>,
	priority: i64,
	fts_guid: Option<String>,
	status: String,
	error: Option<String>,
	completeness: i64,
	files: Vec<JobFileRow>,
	accounting: Option<AccountingRow>,
	created: i64,
	last_update: i64,
}

#[derive(Debug, Clone, SurrealValue)]
struct JobFileRow {
	file_id: String,
	lfn: String,
	state: String,
	error: Option<String>,
}

#[derive(Debug, Clone, SurrealValue)]
struct AccountingRow {
	job_id: String,
	source_se: String,
	target_se: String,
	final_status: String,
	files_total: i64,
	files_succeeded: i64,
	transferred_bytes: i64,
	transfer_time: f64,
}

/// Transfer jobs and their accounting records.
#[derive(Clone)]
pub struct JobStore {
	db: DbHandle,
}

impl JobStore {
	pub fn new(db: DbHandle) -> Self {
		JobStore { db }
	}

	pub async fn save(&self, job: &TransferJob) -> Result<(), JobStoreError> {
		self.db
			.db
			.query("UPSERT type::record('transfer_job', $id) CONTENT $job")
			.bind(("id", job.job_id.clone()))
			.bind(("job", JobRow::from(job)))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;
		debug!(job_id = %job.job_id, status = %job.status, completeness = job.completeness, "transfer job saved");
		Ok(())
	}

	pub async fn get(&self, job_id: &str) -> Result<TransferJob, JobStoreError> {
		let mut response = self
			.db
			.db
			.query(format!("SELECT {JOB_FIELDS} FROM transfer_job WHERE job_id = $id LIMIT 1"))
			.bind(("id", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<JobRow> = response.take(0).map_err(db_err)?;
		rows.into_iter()
			.next()
			.ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?
			.try_into()
	}

	/// Submitted jobs the service has not finished yet, oldest first.
	pub async fn active(&self) -> Result<Vec<TransferJob>, JobStoreError> {
		let terminal: Vec<String> = [
			TransferJobStatus::Finished,
			TransferJobStatus::FinishedDirty,
			TransferJobStatus::Failed,
			TransferJobStatus::Canceled,
		]
		.iter()
		.map(|s| s.as_str().to_string())
		.collect();

		let mut response = self
			.db
			.db
			.query(format!(
				"SELECT {JOB_FIELDS} FROM transfer_job
                 WHERE fts_guid != NONE AND status NOTINSIDE $terminal
                 ORDER BY created ASC"
			))
			.bind(("terminal", terminal))
			.await
			.map_err(db_err)?;
		let rows: Vec<JobRow> = response.take(0).map_err(db_err)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}

	pub async fn for_operation(&self, operation_id: &str) -> Result<Vec<TransferJob>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query(format!("SELECT {JOB_FIELDS} FROM transfer_job WHERE operation_id = $op ORDER BY created ASC"))
			.bind(("op", operation_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<JobRow> = response.take(0).map_err(db_err)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}

	/// Keyed by job, so a repeated record overwrites instead of duplicating.
	pub async fn record_accounting(&self, accounting: &TransferAccounting) -> Result<(), JobStoreError> {
		self.db
			.db
			.query("UPSERT type::record('transfer_accounting', $id) CONTENT $acc")
			.bind(("id", accounting.job_id.clone()))
			.bind(("acc", AccountingRow::from(accounting)))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;
		info!(
			target: "reqman::accounting",
			job_id = %accounting.job_id,
			source = %accounting.source_se,
			destination = %accounting.target_se,
			status = %accounting.final_status,
			files = accounting.files_total,
			succeeded = accounting.files_succeeded,
			bytes = accounting.transferred_bytes,
			seconds = accounting.transfer_time,
			"transfer accounting"
		);
		Ok(())
	}

	pub async fn accounting(&self, job_id: &str) -> Result<Option<TransferAccounting>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query(format!("SELECT {ACCOUNTING_FIELDS} FROM transfer_accounting WHERE job_id = $id"))
			.bind(("id", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<AccountingRow> = response.take(0).map_err(db_err)?;
		rows.into_iter().next().map(TryInto::try_into).transpose()
	}
}

impl From<&TransferJob> for JobRow {
	fn from(job: &TransferJob) -> Self {
		JobRow {
			job_id: job.job_id.clone(),
			request_id: job.request_id.clone(),
			operation_id: job.operation_id.clone(),
			source_se: job.source_se.clone(),
			target_se: job.target_se.clone(),
			multi_hop_se: job.multi_hop_se.clone(),
			activity: job.activity.clone(),
			priority: job.priority as i64,
			fts_guid: job.fts_guid.clone(),
			status: job.status.as_str().to_string(),
			error: job.error.clone(),
			completeness: job.completeness as i64,
			files: job
				.files
				.iter()
				.map(|f| JobFileRow {
					file_id: f.file_id.clone(),
					lfn: f.lfn.clone(),
					state: f.state.as_str().to_string(),
					error: f.error.clone(),
				})
				.collect(),
			accounting: job.accounting.as_ref().map(AccountingRow::from),
			created: job.created.timestamp_millis(),
			last_update: job.last_update.timestamp_millis(),
		}
	}
}

impl TryFrom<JobRow> for TransferJob {
	type Error = JobStoreError;

	fn try_from(row: JobRow) -> Result<Self, Self::Error> {
		let files = row
			.files
			.into_iter()
			.map(|f| -> Result<TransferFile, JobStoreError> {
				Ok(TransferFile {
					state: f.state.parse().map_err(JobStoreError::Corrupt)?,
					file_id: f.file_id,
					lfn: f.lfn,
					error: f.error,
				})
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(TransferJob {
			status: row.status.parse().map_err(JobStoreError::Corrupt)?,
			accounting: row.accounting.map(TryInto::try_into).transpose()?,
			job_id: row.job_id,
			request_id: row.request_id,
			operation_id: row.operation_id,
			source_se: row.source_se,
			target_se: row.target_se,
			multi_hop_se: row.multi_hop_se,
			activity: row.activity,
			priority: row.priority.clamp(0, u8::MAX as i64) as u8,
			fts_guid: row.fts_guid,
			error: row.error,
			completeness: row.completeness.clamp(0, 100) as u8,
			files,
			created: from_millis(row.created),
			last_update: from_millis(row.last_update),
		})
	}
}

impl From<&TransferAccounting> for AccountingRow {
	fn from(acc: &TransferAccounting) -> Self {
		AccountingRow {
			job_id: acc.job_id.clone(),
			source_se: acc.source_se.clone(),
			target_se: acc.target_se.clone(),
			final_status: acc.final_status.as_str().to_string(),
			files_total: acc.files_total as i64,
			files_succeeded: acc.files_succeeded as i64,
			transferred_bytes: acc.transferred_bytes as i64,
			transfer_time: acc.transfer_time,
		}
	}
}

impl TryFrom<AccountingRow> for TransferAccounting {
	type Error = JobStoreError;

	fn try_from(row: AccountingRow) -> Result<Self, Self::Error> {
		Ok(TransferAccounting {
			final_status: row.final_status.parse().map_err(JobStoreError::Corrupt)?,
			job_id: row.job_id,
			source_se: row.source_se,
			target_se: row.target_se,
			files_total: row.files_total.max(0) as u32,
			files_succeeded: row.files_succeeded.max(0) as u32,
			transferred_bytes: row.transferred_bytes.max(0) as u64,
			transfer_time: row.transfer_time,
		})
	}
}
