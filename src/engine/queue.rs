use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use surrealdb::types::SurrealValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
	db::{from_millis, now_millis, statement_errors, DbHandle},
	models::{File, FileStatus, Operation, OperationStatus, OperationType, Request, RequestStatus},
};

/// Oldest-first sample size for the lock-free `get`.
const SAMPLE_OLDEST: usize = 100;
/// Newest-first sample size for the lock-free `get`.
const SAMPLE_NEWEST: usize = 50;

/// Thrown inside the `put` transaction when the stored request is canceled.
const CANCELED_GUARD: &str = "reqman: request is canceled";

const REQUEST_FIELDS: &str = "request_id, name, status, job_id, owner_dn, owner_group, source_component, \
                              creation_time, submit_time, last_update, not_before";
const OPERATION_FIELDS: &str = "operation_id, request_id, kind, op_order, status, source_se, target_se, catalog, \
                                arguments, error, creation_time, submit_time, last_update";
const FILE_FIELDS: &str = "file_id, operation_id, request_id, position, lfn, pfn, checksum_type, checksum, guid, \
                           size, attempt, status, error, transfer_job";

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("request not found: {0}")]
	NotFound(String),

	#[error("request already assigned: {0}")]
	AlreadyAssigned(String),

	#[error("request name already in use: {0}")]
	DuplicateName(String),

	#[error("database error: {0}")]
	DbError(String),

	#[error("corrupt row: {0}")]
	Corrupt(String),
}

impl QueueError {
	/// Transient failures the caller may retry as a whole read-modify cycle.
	pub fn is_retryable(&self) -> bool {
		matches!(self, QueueError::DbError(_))
	}
}

fn db_err(e: surrealdb::Error) -> QueueError {
	QueueError::DbError(e.to_string())
}

/// Filter for [`RequestQueue::list_ids`].
#[derive(Debug, Clone)]
pub struct ListFilter {
	/// Empty means any status.
	pub statuses: Vec<RequestStatus>,
	pub since: Option<DateTime<Utc>>,
	pub until: Option<DateTime<Utc>>,
	pub limit: usize,
}

impl Default for ListFilter {
	fn default() -> Self {
		ListFilter { statuses: Vec::new(), since: None, until: None, limit: 1000 }
	}
}

#[derive(Debug, Clone, SurrealValue)]
struct RequestRow {
	request_id: String,
	name: String,
	status: String,
	job_id: Option<i64>,
	owner_dn: Option<String>,
	owner_group: Option<String>,
	source_component: Option<String>,
	creation_time: i64,
	submit_time: i64,
	last_update: i64,
	not_before: i64,
}

#[derive(Debug, Clone, SurrealValue)]
struct OperationRow {
	operation_id: String,
	request_id: String,
	kind: String,
	op_order: i64,
	status: String,
	source_se: Option<String>,
	target_se: Option<String>,
	catalog: Option<String>,
	arguments: Option<String>,
	error: Option<String>,
	creation_time: i64,
	submit_time: i64,
	last_update: i64,
}

#[derive(Debug, Clone, SurrealValue)]
struct FileRow {
	file_id: String,
	operation_id: String,
	request_id: String,
	position: i64,
	lfn: String,
	pfn: Option<String>,
	checksum_type: Option<String>,
	checksum: Option<String>,
	guid: Option<String>,
	size: i64,
	attempt: i64,
	status: String,
	error: Option<String>,
	transfer_job: Option<String>,
}

#[derive(Debug, Clone, SurrealValue)]
struct IdRow {
	request_id: String,
}

#[derive(Debug, Clone, SurrealValue)]
struct QueueRow {
	request_id: String,
	#[allow(dead_code)]
	last_update: i64,
}

#[derive(Debug, Clone, SurrealValue)]
struct StatusRow {
	status: String,
}

/// Durable store of requests, shared by many independent executors.
#[derive(Clone)]
pub struct RequestQueue {
	db: DbHandle,
}

impl RequestQueue {
	pub fn new(db: DbHandle) -> Self {
		RequestQueue { db }
	}

	/// Insert or replace a request with all its operations and files.
	///
	/// Identifiers and timestamps are filled in on `request`, and the status
	/// cascade is recomputed before writing. A stored request that is
	/// Canceled is left untouched and its ID returned.
	pub async fn put(&self, request: &mut Request) -> Result<String, QueueError> {
		let now = now_millis();

		let request_id = match request.request_id.clone() {
			Some(id) => {
				if let Some(status) = self.stored_status(&id).await? {
					if status == RequestStatus::Canceled {
						info!(request_id = %id, "put ignored, request is canceled");
						return Ok(id);
					}
				}
				id
			}
			None => ulid::Ulid::new().to_string(),
		};

		if let Some(owner) = self.find_by_name(&request.name).await? {
			if owner != request_id {
				return Err(QueueError::DuplicateName(request.name.clone()));
			}
		}

		request.request_id = Some(request_id.clone());
		stamp(request, now);
		request.recompute_status();

		let (request_row, operation_rows, file_rows) = to_rows(request, &request_id);

		let mut sql = format!(
			"BEGIN TRANSACTION;
             IF (SELECT VALUE status FROM request WHERE request_id = $rid) CONTAINS 'Canceled' {{ THROW \"{CANCELED_GUARD}\" }};
             DELETE operation_file WHERE request_id = $rid;
             DELETE operation WHERE request_id = $rid;
             UPSERT type::record('request', $rid) CONTENT $request;"
		);
		if !operation_rows.is_empty() {
			sql.push_str("INSERT INTO operation $operations;");
		}
		if !file_rows.is_empty() {
			sql.push_str("INSERT INTO operation_file $files;");
		}
		sql.push_str("COMMIT TRANSACTION;");

		let mut response = self
			.db
			.db
			.query(sql)
			.bind(("rid", request_id.clone()))
			.bind(("request", request_row))
			.bind(("operations", operation_rows))
			.bind(("files", file_rows))
			.await
			.map_err(db_err)?;

		let errors = statement_errors(&mut response);
		if errors.iter().any(|e| e.contains(CANCELED_GUARD)) {
			info!(request_id = %request_id, "put lost the race against cancel, keeping canceled request");
			return Ok(request_id);
		}
		if let Some(first) = errors.into_iter().next() {
			return Err(QueueError::DbError(first));
		}

		debug!(request_id = %request_id, status = %request.status, "request stored");
		Ok(request_id)
	}

	/// Mark a request Canceled. Terminal and sticky.
	pub async fn cancel(&self, request_id: &str) -> Result<(), QueueError> {
		let mut response = self
			.db
			.db
			.query(
				"UPDATE request SET status = 'Canceled', last_update = $now
                 WHERE request_id = $rid RETURN request_id",
			)
			.bind(("rid", request_id.to_string()))
			.bind(("now", now_millis()))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;

		let rows: Vec<IdRow> = response.take(0).map_err(db_err)?;
		if rows.is_empty() {
			return Err(QueueError::NotFound(request_id.to_string()));
		}
		info!(request_id, "request canceled");
		Ok(())
	}

	/// Fetch a fully loaded request.
	///
	/// With an ID, that request is returned (`NotFound` if absent). Without
	/// one, a random eligible Waiting request is picked from both ends of the
	/// queue; `Ok(None)` when nothing is eligible. In assign mode the request
	/// is checked out as Assigned.
	pub async fn get(&self, request_id: Option<&str>, assign: bool) -> Result<Option<Request>, QueueError> {
		let request_id = match request_id {
			Some(id) => id.to_string(),
			None => match self.pick_random_waiting().await? {
				Some(id) => id,
				None => return Ok(None),
			},
		};

		let mut row = self.load_request_row(&request_id).await?;

		if assign {
			match parse_status::<RequestStatus>(&row.status)? {
				RequestStatus::Assigned => return Err(QueueError::AlreadyAssigned(request_id)),
				RequestStatus::Waiting | RequestStatus::Scheduled => {
					// Plain update, no row lock: collisions between concurrent
					// executors are only made unlikely by the random pick.
					let now = now_millis();
					self.db
						.db
						.query("UPDATE request SET status = 'Assigned', last_update = $now WHERE request_id = $rid")
						.bind(("rid", request_id.clone()))
						.bind(("now", now))
						.await
						.map_err(db_err)?
						.check()
						.map_err(db_err)?;
					row.status = RequestStatus::Assigned.as_str().to_string();
					row.last_update = now;
					debug!(request_id = %request_id, "request assigned");
				}
				status => debug!(request_id = %request_id, %status, "terminal request returned unassigned"),
			}
		}

		self.assemble(row).await.map(Some)
	}

	/// Fetch up to `limit` eligible Waiting requests, oldest first.
	///
	/// In assign mode selection and assignment happen in one transaction and
	/// only rows still Waiting are taken, so concurrent callers never receive
	/// the same request.
	pub async fn get_bulk(&self, limit: usize, assign: bool) -> Result<BTreeMap<String, Request>, QueueError> {
		let now = now_millis();
		let ids: Vec<IdRow> = if assign {
			let mut response = self
				.db
				.db
				.query(
					"BEGIN TRANSACTION;
                     LET $picked = (SELECT id, last_update FROM request
                         WHERE status = 'Waiting' AND not_before <= $now
                         ORDER BY last_update ASC LIMIT $limit);
                     UPDATE $picked.id SET status = 'Assigned', last_update = $now
                         WHERE status = 'Waiting' RETURN request_id;
                     COMMIT TRANSACTION;",
				)
				.bind(("now", now))
				.bind(("limit", limit as i64))
				.await
				.map_err(db_err)?
				.check()
				.map_err(db_err)?;
			// BEGIN, LET, UPDATE, COMMIT
			response.take(2).map_err(db_err)?
		} else {
			let mut response = self
				.db
				.db
				.query(
					"SELECT request_id, last_update FROM request
                     WHERE status = 'Waiting' AND not_before <= $now
                     ORDER BY last_update ASC LIMIT $limit",
				)
				.bind(("now", now))
				.bind(("limit", limit as i64))
				.await
				.map_err(db_err)?;
			let rows: Vec<QueueRow> = response.take(0).map_err(db_err)?;
			rows.into_iter().map(|r| IdRow { request_id: r.request_id }).collect()
		};

		let mut requests = BTreeMap::new();
		for IdRow { request_id } in ids {
			let row = self.load_request_row(&request_id).await?;
			let request = self.assemble(row).await?;
			requests.insert(request_id, request);
		}
		if assign && !requests.is_empty() {
			debug!(count = requests.len(), "bulk assigned requests");
		}
		Ok(requests)
	}

	pub async fn get_status(&self, request_id: &str) -> Result<RequestStatus, QueueError> {
		self.stored_status(request_id)
			.await?
			.ok_or_else(|| QueueError::NotFound(request_id.to_string()))
	}

	/// Request IDs by status and last-update window, oldest update first.
	pub async fn list_ids(&self, filter: &ListFilter) -> Result<Vec<String>, QueueError> {
		let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
		let since = filter.since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
		let until = filter.until.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

		let mut response = self
			.db
			.db
			.query(
				"SELECT request_id, last_update FROM request
                 WHERE (array::len($statuses) = 0 OR status IN $statuses)
                   AND last_update >= $since AND last_update <= $until
                 ORDER BY last_update ASC LIMIT $limit",
			)
			.bind(("statuses", statuses))
			.bind(("since", since))
			.bind(("until", until))
			.bind(("limit", filter.limit as i64))
			.await
			.map_err(db_err)?;

		let rows: Vec<QueueRow> = response.take(0).map_err(db_err)?;
		Ok(rows.into_iter().map(|r| r.request_id).collect())
	}

	/// Delete a request with its operations and files, all or nothing.
	pub async fn delete(&self, request_id: &str) -> Result<(), QueueError> {
		self.get_status(request_id).await?;

		let mut response = self
			.db
			.db
			.query(
				"BEGIN TRANSACTION;
                 DELETE operation_file WHERE request_id = $rid;
                 DELETE operation WHERE request_id = $rid;
                 DELETE request WHERE request_id = $rid;
                 COMMIT TRANSACTION;",
			)
			.bind(("rid", request_id.to_string()))
			.await
			.map_err(db_err)?;

		if let Some(first) = statement_errors(&mut response).into_iter().next() {
			warn!(request_id, error = %first, "request delete rolled back");
			return Err(QueueError::DbError(first));
		}
		info!(request_id, "request deleted");
		Ok(())
	}

	/// One line per operation, for display.
	pub async fn get_digest(&self, request_id: &str) -> Result<String, QueueError> {
		let row = self.load_request_row(request_id).await?;
		Ok(self.assemble(row).await?.digest())
	}

	pub async fn request_id_for_name(&self, name: &str) -> Result<String, QueueError> {
		self.find_by_name(name)
			.await?
			.ok_or_else(|| QueueError::NotFound(name.to_string()))
	}

	async fn find_by_name(&self, name: &str) -> Result<Option<String>, QueueError> {
		let mut response = self
			.db
			.db
			.query("SELECT request_id FROM request WHERE name = $name")
			.bind(("name", name.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<IdRow> = response.take(0).map_err(db_err)?;
		Ok(rows.into_iter().next().map(|r| r.request_id))
	}

	async fn stored_status(&self, request_id: &str) -> Result<Option<RequestStatus>, QueueError> {
		let mut response = self
			.db
			.db
			.query("SELECT status FROM request WHERE request_id = $rid")
			.bind(("rid", request_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<StatusRow> = response.take(0).map_err(db_err)?;
		rows.into_iter().next().map(|r| parse_status(&r.status)).transpose()
	}

	/// Union of the oldest and newest eligible IDs, shuffled, one picked.
	async fn pick_random_waiting(&self) -> Result<Option<String>, QueueError> {
		let mut response = self
			.db
			.db
			.query(format!(
				"SELECT request_id, last_update FROM request
                 WHERE status = 'Waiting' AND not_before <= $now
                 ORDER BY last_update ASC LIMIT {SAMPLE_OLDEST};
                 SELECT request_id, last_update FROM request
                 WHERE status = 'Waiting' AND not_before <= $now
                 ORDER BY last_update DESC LIMIT {SAMPLE_NEWEST};"
			))
			.bind(("now", now_millis()))
			.await
			.map_err(db_err)?;

		let oldest: Vec<QueueRow> = response.take(0).map_err(db_err)?;
		let newest: Vec<QueueRow> = response.take(1).map_err(db_err)?;

		let mut candidates: Vec<String> = oldest
			.into_iter()
			.chain(newest)
			.map(|r| r.request_id)
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect();

		{
			let mut rng = rand::thread_rng();
			candidates.shuffle(&mut rng);
		}

		debug!(candidates = candidates.len(), "sampled waiting requests");
		Ok(candidates.into_iter().next())
	}

	async fn load_request_row(&self, request_id: &str) -> Result<RequestRow, QueueError> {
		let mut response = self
			.db
			.db
			.query(format!("SELECT {REQUEST_FIELDS} FROM request WHERE request_id = $rid"))
			.bind(("rid", request_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<RequestRow> = response.take(0).map_err(db_err)?;
		rows.into_iter()
			.next()
			.ok_or_else(|| QueueError::NotFound(request_id.to_string()))
	}

	async fn assemble(&self, row: RequestRow) -> Result<Request, QueueError> {
		let mut response = self
			.db
			.db
			.query(format!(
				"SELECT {OPERATION_FIELDS} FROM operation WHERE request_id = $rid ORDER BY op_order ASC;
                 SELECT {FILE_FIELDS} FROM operation_file WHERE request_id = $rid ORDER BY position ASC;"
			))
			.bind(("rid", row.request_id.clone()))
			.await
			.map_err(db_err)?;

		let op_rows: Vec<OperationRow> = response.take(0).map_err(db_err)?;
		let file_rows: Vec<FileRow> = response.take(1).map_err(db_err)?;

		let mut files_by_op: BTreeMap<String, Vec<File>> = BTreeMap::new();
		for f in file_rows {
			let op_id = f.operation_id.clone();
			files_by_op.entry(op_id).or_default().push(file_from_row(f)?);
		}

		let mut operations = Vec::with_capacity(op_rows.len());
		for op in op_rows {
			let files = files_by_op.remove(&op.operation_id).unwrap_or_default();
			operations.push(operation_from_row(op, files)?);
		}

		Ok(Request {
			request_id: Some(row.request_id),
			name: row.name,
			status: parse_status(&row.status)?,
			job_id: row.job_id,
			owner_dn: row.owner_dn,
			owner_group: row.owner_group,
			source_component: row.source_component,
			creation_time: Some(from_millis(row.creation_time)),
			submit_time: Some(from_millis(row.submit_time)),
			last_update: Some(from_millis(row.last_update)),
			not_before: (row.not_before > 0).then(|| from_millis(row.not_before)),
			operations,
		})
	}
}

/// Fill in missing identifiers and timestamps.
fn stamp(request: &mut Request, now: i64) {
	let now_dt = from_millis(now);
	request.creation_time.get_or_insert(now_dt);
	request.submit_time.get_or_insert(now_dt);
	request.last_update = Some(now_dt);

	for op in &mut request.operations {
		op.operation_id.get_or_insert_with(|| ulid::Ulid::new().to_string());
		op.creation_time.get_or_insert(now_dt);
		op.submit_time.get_or_insert(now_dt);
		op.last_update = Some(now_dt);
		for file in &mut op.files {
			file.file_id.get_or_insert_with(|| ulid::Ulid::new().to_string());
		}
	}
}

fn to_rows(request: &Request, request_id: &str) -> (RequestRow, Vec<OperationRow>, Vec<FileRow>) {
	let millis = |t: Option<DateTime<Utc>>| t.map(|t| t.timestamp_millis()).unwrap_or(0);

	let request_row = RequestRow {
		request_id: request_id.to_string(),
		name: request.name.clone(),
		status: request.status.as_str().to_string(),
		job_id: request.job_id,
		owner_dn: request.owner_dn.clone(),
		owner_group: request.owner_group.clone(),
		source_component: request.source_component.clone(),
		creation_time: millis(request.creation_time),
		submit_time: millis(request.submit_time),
		last_update: millis(request.last_update),
		not_before: millis(request.not_before),
	};

	let mut operation_rows = Vec::with_capacity(request.operations.len());
	let mut file_rows = Vec::new();
	for op in &request.operations {
		let operation_id = op.operation_id.clone().unwrap_or_default();
		operation_rows.push(OperationRow {
			operation_id: operation_id.clone(),
			request_id: request_id.to_string(),
			kind: op.kind.as_str().to_string(),
			op_order: op.order as i64,
			status: op.status.as_str().to_string(),
			source_se: op.source_se.clone(),
			target_se: op.target_se.clone(),
			catalog: op.catalog.clone(),
			arguments: op.arguments.clone(),
			error: op.error.clone(),
			creation_time: millis(op.creation_time),
			submit_time: millis(op.submit_time),
			last_update: millis(op.last_update),
		});
		for (position, f) in op.files.iter().enumerate() {
			file_rows.push(FileRow {
				file_id: f.file_id.clone().unwrap_or_default(),
				operation_id: operation_id.clone(),
				request_id: request_id.to_string(),
				position: position as i64,
				lfn: f.lfn.clone(),
				pfn: f.pfn.clone(),
				checksum_type: f.checksum_type.map(|c| c.as_str().to_string()),
				checksum: f.checksum.clone(),
				guid: f.guid.clone(),
				size: f.size as i64,
				attempt: f.attempt as i64,
				status: f.status.as_str().to_string(),
				error: f.error.clone(),
				transfer_job: f.transfer_job.clone(),
			});
		}
	}

	(request_row, operation_rows, file_rows)
}

fn operation_from_row(row: OperationRow, files: Vec<File>) -> Result<Operation, QueueError> {
	Ok(Operation {
		operation_id: Some(row.operation_id),
		kind: parse_status::<OperationType>(&row.kind)?,
		order: row.op_order as u32,
		status: parse_status::<OperationStatus>(&row.status)?,
		source_se: row.source_se,
		target_se: row.target_se,
		catalog: row.catalog,
		arguments: row.arguments,
		error: row.error,
		creation_time: Some(from_millis(row.creation_time)),
		submit_time: Some(from_millis(row.submit_time)),
		last_update: Some(from_millis(row.last_update)),
		files,
	})
}

fn file_from_row(row: FileRow) -> Result<File, QueueError> {
	Ok(File {
		file_id: Some(row.file_id),
		lfn: row.lfn,
		pfn: row.pfn,
		checksum_type: row.checksum_type.as_deref().map(parse_status).transpose()?,
		checksum: row.checksum,
		guid: row.guid,
		size: row.size.max(0) as u64,
		attempt: row.attempt.max(0) as u32,
		status: parse_status::<FileStatus>(&row.status)?,
		error: row.error,
		transfer_job: row.transfer_job,
	})
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, QueueError> {
	s.parse::<T>().map_err(QueueError::Corrupt)
}
