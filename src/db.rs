use surrealdb::{
	engine::local::{Db, Mem, SurrealKv},
	IndexedResults as Response, Surreal,
};
use thiserror::Error;
use tracing::info;

use crate::config::DatabaseConfig;

#[derive(Debug, Error)]
#[error("database error: {0}")]
pub struct DbError(pub String);

impl From<surrealdb::Error> for DbError {
	fn from(e: surrealdb::Error) -> Self {
		DbError(e.to_string())
	}
}

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

/// Connect, select ns/db and run migrations.
pub async fn init(cfg: &DatabaseConfig) -> Result<DbHandle, DbError> {
	let db = if cfg.memory {
		Surreal::new::<Mem>(()).await?
	} else {
		let path = cfg.resolved_path();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| DbError(format!("{}: {e}", parent.display())))?;
		}
		info!(path = %path.display(), "opening request database");
		Surreal::new::<SurrealKv>(path).await?
	};
	db.use_ns(cfg.namespace.as_str()).use_db(cfg.database.as_str()).await?;

	run_migrations(&db).await?;

	Ok(DbHandle { db })
}

/// Fresh in-memory database with the schema applied.
pub async fn init_memory() -> Result<DbHandle, DbError> {
	init(&DatabaseConfig::in_memory()).await
}

/// DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), DbError> {
	db.query(SCHEMA_V1).await?.check()?;
	Ok(())
}

/// Error messages of every failed statement, in statement order.
pub(crate) fn statement_errors(response: &mut Response) -> Vec<String> {
	let mut errors: Vec<(usize, String)> = response
		.take_errors()
		.into_iter()
		.map(|(idx, e)| (idx, e.to_string()))
		.collect();
	errors.sort_by_key(|(idx, _)| *idx);
	errors.into_iter().map(|(_, msg)| msg).collect()
}

/// Current time as stored in the database.
pub(crate) fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
	chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE request SCHEMAFULL;
    DEFINE FIELD OVERWRITE request_id ON request TYPE string;
    DEFINE FIELD OVERWRITE name ON request TYPE string;
    DEFINE FIELD OVERWRITE status ON request TYPE string;
    DEFINE FIELD OVERWRITE job_id ON request TYPE option<int>;
    DEFINE FIELD OVERWRITE owner_dn ON request TYPE option<string>;
    DEFINE FIELD OVERWRITE owner_group ON request TYPE option<string>;
    DEFINE FIELD OVERWRITE source_component ON request TYPE option<string>;
    DEFINE FIELD OVERWRITE creation_time ON request TYPE int;
    DEFINE FIELD OVERWRITE submit_time ON request TYPE int;
    DEFINE FIELD OVERWRITE last_update ON request TYPE int;
    DEFINE FIELD OVERWRITE not_before ON request TYPE int;
    DEFINE INDEX OVERWRITE idx_request_id ON request FIELDS request_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_request_name ON request FIELDS name UNIQUE;
    DEFINE INDEX OVERWRITE idx_request_sched ON request FIELDS status, not_before, last_update;

    DEFINE TABLE OVERWRITE operation SCHEMAFULL;
    DEFINE FIELD OVERWRITE operation_id ON operation TYPE string;
    DEFINE FIELD OVERWRITE request_id ON operation TYPE string;
    DEFINE FIELD OVERWRITE kind ON operation TYPE string;
    DEFINE FIELD OVERWRITE op_order ON operation TYPE int;
    DEFINE FIELD OVERWRITE status ON operation TYPE string;
    DEFINE FIELD OVERWRITE source_se ON operation TYPE option<string>;
    DEFINE FIELD OVERWRITE target_se ON operation TYPE option<string>;
    DEFINE FIELD OVERWRITE catalog ON operation TYPE option<string>;
    DEFINE FIELD OVERWRITE arguments ON operation TYPE option<string>;
    DEFINE FIELD OVERWRITE error ON operation TYPE option<string>;
    DEFINE FIELD OVERWRITE creation_time ON operation TYPE int;
    DEFINE FIELD OVERWRITE submit_time ON operation TYPE int;
    DEFINE FIELD OVERWRITE last_update ON operation TYPE int;
    DEFINE INDEX OVERWRITE idx_operation_id ON operation FIELDS operation_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_operation_request ON operation FIELDS request_id, op_order UNIQUE;

    DEFINE TABLE OVERWRITE operation_file SCHEMAFULL;
    DEFINE FIELD OVERWRITE file_id ON operation_file TYPE string;
    DEFINE FIELD OVERWRITE operation_id ON operation_file TYPE string;
    DEFINE FIELD OVERWRITE request_id ON operation_file TYPE string;
    DEFINE FIELD OVERWRITE position ON operation_file TYPE int;
    DEFINE FIELD OVERWRITE lfn ON operation_file TYPE string;
    DEFINE FIELD OVERWRITE pfn ON operation_file TYPE option<string>;
    DEFINE FIELD OVERWRITE checksum_type ON operation_file TYPE option<string>;
    DEFINE FIELD OVERWRITE checksum ON operation_file TYPE option<string>;
    DEFINE FIELD OVERWRITE guid ON operation_file TYPE option<string>;
    DEFINE FIELD OVERWRITE size ON operation_file TYPE int;
    DEFINE FIELD OVERWRITE attempt ON operation_file TYPE int;
    DEFINE FIELD OVERWRITE status ON operation_file TYPE string;
    DEFINE FIELD OVERWRITE error ON operation_file TYPE option<string>;
    DEFINE FIELD OVERWRITE transfer_job ON operation_file TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_file_id ON operation_file FIELDS file_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_file_request ON operation_file FIELDS request_id;

    DEFINE TABLE OVERWRITE transfer_job SCHEMALESS;
    DEFINE INDEX OVERWRITE idx_transfer_job_id ON transfer_job FIELDS job_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_transfer_job_op ON transfer_job FIELDS operation_id;

    DEFINE TABLE OVERWRITE transfer_accounting SCHEMALESS;
    DEFINE INDEX OVERWRITE idx_accounting_job ON transfer_accounting FIELDS job_id UNIQUE;
";
