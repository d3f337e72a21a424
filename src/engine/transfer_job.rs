use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::monitor::Inconsistency;
use crate::{
	config::TransferSettings,
	fts::{FileMetadata, FtsClient, FtsError, JobMetadata, JobParams, JobSubmission, TransferDescriptor},
	models::{File, FileStatus, Operation, OperationType, TransferFile, TransferFileState, TransferJob, TransferJobStatus},
	storage::{StorageCatalog, StorageError},
};

#[derive(Debug, Error)]
pub enum TransferError {
	/// Invalid input to job building. Needs operator attention, never retried.
	#[error("cannot build transfer job: {0}")]
	Construction(String),

	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error(transparent)]
	Service(#[from] FtsError),

	#[error("transfer job {0} was never submitted")]
	NotSubmitted(String),

	/// The service reports a terminal job with non-terminal files.
	#[error("transfer job {job} is terminal but {} file(s) are not", .files.len())]
	Inconsistent { job: String, files: Vec<Inconsistency> },
}

impl TransferError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, TransferError::Service(FtsError::Client(_)))
	}
}

/// Files of one operation grouped into a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
	pub source_se: String,
	pub target_se: String,
	pub multi_hop_se: Option<String>,
	pub file_ids: Vec<String>,
}

/// Job ready for submission, with the files left out of it.
#[derive(Debug, Clone)]
pub struct BuiltJob {
	pub submission: JobSubmission,
	pub accepted: Vec<String>,
	/// File id and the reason it could not be included.
	pub rejected: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOutcome {
	pub fts_guid: Option<String>,
	pub accepted: usize,
	pub rejected: usize,
}

/// Split the available files of a Transfer operation into jobs.
///
/// Files that used up their attempts are failed here instead of being planned.
/// Chains (configured multi-hop or an injected staging hop) get one file each.
pub fn plan_jobs(
	op: &mut Operation,
	storage: &StorageCatalog,
	settings: &TransferSettings,
) -> Result<Vec<JobPlan>, TransferError> {
	if op.kind != OperationType::Transfer {
		return Err(TransferError::Construction(format!("{} is not a transfer operation", op.kind)));
	}
	let source_se = op
		.source_se
		.clone()
		.filter(|s| !s.is_empty())
		.ok_or_else(|| TransferError::Construction("transfer operation without source SE".into()))?;
	let target_se = match op.target_ses().as_slice() {
		[one] => one.clone(),
		[] => return Err(TransferError::Construction("transfer operation without target SE".into())),
		many => {
			return Err(TransferError::Construction(format!(
				"transfer operation with {} target SEs, expected one",
				many.len()
			)))
		}
	};

	storage.element(&source_se)?;
	storage.element(&target_se)?;

	let mut available = Vec::new();
	for file in op.files.iter_mut().filter(|f| f.is_available()) {
		if file.attempt >= settings.max_attempts {
			file.status = FileStatus::Failed;
			file.error = Some(format!("maximum of {} attempts reached", settings.max_attempts));
			continue;
		}
		if let Some(id) = &file.file_id {
			available.push(id.clone());
		}
	}
	if available.is_empty() {
		return Ok(Vec::new());
	}

	let multi_hop_se = settings.multi_hop_for(&source_se, &target_se);
	let first_hop = multi_hop_se.as_deref().unwrap_or(&target_se);
	// A protocol mismatch makes every file fail at build time; plan normally then.
	let staging_hop = storage
		.needs_staging_hop(&source_se, first_hop, &settings.protocols)
		.unwrap_or(false);
	let per_job = if multi_hop_se.is_some() || staging_hop { 1 } else { settings.max_files_per_job.max(1) };

	let plans = available
		.chunks(per_job)
		.map(|chunk| JobPlan {
			source_se: source_se.clone(),
			target_se: target_se.clone(),
			multi_hop_se: multi_hop_se.clone(),
			file_ids: chunk.to_vec(),
		})
		.collect::<Vec<_>>();
	debug!(jobs = plans.len(), files = available.len(), %source_se, %target_se, "planned transfer jobs");
	Ok(plans)
}

/// One hop of a chain: read with `read_proto` at `from`, write with
/// `write_proto` at `to`.
#[derive(Debug, Clone)]
struct Leg {
	from: String,
	to: String,
	read_proto: String,
	write_proto: String,
}

impl TransferJob {
	pub fn new(request_id: &str, op: &Operation, plan: &JobPlan, settings: &TransferSettings) -> Self {
		let now = Utc::now();
		let files = plan
			.file_ids
			.iter()
			.filter_map(|id| op.files.iter().find(|f| f.file_id.as_deref() == Some(id.as_str())))
			.map(|f| TransferFile {
				file_id: f.file_id.clone().unwrap_or_default(),
				lfn: f.lfn.clone(),
				state: TransferFileState::New,
				error: None,
			})
			.collect();

		TransferJob {
			job_id: ulid::Ulid::new().to_string(),
			request_id: request_id.to_string(),
			operation_id: op.operation_id.clone().unwrap_or_default(),
			source_se: plan.source_se.clone(),
			target_se: plan.target_se.clone(),
			multi_hop_se: plan.multi_hop_se.clone(),
			activity: settings.activity.clone(),
			priority: settings.default_priority,
			fts_guid: None,
			status: TransferJobStatus::New,
			error: None,
			completeness: 0,
			files,
			accounting: None,
			created: now,
			last_update: now,
		}
	}

	/// Assemble the service job for the files this job checked out.
	pub fn build(&self, op: &Operation, storage: &StorageCatalog, settings: &TransferSettings) -> Result<BuiltJob, TransferError> {
		if self.multi_hop_se.is_some() && self.files.len() > 1 {
			return Err(TransferError::Construction(format!(
				"multi-hop job {} with {} files, only one is allowed",
				self.job_id,
				self.files.len()
			)));
		}

		let (source, target) = match (storage.element(&self.source_se), storage.element(&self.target_se)) {
			(Ok(source), Ok(target)) => (source, target),
			(Err(e), _) | (_, Err(e)) => return Ok(self.reject_all(e.to_string())),
		};

		let hops: Vec<(&str, &str)> = match &self.multi_hop_se {
			Some(hop) => vec![(self.source_se.as_str(), hop.as_str()), (hop.as_str(), self.target_se.as_str())],
			None => vec![(self.source_se.as_str(), self.target_se.as_str())],
		};

		let mut legs = Vec::with_capacity(hops.len() + 1);
		for (from, to) in hops {
			match storage.negotiate(from, to, &settings.protocols) {
				Ok(proto) => legs.push(Leg {
					from: from.to_string(),
					to: to.to_string(),
					read_proto: proto.clone(),
					write_proto: proto,
				}),
				Err(e) => return Ok(self.reject_all(e.to_string())),
			}
		}

		if source.tape {
			if let Some(staging) = source.staging_protocol() {
				if staging != legs[0].read_proto {
					if self.files.len() > 1 {
						return Err(TransferError::Construction(format!(
							"staging hop on {} needs one file per job, got {}",
							source.name,
							self.files.len()
						)));
					}
					let transfer_proto = legs[0].read_proto.clone();
					legs.insert(
						0,
						Leg {
							from: source.name.clone(),
							to: source.name.clone(),
							read_proto: staging.to_string(),
							write_proto: transfer_proto,
						},
					);
				}
			}
		}

		// Every leg that reads from tape, intermediates included.
		let bring_online = legs
			.iter()
			.any(|leg| storage.element(&leg.from).is_ok_and(|se| se.tape))
			.then(|| settings.pin_lifetime().as_secs());

		let archive_timeout = (target.tape && target.archive_timeout).then_some(settings.archive_timeout_secs);

		let mut descriptors = Vec::new();
		let mut accepted = Vec::new();
		let mut rejected = Vec::new();
		for tf in &self.files {
			let Some(file) = op.files.iter().find(|f| f.file_id.as_deref() == Some(tf.file_id.as_str())) else {
				rejected.push((tf.file_id.clone(), "file no longer part of the operation".to_string()));
				continue;
			};
			match chain_descriptors(file, &legs, storage, settings) {
				Ok(mut chain) => {
					descriptors.append(&mut chain);
					accepted.push(tf.file_id.clone());
				}
				Err(e) => rejected.push((tf.file_id.clone(), e.to_string())),
			}
		}

		let submission = JobSubmission {
			files: descriptors,
			params: JobParams {
				verify_checksum: true,
				overwrite: false,
				multihop: legs.len() > 1,
				priority: self.priority,
				bring_online,
				copy_pin_lifetime: bring_online,
				archive_timeout,
				source_spacetoken: source.space_token.clone(),
				spacetoken: target.space_token.clone(),
				job_metadata: JobMetadata {
					job_id: self.job_id.clone(),
					operation_id: self.operation_id.clone(),
					request_id: self.request_id.clone(),
				},
			},
		};

		Ok(BuiltJob { submission, accepted, rejected })
	}

	/// Build and submit the job, then check the accepted files out.
	pub async fn submit<F: FtsClient>(
		&mut self,
		op: &mut Operation,
		storage: &StorageCatalog,
		settings: &TransferSettings,
		fts: &F,
	) -> Result<SubmitOutcome, TransferError> {
		for tf in &self.files {
			if let Some(prev) = op
				.files
				.iter()
				.find(|f| f.file_id.as_deref() == Some(tf.file_id.as_str()))
				.and_then(|f| f.transfer_job.as_deref())
			{
				warn!(file_id = %tf.file_id, previous_job = prev, "file still checked out by a previous job");
			}
		}

		let built = self.build(op, storage, settings)?;

		for (file_id, reason) in &built.rejected {
			warn!(job_id = %self.job_id, %file_id, %reason, "file excluded from transfer job");
			if let Some(file) = op.file_mut(file_id) {
				file.status = FileStatus::Failed;
				file.error = Some(reason.clone());
			}
			if let Some(tf) = self.file_mut(file_id) {
				tf.state = TransferFileState::Failed;
				tf.error = Some(reason.clone());
			}
		}

		if built.accepted.is_empty() {
			self.status = TransferJobStatus::Failed;
			self.error = Some("no file of the job could be resolved".into());
			self.completeness = 100;
			return Ok(SubmitOutcome { fts_guid: None, accepted: 0, rejected: built.rejected.len() });
		}

		let guid = match fts.submit(&built.submission).await {
			Ok(guid) => guid,
			Err(e) => {
				self.error = Some(e.to_string());
				return Err(e.into());
			}
		};

		for tf in &mut self.files {
			let file = op.files.iter_mut().find(|f| f.file_id.as_deref() == Some(tf.file_id.as_str()));
			let Some(file) = file else { continue };
			file.attempt += 1;
			if built.accepted.contains(&tf.file_id) {
				check_out(file, &guid);
				tf.state = TransferFileState::Submitted;
			}
		}

		self.fts_guid = Some(guid.clone());
		self.status = TransferJobStatus::Submitted;
		self.error = None;
		self.last_update = Utc::now();

		info!(
			job_id = %self.job_id,
			fts_guid = %guid,
			source = %self.source_se,
			target = %self.target_se,
			files = built.accepted.len(),
			"transfer job submitted"
		);
		Ok(SubmitOutcome { fts_guid: Some(guid), accepted: built.accepted.len(), rejected: built.rejected.len() })
	}

	fn reject_all(&self, reason: String) -> BuiltJob {
		BuiltJob {
			submission: JobSubmission {
				files: Vec::new(),
				params: JobParams {
					verify_checksum: true,
					overwrite: false,
					multihop: false,
					priority: self.priority,
					bring_online: None,
					copy_pin_lifetime: None,
					archive_timeout: None,
					source_spacetoken: None,
					spacetoken: None,
					job_metadata: JobMetadata {
						job_id: self.job_id.clone(),
						operation_id: self.operation_id.clone(),
						request_id: self.request_id.clone(),
					},
				},
			},
			accepted: Vec::new(),
			rejected: self.files.iter().map(|f| (f.file_id.clone(), reason.clone())).collect(),
		}
	}
}

fn check_out(file: &mut File, guid: &str) {
	file.transfer_job = Some(guid.to_string());
	file.status = FileStatus::Scheduled;
	file.error = None;
}

/// One descriptor per leg. Only the last one carries the file id.
fn chain_descriptors(
	file: &File,
	legs: &[Leg],
	storage: &StorageCatalog,
	settings: &TransferSettings,
) -> Result<Vec<TransferDescriptor>, StorageError> {
	let file_id = file.file_id.clone().unwrap_or_default();
	let checksum = file.transfer_checksum();
	let last = legs.len() - 1;

	legs.iter()
		.enumerate()
		.map(|(i, leg)| -> Result<TransferDescriptor, StorageError> {
			let src = storage.element(&leg.from)?.url(&file.lfn, &leg.read_proto)?;
			let dst = storage.element(&leg.to)?.url(&file.lfn, &leg.write_proto)?;
			Ok(TransferDescriptor {
				sources: vec![src],
				destinations: vec![dst],
				checksum: checksum.clone(),
				filesize: file.size,
				metadata: (i == last).then(|| FileMetadata { file_id: file_id.clone(), lfn: Some(file.lfn.clone()) }),
				activity: settings.activity.clone(),
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::{MultiHopRoute, TransferSettings},
		fts::testing::FakeFts,
		models::{ChecksumType, File},
		storage::tests::sample_catalog,
	};

	fn settings() -> TransferSettings {
		TransferSettings {
			protocols: vec!["root".into(), "https".into(), "srm".into()],
			max_files_per_job: 2,
			max_attempts: 3,
			pin_lifetime_secs: 3600,
			archive_timeout_secs: 7200,
			..Default::default()
		}
	}

	fn op(source: &str, target: &str, lfns: &[&str]) -> Operation {
		let mut op = Operation::transfer(source, target);
		op.operation_id = Some("op-1".into());
		for (i, lfn) in lfns.iter().enumerate() {
			let mut f = File::new(*lfn).with_size(100).with_checksum(ChecksumType::Adler32, "X");
			f.file_id = Some(format!("f{}", i + 1));
			op.files.push(f);
		}
		op
	}

	fn job_for(op: &Operation, hop: Option<&str>, settings: &TransferSettings) -> TransferJob {
		let plan = JobPlan {
			source_se: op.source_se.clone().unwrap(),
			target_se: op.target_se.clone().unwrap(),
			multi_hop_se: hop.map(str::to_string),
			file_ids: op.files.iter().filter_map(|f| f.file_id.clone()).collect(),
		};
		TransferJob::new("req-1", op, &plan, settings)
	}

	#[test]
	fn plan_chunks_by_max_files() {
		let catalog = sample_catalog();
		let mut o = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2", "/vo/f3"]);
		let plans = plan_jobs(&mut o, &catalog, &settings()).unwrap();
		assert_eq!(plans.len(), 2);
		assert_eq!(plans[0].file_ids, vec!["f1", "f2"]);
		assert_eq!(plans[1].file_ids, vec!["f3"]);
	}

	#[test]
	fn plan_skips_checked_out_and_fails_exhausted_files() {
		let catalog = sample_catalog();
		let mut o = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2", "/vo/f3"]);
		o.files[0].transfer_job = Some("old".into());
		o.files[1].attempt = 3;

		let plans = plan_jobs(&mut o, &catalog, &settings()).unwrap();
		assert_eq!(plans.len(), 1);
		assert_eq!(plans[0].file_ids, vec!["f3"]);
		assert_eq!(o.files[1].status, FileStatus::Failed);
		assert!(o.files[1].error.as_deref().unwrap().contains("attempts"));
	}

	#[test]
	fn plan_uses_single_file_jobs_for_chains() {
		let catalog = sample_catalog();
		let mut staged = op("TAPE-T", "DISK-B", &["/vo/f1", "/vo/f2"]);
		assert_eq!(plan_jobs(&mut staged, &catalog, &settings()).unwrap().len(), 2);

		let mut cfg = settings();
		cfg.multi_hop.push(MultiHopRoute { source: "DISK-A".into(), target: "DISK-B".into(), via: "BUFFER".into() });
		let mut hopped = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2"]);
		let plans = plan_jobs(&mut hopped, &catalog, &cfg).unwrap();
		assert_eq!(plans.len(), 2);
		assert_eq!(plans[0].multi_hop_se.as_deref(), Some("BUFFER"));
	}

	#[test]
	fn plan_rejects_bad_operations() {
		let catalog = sample_catalog();
		let mut many = op("DISK-A", "DISK-B,TAPE-T", &["/vo/f1"]);
		assert!(matches!(plan_jobs(&mut many, &catalog, &settings()), Err(TransferError::Construction(_))));

		let mut unknown = op("DISK-A", "NOWHERE", &["/vo/f1"]);
		assert!(matches!(plan_jobs(&mut unknown, &catalog, &settings()), Err(TransferError::Storage(_))));

		let mut removal = Operation::new(OperationType::Removal);
		assert!(matches!(plan_jobs(&mut removal, &catalog, &settings()), Err(TransferError::Construction(_))));
	}

	#[test]
	fn simple_job_tags_every_file() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2"]);
		let built = job_for(&o, None, &cfg).build(&o, &catalog, &cfg).unwrap();

		assert!(built.rejected.is_empty());
		assert_eq!(built.submission.files.len(), 2);
		assert!(!built.submission.params.multihop);
		assert_eq!(built.submission.params.bring_online, None);
		assert_eq!(built.submission.params.spacetoken.as_deref(), Some("VO-Disk"));
		let d = &built.submission.files[0];
		assert_eq!(d.sources, vec!["root://a.example.org//data/vo/f1"]);
		assert_eq!(d.destinations, vec!["root://b.example.org//data/vo/f1"]);
		assert_eq!(d.checksum.as_deref(), Some("ADLER32:X"));
		assert_eq!(d.metadata.as_ref().unwrap().file_id, "f1");
	}

	#[test]
	fn multi_hop_with_two_files_is_a_construction_error() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2"]);
		let err = job_for(&o, Some("BUFFER"), &cfg).build(&o, &catalog, &cfg).unwrap_err();
		assert!(matches!(err, TransferError::Construction(_)));
		assert!(!err.is_retryable());
	}

	#[tokio::test]
	async fn multi_hop_construction_error_submits_nothing() {
		let catalog = sample_catalog();
		let cfg = settings();
		let fts = FakeFts::new();
		let mut o = op("DISK-A", "DISK-B", &["/vo/f1", "/vo/f2"]);
		let mut job = job_for(&o, Some("BUFFER"), &cfg);

		let err = job.submit(&mut o, &catalog, &cfg, &fts).await.unwrap_err();
		assert!(matches!(err, TransferError::Construction(_)));
		assert!(fts.submitted().is_empty());
		assert!(o.files.iter().all(|f| f.attempt == 0 && f.transfer_job.is_none()));
	}

	#[test]
	fn multi_hop_tags_only_the_last_leg() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1"]);
		let built = job_for(&o, Some("BUFFER"), &cfg).build(&o, &catalog, &cfg).unwrap();

		assert!(built.submission.params.multihop);
		assert_eq!(built.submission.files.len(), 2);
		assert_eq!(built.submission.files[0].destinations, vec!["root://buf.example.org//buffer/vo/f1"]);
		assert!(built.submission.files[0].metadata.is_none());
		assert_eq!(built.submission.files[1].sources, vec!["root://buf.example.org//buffer/vo/f1"]);
		assert_eq!(built.submission.files[1].metadata.as_ref().unwrap().file_id, "f1");
	}

	#[test]
	fn tape_source_with_other_staging_protocol_injects_stage_hop() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("TAPE-T", "DISK-B", &["/vo/f1"]);
		let built = job_for(&o, None, &cfg).build(&o, &catalog, &cfg).unwrap();

		assert!(built.submission.params.multihop);
		assert_eq!(built.submission.params.bring_online, Some(3600));
		assert_eq!(built.submission.params.copy_pin_lifetime, Some(3600));
		assert_eq!(built.submission.files.len(), 2);
		assert_eq!(built.submission.files[0].sources, vec!["srm://t.example.org/tape/vo/f1"]);
		assert_eq!(built.submission.files[0].destinations, vec!["root://t.example.org//tape/vo/f1"]);
		assert!(built.submission.files[0].metadata.is_none());
		assert_eq!(built.submission.files[1].sources, vec!["root://t.example.org//tape/vo/f1"]);
		assert_eq!(built.submission.files[1].destinations, vec!["root://b.example.org//data/vo/f1"]);
		assert!(built.submission.files[1].metadata.is_some());
	}

	#[test]
	fn tape_source_with_same_protocol_only_brings_online() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("TAPE-SRM", "TAPE-T", &["/vo/f1", "/vo/f2"]);
		let built = job_for(&o, None, &cfg).build(&o, &catalog, &cfg).unwrap();

		assert!(!built.submission.params.multihop);
		assert_eq!(built.submission.params.bring_online, Some(3600));
		assert_eq!(built.submission.files.len(), 2);
		// tape destination with archive support
		assert_eq!(built.submission.params.archive_timeout, Some(7200));
	}

	#[test]
	fn tape_intermediate_brings_second_leg_online() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1"]);
		let built = job_for(&o, Some("TAPE-T"), &cfg).build(&o, &catalog, &cfg).unwrap();

		assert!(built.submission.params.multihop);
		assert_eq!(built.submission.params.bring_online, Some(3600));
		assert_eq!(built.submission.files.len(), 2);
		assert_eq!(built.submission.files[1].sources, vec!["root://t.example.org//tape/vo/f1"]);
		assert_eq!(built.submission.params.archive_timeout, None);
	}

	#[test]
	fn disk_only_legs_skip_bring_online() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1"]);
		let built = job_for(&o, Some("BUFFER"), &cfg).build(&o, &catalog, &cfg).unwrap();
		assert_eq!(built.submission.params.bring_online, None);
		assert_eq!(built.submission.params.copy_pin_lifetime, None);
	}

	#[test]
	fn unresolvable_files_are_rejected_not_dropped() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "DISK-B", &["/vo/f1", "relative/f2"]);
		let built = job_for(&o, None, &cfg).build(&o, &catalog, &cfg).unwrap();

		assert_eq!(built.accepted, vec!["f1"]);
		assert_eq!(built.rejected.len(), 1);
		assert_eq!(built.rejected[0].0, "f2");
		assert_eq!(built.submission.files.len(), 1);
	}

	#[test]
	fn no_common_protocol_rejects_everything() {
		let catalog = sample_catalog();
		let cfg = settings();
		let o = op("DISK-A", "TAPE-SRM", &["/vo/f1", "/vo/f2"]);
		let built = job_for(&o, None, &cfg).build(&o, &catalog, &cfg).unwrap();
		assert!(built.accepted.is_empty());
		assert_eq!(built.rejected.len(), 2);
	}

	#[tokio::test]
	async fn submit_checks_files_out() {
		let catalog = sample_catalog();
		let cfg = settings();
		let fts = FakeFts::new();
		let mut o = op("DISK-A", "DISK-B", &["/vo/f1", "bad/f2"]);
		let mut job = job_for(&o, None, &cfg);

		let outcome = job.submit(&mut o, &catalog, &cfg, &fts).await.unwrap();
		let guid = outcome.fts_guid.clone().unwrap();
		assert_eq!(outcome.accepted, 1);
		assert_eq!(outcome.rejected, 1);
		assert_eq!(job.status, TransferJobStatus::Submitted);
		assert_eq!(job.fts_guid.as_deref(), Some(guid.as_str()));

		assert_eq!(o.files[0].attempt, 1);
		assert_eq!(o.files[0].transfer_job.as_deref(), Some(guid.as_str()));
		assert_eq!(o.files[0].status, FileStatus::Scheduled);
		assert_eq!(job.files[0].state, TransferFileState::Submitted);

		assert_eq!(o.files[1].attempt, 1);
		assert_eq!(o.files[1].transfer_job, None);
		assert_eq!(o.files[1].status, FileStatus::Failed);
		assert_eq!(job.files[1].state, TransferFileState::Failed);

		assert_eq!(fts.submitted().len(), 1);
	}

	#[tokio::test]
	async fn service_failure_leaves_files_untouched() {
		let catalog = sample_catalog();
		let cfg = settings();
		let fts = FakeFts::new();
		fts.fail_next_submit("proxy expired");
		let mut o = op("DISK-A", "DISK-B", &["/vo/f1"]);
		let mut job = job_for(&o, None, &cfg);

		let err = job.submit(&mut o, &catalog, &cfg, &fts).await.unwrap_err();
		assert!(err.is_retryable());
		assert!(err.to_string().contains("proxy expired"));
		assert_eq!(o.files[0].attempt, 0);
		assert_eq!(o.files[0].status, FileStatus::Waiting);
		assert!(job.fts_guid.is_none());
	}

	#[tokio::test]
	async fn nothing_resolvable_submits_nothing() {
		let catalog = sample_catalog();
		let cfg = settings();
		let fts = FakeFts::new();
		let mut o = op("DISK-A", "DISK-B", &["bad/f1"]);
		let mut job = job_for(&o, None, &cfg);

		let outcome = job.submit(&mut o, &catalog, &cfg, &fts).await.unwrap();
		assert_eq!(outcome.fts_guid, None);
		assert_eq!(job.status, TransferJobStatus::Failed);
		assert!(fts.submitted().is_empty());
		assert_eq!(o.files[0].status, FileStatus::Failed);
	}
}
