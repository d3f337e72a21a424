pub mod agent;
pub mod job_store;
pub mod monitor;
pub mod queue;
pub mod transfer_job;

pub use agent::{AgentError, MonitorSummary, SubmitSummary, TransferAgent};
pub use job_store::{JobStore, JobStoreError};
pub use monitor::{Inconsistency, MonitorReport};
pub use queue::{ListFilter, QueueError, RequestQueue};
pub use transfer_job::{plan_jobs, BuiltJob, JobPlan, SubmitOutcome, TransferError};
