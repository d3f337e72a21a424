use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bulk job on the external transfer service, built from part of one
/// Transfer operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferJob {
    pub job_id: String,
    pub request_id: String,
    pub operation_id: String,
    pub source_se: String,
    pub target_se: String,
    pub multi_hop_se: Option<String>,
    pub activity: Option<String>,
    pub priority: u8,
    /// Issued by the service on submission.
    pub fts_guid: Option<String>,
    pub status: TransferJobStatus,
    pub error: Option<String>,
    /// Percentage of tracked files in a terminal state.
    pub completeness: u8,
    pub files: Vec<TransferFile>,
    pub accounting: Option<TransferAccounting>,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl TransferJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn file_mut(&mut self, file_id: &str) -> Option<&mut TransferFile> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }
}

/// The service-side view of one checked out file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferFile {
    pub file_id: String,
    pub lfn: String,
    pub state: TransferFileState,
    pub error: Option<String>,
}

/// Job-level states of the transfer service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferJobStatus {
    New,
    Submitted,
    Ready,
    Active,
    Staging,
    Finished,
    FinishedDirty,
    Failed,
    Canceled,
}

impl TransferJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferJobStatus::New => "New",
            TransferJobStatus::Submitted => "Submitted",
            TransferJobStatus::Ready => "Ready",
            TransferJobStatus::Active => "Active",
            TransferJobStatus::Staging => "Staging",
            TransferJobStatus::Finished => "Finished",
            TransferJobStatus::FinishedDirty => "Finisheddirty",
            TransferJobStatus::Failed => "Failed",
            TransferJobStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferJobStatus::Finished
                | TransferJobStatus::FinishedDirty
                | TransferJobStatus::Failed
                | TransferJobStatus::Canceled
        )
    }
}

impl fmt::Display for TransferJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both our own spelling and the service's upper-case one.
impl FromStr for TransferJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(TransferJobStatus::New),
            "SUBMITTED" => Ok(TransferJobStatus::Submitted),
            "READY" => Ok(TransferJobStatus::Ready),
            "ACTIVE" => Ok(TransferJobStatus::Active),
            "STAGING" => Ok(TransferJobStatus::Staging),
            "FINISHED" => Ok(TransferJobStatus::Finished),
            "FINISHEDDIRTY" => Ok(TransferJobStatus::FinishedDirty),
            "FAILED" => Ok(TransferJobStatus::Failed),
            "CANCELED" | "CANCELLED" => Ok(TransferJobStatus::Canceled),
            other => Err(format!("unknown transfer job state: {other}")),
        }
    }
}

/// File-level states of the transfer service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferFileState {
    New,
    Submitted,
    Ready,
    Active,
    Staging,
    Started,
    Archiving,
    OnHold,
    NotUsed,
    Finished,
    Failed,
    Canceled,
}

impl TransferFileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFileState::New => "New",
            TransferFileState::Submitted => "Submitted",
            TransferFileState::Ready => "Ready",
            TransferFileState::Active => "Active",
            TransferFileState::Staging => "Staging",
            TransferFileState::Started => "Started",
            TransferFileState::Archiving => "Archiving",
            TransferFileState::OnHold => "On_hold",
            TransferFileState::NotUsed => "Not_used",
            TransferFileState::Finished => "Finished",
            TransferFileState::Failed => "Failed",
            TransferFileState::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferFileState::Finished | TransferFileState::Failed | TransferFileState::Canceled)
    }
}

impl fmt::Display for TransferFileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferFileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(TransferFileState::New),
            "SUBMITTED" => Ok(TransferFileState::Submitted),
            "READY" => Ok(TransferFileState::Ready),
            "ACTIVE" => Ok(TransferFileState::Active),
            "STAGING" => Ok(TransferFileState::Staging),
            "STARTED" => Ok(TransferFileState::Started),
            "ARCHIVING" => Ok(TransferFileState::Archiving),
            "ON_HOLD" | "ON_HOLD_STAGING" => Ok(TransferFileState::OnHold),
            "NOT_USED" => Ok(TransferFileState::NotUsed),
            "FINISHED" => Ok(TransferFileState::Finished),
            "FAILED" => Ok(TransferFileState::Failed),
            "CANCELED" | "CANCELLED" => Ok(TransferFileState::Canceled),
            other => Err(format!("unknown transfer file state: {other}")),
        }
    }
}

/// Produced once, from the terminal snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferAccounting {
    pub job_id: String,
    pub source_se: String,
    pub target_se: String,
    pub final_status: TransferJobStatus,
    pub files_total: u32,
    pub files_succeeded: u32,
    pub transferred_bytes: u64,
    /// Sum of per-file transfer durations, in seconds.
    pub transfer_time: f64,
}
