use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file::{File, FileStatus};

/// One ordered step of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub source_se: Option<String>,
    /// Comma separated when the step targets several storage elements.
    #[serde(default)]
    pub target_se: Option<String>,
    #[serde(default)]
    pub catalog: Option<String>,
    /// Opaque payload for the executor of this step.
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<File>,
}

impl Operation {
    pub fn new(kind: OperationType) -> Self {
        Operation {
            operation_id: None,
            kind,
            order: 0,
            status: OperationStatus::Waiting,
            source_se: None,
            target_se: None,
            catalog: None,
            arguments: None,
            error: None,
            creation_time: None,
            submit_time: None,
            last_update: None,
            files: Vec::new(),
        }
    }

    pub fn transfer(source_se: impl Into<String>, target_se: impl Into<String>) -> Self {
        let mut op = Operation::new(OperationType::Transfer);
        op.source_se = Some(source_se.into());
        op.target_se = Some(target_se.into());
        op
    }

    pub fn with_file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    pub fn target_ses(&self) -> Vec<String> {
        self.target_se
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|se| !se.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn file_mut(&mut self, file_id: &str) -> Option<&mut File> {
        self.files.iter_mut().find(|f| f.file_id.as_deref() == Some(file_id))
    }

    pub fn done_files(&self) -> usize {
        self.files.iter().filter(|f| f.status == FileStatus::Done).count()
    }

    /// Derive the status from the files. Canceled is never left.
    pub fn recompute_status(&mut self) -> OperationStatus {
        if self.status == OperationStatus::Canceled {
            return self.status;
        }

        let all_terminal = self.files.iter().all(|f| f.status.is_terminal());
        let any_failed = self.files.iter().any(|f| f.status == FileStatus::Failed);
        let any_scheduled = self.files.iter().any(|f| f.status == FileStatus::Scheduled);

        self.status = if all_terminal && !any_failed {
            OperationStatus::Done
        } else if all_terminal {
            OperationStatus::Failed
        } else if any_scheduled {
            OperationStatus::Scheduled
        } else if self.status == OperationStatus::Queued {
            OperationStatus::Queued
        } else {
            OperationStatus::Waiting
        };
        self.status
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationType {
    Transfer,
    Removal,
    ReplicaRemoval,
    Registration,
    ReplicaRegistration,
    Staging,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Transfer => "Transfer",
            OperationType::Removal => "Removal",
            OperationType::ReplicaRemoval => "ReplicaRemoval",
            OperationType::Registration => "Registration",
            OperationType::ReplicaRegistration => "ReplicaRegistration",
            OperationType::Staging => "Staging",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Transfer" => Ok(OperationType::Transfer),
            "Removal" => Ok(OperationType::Removal),
            "ReplicaRemoval" => Ok(OperationType::ReplicaRemoval),
            "Registration" => Ok(OperationType::Registration),
            "ReplicaRegistration" => Ok(OperationType::ReplicaRegistration),
            "Staging" => Ok(OperationType::Staging),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OperationStatus {
    #[default]
    Waiting,
    Assigned,
    Queued,
    Scheduled,
    Done,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Waiting => "Waiting",
            OperationStatus::Assigned => "Assigned",
            OperationStatus::Queued => "Queued",
            OperationStatus::Scheduled => "Scheduled",
            OperationStatus::Done => "Done",
            OperationStatus::Failed => "Failed",
            OperationStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Done | OperationStatus::Failed | OperationStatus::Canceled)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(OperationStatus::Waiting),
            "Assigned" => Ok(OperationStatus::Assigned),
            "Queued" => Ok(OperationStatus::Queued),
            "Scheduled" => Ok(OperationStatus::Scheduled),
            "Done" => Ok(OperationStatus::Done),
            "Failed" => Ok(OperationStatus::Failed),
            "Canceled" => Ok(OperationStatus::Canceled),
            other => Err(format!("unknown operation status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(status: FileStatus) -> File {
        let mut f = File::new("/vo/data/f");
        f.status = status;
        f
    }

    #[test]
    fn empty_operation_is_done() {
        let mut op = Operation::new(OperationType::Removal);
        assert_eq!(op.recompute_status(), OperationStatus::Done);
    }

    #[test]
    fn done_only_when_every_file_done() {
        let mut op = Operation::new(OperationType::Transfer)
            .with_file(file_with(FileStatus::Done))
            .with_file(file_with(FileStatus::Waiting));
        assert_eq!(op.recompute_status(), OperationStatus::Waiting);

        op.files[1].status = FileStatus::Done;
        assert_eq!(op.recompute_status(), OperationStatus::Done);
    }

    #[test]
    fn failed_once_all_files_terminal() {
        let mut op = Operation::new(OperationType::Transfer)
            .with_file(file_with(FileStatus::Failed))
            .with_file(file_with(FileStatus::Scheduled));
        assert_eq!(op.recompute_status(), OperationStatus::Scheduled);

        op.files[1].status = FileStatus::Done;
        assert_eq!(op.recompute_status(), OperationStatus::Failed);
    }

    #[test]
    fn canceled_is_sticky() {
        let mut op = Operation::new(OperationType::Transfer).with_file(file_with(FileStatus::Done));
        op.status = OperationStatus::Canceled;
        assert_eq!(op.recompute_status(), OperationStatus::Canceled);
    }

    #[test]
    fn queued_stays_queued_while_files_wait() {
        let mut op = Operation::new(OperationType::Transfer).with_file(file_with(FileStatus::Waiting));
        op.status = OperationStatus::Queued;
        assert_eq!(op.recompute_status(), OperationStatus::Queued);
    }

    #[test]
    fn target_list_is_split_and_trimmed() {
        let mut op = Operation::transfer("A", "B, C,,D ");
        assert_eq!(op.target_ses(), vec!["B", "C", "D"]);
        op.target_se = None;
        assert!(op.target_ses().is_empty());
    }
}
