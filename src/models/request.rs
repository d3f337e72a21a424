use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::{Operation, OperationStatus};

/// Top-level unit of work submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default)]
    pub request_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub owner_dn: Option<String>,
    #[serde(default)]
    pub owner_group: Option<String>,
    #[serde(default)]
    pub source_component: Option<String>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// Not handed out by the queue before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Request {
            request_id: None,
            name: name.into(),
            status: RequestStatus::Waiting,
            job_id: None,
            owner_dn: None,
            owner_group: None,
            source_component: None,
            creation_time: None,
            submit_time: None,
            last_update: None,
            not_before: None,
            operations: Vec::new(),
        }
    }

    /// Append an operation after the existing ones.
    pub fn add_operation(&mut self, mut op: Operation) -> &mut Operation {
        op.order = self.operations.iter().map(|o| o.order + 1).max().unwrap_or(0);
        self.operations.push(op);
        let last = self.operations.len() - 1;
        &mut self.operations[last]
    }

    pub fn operation_mut(&mut self, operation_id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|o| o.operation_id.as_deref() == Some(operation_id))
    }

    /// The first operation, by order, that is not finished yet.
    pub fn current_operation(&self) -> Option<&Operation> {
        self.operations.iter().filter(|o| !o.status.is_terminal()).min_by_key(|o| o.order)
    }

    pub fn current_operation_mut(&mut self) -> Option<&mut Operation> {
        self.operations.sort_by_key(|o| o.order);
        self.operations.iter_mut().find(|o| !o.status.is_terminal())
    }

    /// Cascade file state up through the operations into the request status.
    ///
    /// Operations run strictly in order: the first one that is not Done decides
    /// the request status, and every Waiting operation behind it is Queued.
    pub fn recompute_status(&mut self) -> RequestStatus {
        self.operations.sort_by_key(|o| o.order);
        for op in &mut self.operations {
            op.recompute_status();
        }

        if self.status == RequestStatus::Canceled {
            return self.status;
        }

        let mut current: Option<OperationStatus> = None;
        for op in &mut self.operations {
            if op.status == OperationStatus::Done {
                continue;
            }
            match current {
                None => {
                    if op.status == OperationStatus::Queued {
                        op.status = OperationStatus::Waiting;
                    }
                    current = Some(op.status);
                }
                Some(_) => {
                    if op.status == OperationStatus::Waiting {
                        op.status = OperationStatus::Queued;
                    }
                }
            }
        }

        self.status = match current {
            None => RequestStatus::Done,
            Some(OperationStatus::Failed) => RequestStatus::Failed,
            Some(OperationStatus::Canceled) => RequestStatus::Canceled,
            Some(OperationStatus::Scheduled) => RequestStatus::Scheduled,
            Some(_) => RequestStatus::Waiting,
        };
        self.status
    }

    /// Human readable summary, one line per operation.
    pub fn digest(&self) -> String {
        let mut ops: Vec<&Operation> = self.operations.iter().collect();
        ops.sort_by_key(|o| o.order);

        ops.iter()
            .map(|op| {
                let mut line = format!(
                    "{}:{}:{}:{}:{}:{}/{}",
                    op.order,
                    op.kind,
                    op.status,
                    op.source_se.as_deref().unwrap_or(""),
                    op.target_se.as_deref().unwrap_or(""),
                    op.done_files(),
                    op.files.len(),
                );
                if let Some(err) = &op.error {
                    line.push(':');
                    line.push_str(err);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    Waiting,
    Assigned,
    Scheduled,
    Done,
    Failed,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Waiting => "Waiting",
            RequestStatus::Assigned => "Assigned",
            RequestStatus::Scheduled => "Scheduled",
            RequestStatus::Done => "Done",
            RequestStatus::Failed => "Failed",
            RequestStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed | RequestStatus::Canceled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(RequestStatus::Waiting),
            "Assigned" => Ok(RequestStatus::Assigned),
            "Scheduled" => Ok(RequestStatus::Scheduled),
            "Done" => Ok(RequestStatus::Done),
            "Failed" => Ok(RequestStatus::Failed),
            "Canceled" => Ok(RequestStatus::Canceled),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        file::{File, FileStatus},
        operation::OperationType,
    };

    fn op_with(status: FileStatus) -> Operation {
        let mut f = File::new("/vo/data/f");
        f.status = status;
        Operation::new(OperationType::Transfer).with_file(f)
    }

    #[test]
    fn done_iff_all_operations_done() {
        let mut req = Request::new("r1");
        req.add_operation(op_with(FileStatus::Done));
        req.add_operation(op_with(FileStatus::Waiting));
        assert_eq!(req.recompute_status(), RequestStatus::Waiting);

        req.operations[1].files[0].status = FileStatus::Done;
        assert_eq!(req.recompute_status(), RequestStatus::Done);
    }

    #[test]
    fn request_without_operations_is_done() {
        let mut req = Request::new("empty");
        assert_eq!(req.recompute_status(), RequestStatus::Done);
    }

    #[test]
    fn later_operations_are_queued_behind_current() {
        let mut req = Request::new("r2");
        req.add_operation(op_with(FileStatus::Waiting));
        req.add_operation(op_with(FileStatus::Waiting));
        req.add_operation(op_with(FileStatus::Waiting));
        req.recompute_status();

        assert_eq!(req.operations[0].status, OperationStatus::Waiting);
        assert_eq!(req.operations[1].status, OperationStatus::Queued);
        assert_eq!(req.operations[2].status, OperationStatus::Queued);

        req.operations[0].files[0].status = FileStatus::Done;
        req.recompute_status();
        assert_eq!(req.operations[0].status, OperationStatus::Done);
        assert_eq!(req.operations[1].status, OperationStatus::Waiting);
        assert_eq!(req.operations[2].status, OperationStatus::Queued);
        assert_eq!(req.current_operation().map(|o| o.order), Some(1));
    }

    #[test]
    fn failed_operation_fails_request_and_blocks_the_rest() {
        let mut req = Request::new("r3");
        req.add_operation(op_with(FileStatus::Failed));
        req.add_operation(op_with(FileStatus::Waiting));
        assert_eq!(req.recompute_status(), RequestStatus::Failed);
        assert_eq!(req.operations[1].status, OperationStatus::Queued);
    }

    #[test]
    fn scheduled_operation_schedules_request() {
        let mut req = Request::new("r4");
        req.add_operation(op_with(FileStatus::Scheduled));
        assert_eq!(req.recompute_status(), RequestStatus::Scheduled);
    }

    #[test]
    fn canceled_request_never_recomputes() {
        let mut req = Request::new("r5");
        req.add_operation(op_with(FileStatus::Done));
        req.status = RequestStatus::Canceled;
        assert_eq!(req.recompute_status(), RequestStatus::Canceled);
    }

    #[test]
    fn assignment_is_released_by_recompute() {
        let mut req = Request::new("r6");
        req.add_operation(op_with(FileStatus::Waiting));
        req.status = RequestStatus::Assigned;
        assert_eq!(req.recompute_status(), RequestStatus::Waiting);
    }

    #[test]
    fn digest_lists_operations_in_order() {
        let mut req = Request::new("r7");
        let op = req.add_operation(Operation::transfer("A", "B").with_file(File::new("/vo/f1")));
        op.error = Some("no space".into());
        req.add_operation(Operation::new(OperationType::Registration));

        let digest = req.digest();
        let lines: Vec<&str> = digest.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0:Transfer:Waiting:A:B:0/1:no space");
        assert_eq!(lines[1], "1:Registration:Waiting:::0/0");
    }
}
