pub mod file;
pub mod operation;
pub mod request;
pub mod transfer;

pub use file::{ChecksumType, File, FileStatus};
pub use operation::{Operation, OperationStatus, OperationType};
pub use request::{Request, RequestStatus};
pub use transfer::{TransferAccounting, TransferFile, TransferFileState, TransferJob, TransferJobStatus};
