use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// One logical file handled by an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    #[serde(default)]
    pub file_id: Option<String>,
    pub lfn: String,
    #[serde(default)]
    pub pfn: Option<String>,
    #[serde(default)]
    pub checksum_type: Option<ChecksumType>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// How many times this file was handed to the transfer service.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// ftsGUID of the transfer job that currently has this file checked out.
    #[serde(default)]
    pub transfer_job: Option<String>,
}

impl File {
    pub fn new(lfn: impl Into<String>) -> Self {
        File {
            file_id: None,
            lfn: lfn.into(),
            pfn: None,
            checksum_type: None,
            checksum: None,
            guid: None,
            size: 0,
            attempt: 0,
            status: FileStatus::Waiting,
            error: None,
            transfer_job: None,
        }
    }

    pub fn with_checksum(mut self, kind: ChecksumType, value: impl Into<String>) -> Self {
        self.checksum_type = Some(kind);
        self.checksum = Some(value.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Free for a new transfer job.
    pub fn is_available(&self) -> bool {
        self.status == FileStatus::Waiting && self.transfer_job.is_none()
    }

    /// Checksum in the `TYPE:value` form the transfer service expects.
    pub fn transfer_checksum(&self) -> Option<String> {
        match (&self.checksum_type, &self.checksum) {
            (Some(kind), Some(value)) if !value.is_empty() => Some(format!("{}:{}", kind.as_str(), value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FileStatus {
    #[default]
    Waiting,
    Scheduled,
    Done,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Waiting => "Waiting",
            FileStatus::Scheduled => "Scheduled",
            FileStatus::Done => "Done",
            FileStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Done | FileStatus::Failed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(FileStatus::Waiting),
            "Scheduled" => Ok(FileStatus::Scheduled),
            "Done" => Ok(FileStatus::Done),
            "Failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumType {
    Adler32,
    Md5,
    Sha1,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Adler32 => "ADLER32",
            ChecksumType::Md5 => "MD5",
            ChecksumType::Sha1 => "SHA1",
        }
    }
}

impl FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADLER32" | "AD" => Ok(ChecksumType::Adler32),
            "MD5" => Ok(ChecksumType::Md5),
            "SHA1" => Ok(ChecksumType::Sha1),
            other => Err(format!("unknown checksum type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_checksum_format() {
        let file = File::new("/lhcb/data/f1").with_checksum(ChecksumType::Adler32, "0a1b2c3d");
        assert_eq!(file.transfer_checksum().as_deref(), Some("ADLER32:0a1b2c3d"));

        let bare = File::new("/lhcb/data/f2");
        assert_eq!(bare.transfer_checksum(), None);
    }

    #[test]
    fn availability_requires_no_job_reference() {
        let mut file = File::new("/lhcb/data/f1");
        assert!(file.is_available());

        file.transfer_job = Some("guid-1".into());
        assert!(!file.is_available());

        file.transfer_job = None;
        file.status = FileStatus::Done;
        assert!(!file.is_available());
    }

    #[test]
    fn checksum_type_aliases() {
        assert_eq!("ad".parse::<ChecksumType>().unwrap(), ChecksumType::Adler32);
        assert_eq!("Md5".parse::<ChecksumType>().unwrap(), ChecksumType::Md5);
        assert!("crc".parse::<ChecksumType>().is_err());
    }
}
