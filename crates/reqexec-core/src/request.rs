// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request, operation and file records.
//!
//! A [`Request`] owns an ordered list of [`Operation`]s, each of which owns the
//! [`OperationFile`]s its handler acts on. Handlers mutate operation and file
//! statuses; the request status is derived from its operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Some operation still has work to do.
    Waiting,
    /// Every operation completed successfully.
    Done,
    /// The request will not make further progress.
    Failed,
}

impl RequestStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Parse a status from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Waiting" => Some(Self::Waiting),
            "Done" => Some(Self::Done),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Ready to be handed to its handler.
    Waiting,
    /// Handed off to an external sub-system; nothing to do until it reports back.
    Scheduled,
    /// Completed successfully.
    Done,
    /// Failed permanently.
    Failed,
}

impl OperationStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Scheduled => "Scheduled",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Parse a status from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Waiting" => Some(Self::Waiting),
            "Scheduled" => Some(Self::Scheduled),
            "Done" => Some(Self::Done),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Status of a single file within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    /// Not processed yet.
    Waiting,
    /// Processed successfully.
    Done,
    /// Processing failed.
    Failed,
}

impl FileStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }
}

/// Finest-grained unit a handler acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFile {
    /// Logical file name.
    pub lfn: String,
    /// Optional checksum the handler may verify against.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Current status.
    pub status: FileStatus,
    /// Last recorded error.
    #[serde(default)]
    pub error: Option<String>,
}

impl OperationFile {
    /// Create a waiting file entry.
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            checksum: None,
            status: FileStatus::Waiting,
            error: None,
        }
    }
}

/// One typed unit of work within a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Store-assigned identifier.
    #[serde(default)]
    pub operation_id: Option<i64>,
    /// Handler routing key.
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Position within the request.
    pub order: u32,
    /// Current status.
    pub status: OperationStatus,
    /// Last recorded failure, for diagnostics only.
    #[serde(default)]
    pub error: Option<String>,
    /// Target the handler acts on (storage element, catalog, service).
    #[serde(default)]
    pub target: Option<String>,
    /// Free-form handler arguments.
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
    /// Files acted on by this operation.
    #[serde(default)]
    pub files: Vec<OperationFile>,
}

impl Operation {
    /// Create a waiting operation of the given type at the given position.
    pub fn new(operation_type: impl Into<String>, order: u32) -> Self {
        Self {
            operation_id: None,
            operation_type: operation_type.into(),
            order,
            status: OperationStatus::Waiting,
            error: None,
            target: None,
            arguments: None,
            files: Vec::new(),
        }
    }

    /// Append a file to the operation.
    pub fn with_file(mut self, file: OperationFile) -> Self {
        self.files.push(file);
        self
    }

    /// Set the operation target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Force the operation and every one of its files to Failed.
    pub fn fail_all(&mut self) {
        for file in &mut self.files {
            file.status = FileStatus::Failed;
        }
        self.status = OperationStatus::Failed;
    }
}

/// A persisted unit of work composed of ordered operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Store-assigned identifier, unset until first saved.
    #[serde(default)]
    pub request_id: Option<i64>,
    /// Human-readable request name.
    pub request_name: String,
    /// Subject (DN) of the owner under whose identity operations run.
    pub owner_subject: String,
    /// Group of the owner.
    pub owner_group: String,
    /// Job this request was spawned for, if any.
    #[serde(default)]
    pub job_id: Option<i64>,
    /// Current status.
    pub status: RequestStatus,
    /// Request-level error, for diagnostics only.
    #[serde(default)]
    pub error: Option<String>,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request was last saved.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "sorted_operations")]
    operations: Vec<Operation>,
}

/// Operations are stored in whatever order the producer wrote them; keep
/// them sorted by `order` once loaded.
fn sorted_operations<'de, D>(deserializer: D) -> Result<Vec<Operation>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut operations = Vec::<Operation>::deserialize(deserializer)?;
    operations.sort_by_key(|op| op.order);
    Ok(operations)
}

impl Request {
    /// Create a new waiting request with no operations.
    pub fn new(
        request_name: impl Into<String>,
        owner_subject: impl Into<String>,
        owner_group: impl Into<String>,
    ) -> Self {
        Self {
            request_id: None,
            request_name: request_name.into(),
            owner_subject: owner_subject.into(),
            owner_group: owner_group.into(),
            job_id: None,
            status: RequestStatus::Waiting,
            error: None,
            created_at: Utc::now(),
            last_update: None,
            operations: Vec::new(),
        }
    }

    /// Attach the originating job.
    pub fn with_job(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Add an operation, keeping operations sorted by `order`.
    pub fn add_operation(&mut self, operation: Operation) {
        let pos = self
            .operations
            .partition_point(|op| op.order <= operation.order);
        self.operations.insert(pos, operation);
    }

    /// Builder form of [`add_operation`](Self::add_operation).
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.add_operation(operation);
        self
    }

    /// Operations in order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Mutable access to a single operation by index.
    pub fn operation_mut(&mut self, index: usize) -> Option<&mut Operation> {
        self.operations.get_mut(index)
    }

    /// Index of the lowest-order operation still Waiting.
    pub fn first_waiting(&self) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| op.status == OperationStatus::Waiting)
    }

    /// Status implied by the operations.
    ///
    /// The first operation (by order) that is not Done decides: Failed makes
    /// the request Failed, Waiting or Scheduled keeps it Waiting. A request
    /// whose operations are all Done is Done.
    pub fn derived_status(&self) -> RequestStatus {
        for op in &self.operations {
            match op.status {
                OperationStatus::Done => continue,
                OperationStatus::Failed => return RequestStatus::Failed,
                OperationStatus::Waiting | OperationStatus::Scheduled => {
                    return RequestStatus::Waiting;
                }
            }
        }
        RequestStatus::Done
    }

    /// Recompute `status` from the operations.
    pub fn refresh_status(&mut self) -> RequestStatus {
        self.status = self.derived_status();
        self.status
    }

    /// Force every operation and file to Failed and mark the request Failed.
    pub fn fail_all(&mut self, reason: impl Into<String>) {
        for op in &mut self.operations {
            op.fail_all();
        }
        self.error = Some(reason.into());
        self.status = RequestStatus::Failed;
    }
}
