//! In-memory approval correlation table.
//!
//! Entry lifecycle: create → await → resolve-and-remove. Only one approval
//! request may be outstanding at a time, and entries never survive a process
//! restart — a restored session re-issues the request instead (see
//! [`crate::WorkflowMachine::restore`]).

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    Plan,
    Task { index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    pub request_id: Uuid,
    pub kind: ApprovalKind,
    pub created_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("an approval request is already outstanding")]
    AlreadyPending,
    #[error("unknown approval request id {0}")]
    UnknownRequest(Uuid),
}

#[derive(Debug, Default)]
pub struct ApprovalTable {
    pending: Option<PendingApproval>,
}

impl ApprovalTable {
    /// Register a new request and hand back its correlation id.
    pub fn begin(&mut self, kind: ApprovalKind) -> Result<Uuid, ApprovalError> {
        if self.pending.is_some() {
            return Err(ApprovalError::AlreadyPending);
        }
        let request_id = Uuid::now_v7();
        self.pending = Some(PendingApproval {
            request_id,
            kind,
            created_at: Utc::now(),
        });
        Ok(request_id)
    }

    /// Resolve exactly once: the entry is removed on success, so a second
    /// response with the same id fails.
    pub fn resolve(&mut self, request_id: Uuid) -> Result<PendingApproval, ApprovalError> {
        match self.pending.take() {
            Some(pending) if pending.request_id == request_id => Ok(pending),
            other => {
                self.pending = other;
                Err(ApprovalError::UnknownRequest(request_id))
            }
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }

    /// Drop any outstanding request, e.g. on abort or session switch, so
    /// approvals cannot leak across sessions.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}
