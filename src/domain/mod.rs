use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidArgument {
        field: &'static str,
        reason: String,
    },
    TargetNotFound {
        target_id: String,
    },
    NotFound {
        kind: &'static str,
        id: String,
    },
    Forbidden {
        actor_id: String,
        request_id: String,
    },
    InvalidState {
        id: String,
        reason: String,
    },
    ConfigurationError {
        reason: String,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::TargetNotFound { .. } => "target_not_found",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::InvalidState { .. } => "invalid_state",
            Self::ConfigurationError { .. } => "configuration_error",
        }
    }

    pub(crate) fn already_resolved(request_id: &str, status: RequestStatus) -> Self {
        Self::InvalidState {
            id: request_id.to_string(),
            reason: format!("this request was already resolved ({})", status.as_str()),
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            Self::TargetNotFound { target_id } => write!(f, "target not found: {target_id}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Forbidden {
                actor_id,
                request_id,
            } => write!(
                f,
                "actor is not allowed to decide this request: actor_id={actor_id} request_id={request_id}"
            ),
            Self::InvalidState { id, reason } => write!(f, "{reason}: {id}"),
            Self::ConfigurationError { reason } => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Party {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
    /// Independent party that votes on quorum transactions.
    Validator,
}

/// The caller of an operation, as established by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn party(&self) -> Party {
        Party {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    LabReports,
    Prescriptions,
    MedicalHistory,
    Imaging,
    Vaccinations,
    DischargeSummaries,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    #[default]
    View,
    Upload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalFlavor {
    #[default]
    OwnerApproval,
    Quorum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    RequestSent,
    Granted,
    Denied,
    Expired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RequestSent => "request_sent",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    /// A decision has been made; owners can no longer grant or deny.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Granted | Self::Denied | Self::Expired)
    }

    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::RequestSent)
                | (Self::RequestSent, Self::Granted)
                | (Self::RequestSent, Self::Denied)
                | (Self::Granted, Self::Expired)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Grant,
    Deny,
}

impl Decision {
    pub fn target_status(self) -> RequestStatus {
        match self {
            Self::Grant => RequestStatus::Granted,
            Self::Deny => RequestStatus::Denied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub status: RequestStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    pub request_id: String,
    pub requester: Party,
    pub target: Party,
    pub reason: String,
    pub documents: BTreeSet<DocumentKind>,
    #[serde(default)]
    pub scope: AccessScope,
    #[serde(default)]
    pub flavor: ApprovalFlavor,
    pub status: RequestStatus,
    pub request_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl AccessRequest {
    pub fn new(
        request_id: String,
        requester: Party,
        target: Party,
        reason: String,
        documents: BTreeSet<DocumentKind>,
        scope: AccessScope,
        flavor: ApprovalFlavor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            requester,
            target,
            reason,
            documents,
            scope,
            flavor,
            status: RequestStatus::Pending,
            request_date: now,
            expiry_date: None,
            history: vec![StatusChange {
                status: RequestStatus::Pending,
                at: now,
            }],
        }
    }

    /// Status as observed at `now`: a grant past its expiry reads as expired even
    /// before the sweeper has persisted the transition.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        match (self.status, self.expiry_date) {
            (RequestStatus::Granted, Some(expiry)) if now > expiry => RequestStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn view_at(&self, now: DateTime<Utc>) -> Self {
        let mut out = self.clone();
        if out.status == RequestStatus::Granted
            && out.effective_status(now) == RequestStatus::Expired
            && let Some(expiry) = out.expiry_date
        {
            out.status = RequestStatus::Expired;
            out.history.push(StatusChange {
                status: RequestStatus::Expired,
                at: expiry,
            });
        }
        out
    }

    /// Moves along one edge of the transition graph and records it in `history`.
    pub fn advance(&mut self, next: RequestStatus, at: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidState {
                id: self.request_id.clone(),
                reason: format!(
                    "illegal status transition {} -> {}",
                    self.status.as_str(),
                    next.as_str()
                ),
            });
        }
        self.status = next;
        self.history.push(StatusChange { status: next, at });
        Ok(())
    }
}

pub fn validate_reason(reason: &str) -> Result<(), DomainError> {
    if reason.trim().is_empty() {
        return Err(DomainError::InvalidArgument {
            field: "reason",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

pub fn validate_documents(documents: &BTreeSet<DocumentKind>) -> Result<(), DomainError> {
    if documents.is_empty() {
        return Err(DomainError::InvalidArgument {
            field: "documents",
            reason: "at least one document type is required".to_string(),
        });
    }
    Ok(())
}
