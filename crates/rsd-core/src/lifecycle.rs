//! Request lifecycle state machine and the domain rules gated by it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FinishReason, Party, PaymentMethod, ProviderId, ServiceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Idle,
    Searching,
    #[serde(alias = "accepted")]
    Negotiating,
    AwaitingPayment,
    #[serde(alias = "confirmed")]
    InService,
    PendingClientConfirmation,
    Finished,
    Canceled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Idle,
        RequestStatus::Searching,
        RequestStatus::Negotiating,
        RequestStatus::AwaitingPayment,
        RequestStatus::InService,
        RequestStatus::PendingClientConfirmation,
        RequestStatus::Finished,
        RequestStatus::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Negotiating => "negotiating",
            Self::AwaitingPayment => "awaiting_payment",
            Self::InService => "in_service",
            Self::PendingClientConfirmation => "pending_client_confirmation",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
        }
    }

    /// Parses a stored status, mapping the legacy `accepted` and `confirmed`
    /// names onto `negotiating` and `in_service`.
    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw {
            "idle" => Self::Idle,
            "searching" => Self::Searching,
            "negotiating" | "accepted" => Self::Negotiating,
            "awaiting_payment" => Self::AwaitingPayment,
            "in_service" | "confirmed" => Self::InService,
            "pending_client_confirmation" => Self::PendingClientConfirmation,
            "finished" => Self::Finished,
            "canceled" => Self::Canceled,
            _ => return None,
        };
        Some(status)
    }

    pub fn allowed_next(self) -> &'static [RequestStatus] {
        use RequestStatus::*;
        match self {
            Idle => &[Searching],
            Searching => &[Negotiating, Canceled],
            Negotiating => &[AwaitingPayment, Searching, Canceled],
            AwaitingPayment => &[InService, Negotiating, Canceled],
            InService => &[PendingClientConfirmation, Canceled],
            PendingClientConfirmation => &[Finished, InService],
            Finished | Canceled => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled)
    }

    /// States in which a provider holds the assignment.
    pub fn holds_assignment(self) -> bool {
        matches!(
            self,
            Self::Negotiating
                | Self::AwaitingPayment
                | Self::InService
                | Self::PendingClientConfirmation
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_valid_transition(from: RequestStatus, to: RequestStatus) -> bool {
    from.allowed_next().contains(&to)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("{operation} requires status {expected}, request is {actual}")]
    WrongStatus {
        operation: &'static str,
        expected: RequestStatus,
        actual: RequestStatus,
    },
    #[error("proposed value must be positive")]
    NonPositiveValue,
    #[error("no value has been proposed")]
    NoProposal,
    #[error("a party cannot accept its own proposal")]
    OwnProposal,
    #[error("value must be accepted with a positive agreed value before confirming")]
    ValueNotAgreed,
    #[error("provider {provider_id} is not assigned to this request")]
    NotAssignee { provider_id: ProviderId },
    #[error("provider may not cancel from {status}")]
    ProviderCancelNotAllowed { status: RequestStatus },
}

impl LifecycleError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::WrongStatus { .. } => "wrong_status",
            Self::NonPositiveValue => "non_positive_value",
            Self::NoProposal => "no_proposal",
            Self::OwnProposal => "own_proposal",
            Self::ValueNotAgreed => "value_not_agreed",
            Self::NotAssignee { .. } => "not_assignee",
            Self::ProviderCancelNotAllowed { .. } => "provider_cancel_not_allowed",
        }
    }
}

impl ServiceRequest {
    /// Applies a status change after checking it against the transition table.
    pub fn transition_to(
        &mut self,
        to: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if !is_valid_transition(self.status, to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if !to.holds_assignment() {
            self.provider_id = None;
        }
        if to == RequestStatus::Searching {
            self.reset_negotiation();
        }
        Ok(())
    }

    fn require(&self, operation: &'static str, expected: RequestStatus) -> Result<(), LifecycleError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(LifecycleError::WrongStatus {
                operation,
                expected,
                actual: self.status,
            })
        }
    }

    fn require_assignee(&self, provider_id: ProviderId) -> Result<(), LifecycleError> {
        if self.provider_id == Some(provider_id) {
            Ok(())
        } else {
            Err(LifecycleError::NotAssignee { provider_id })
        }
    }

    fn reset_negotiation(&mut self) {
        self.proposed_value = None;
        self.agreed_value = None;
        self.last_proposal_by = None;
        self.value_accepted = false;
    }

    /// In-memory image of the conditional assignment update.
    pub fn assign(&mut self, provider_id: ProviderId, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("assign", RequestStatus::Searching)?;
        self.transition_to(RequestStatus::Negotiating, now)?;
        self.provider_id = Some(provider_id);
        Ok(())
    }

    pub fn propose_value(
        &mut self,
        by: Party,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.require("propose_value", RequestStatus::Negotiating)?;
        if !value.is_finite() || value <= 0.0 {
            return Err(LifecycleError::NonPositiveValue);
        }
        self.proposed_value = Some(value);
        self.last_proposal_by = Some(by);
        self.value_accepted = false;
        self.agreed_value = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn accept_value(&mut self, by: Party, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("accept_value", RequestStatus::Negotiating)?;
        let Some(value) = self.proposed_value else {
            return Err(LifecycleError::NoProposal);
        };
        if self.last_proposal_by == Some(by) {
            return Err(LifecycleError::OwnProposal);
        }
        self.agreed_value = Some(value);
        self.value_accepted = true;
        self.updated_at = now;
        Ok(())
    }

    pub fn confirm_value(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("confirm_value", RequestStatus::Negotiating)?;
        let agreed = self.agreed_value.unwrap_or_default();
        if !self.value_accepted || agreed <= 0.0 {
            return Err(LifecycleError::ValueNotAgreed);
        }
        self.transition_to(RequestStatus::AwaitingPayment, now)
    }

    pub fn reopen_negotiation(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("reopen_negotiation", RequestStatus::AwaitingPayment)?;
        self.transition_to(RequestStatus::Negotiating, now)?;
        self.value_accepted = false;
        Ok(())
    }

    pub fn record_payment(
        &mut self,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.require("record_payment", RequestStatus::AwaitingPayment)?;
        self.transition_to(RequestStatus::InService, now)?;
        self.payment_method = Some(method);
        Ok(())
    }

    pub fn provider_finish(
        &mut self,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.require("provider_finish", RequestStatus::InService)?;
        self.require_assignee(provider_id)?;
        self.transition_to(RequestStatus::PendingClientConfirmation, now)?;
        self.provider_finish_requested_at = Some(now);
        Ok(())
    }

    pub fn reject_completion(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("reject_completion", RequestStatus::PendingClientConfirmation)?;
        self.transition_to(RequestStatus::InService, now)?;
        self.provider_finish_requested_at = None;
        Ok(())
    }

    /// Moves a request awaiting client confirmation to `finished`, either on
    /// the client's word or because the guard window lapsed.
    pub fn finish(&mut self, reason: FinishReason, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.require("finish", RequestStatus::PendingClientConfirmation)?;
        let provider_id = self.provider_id;
        self.transition_to(RequestStatus::Finished, now)?;
        self.fulfilled_by = provider_id;
        self.finish_reason = Some(reason);
        Ok(())
    }

    pub fn cancel_by_client(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.transition_to(RequestStatus::Canceled, now)?;
        self.canceled_by = Some(Party::Client);
        self.cancel_reason = reason;
        Ok(())
    }

    /// Provider walks away before service starts; the request goes back to
    /// `searching`. From `awaiting_payment` this takes two table hops.
    pub fn release_by_provider(
        &mut self,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        match self.status {
            RequestStatus::Negotiating => {
                self.require_assignee(provider_id)?;
                self.transition_to(RequestStatus::Searching, now)
            }
            RequestStatus::AwaitingPayment => {
                self.require_assignee(provider_id)?;
                self.transition_to(RequestStatus::Negotiating, now)?;
                self.transition_to(RequestStatus::Searching, now)
            }
            status => Err(LifecycleError::ProviderCancelNotAllowed { status }),
        }
    }
}
