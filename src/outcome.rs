use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What the worker is trying to do to a row. Fixed for the duration of one
/// attempt by the queue the row was drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Intent {
    Pause,
    Resume,
}

impl Intent {
    pub fn verb(self) -> &'static str {
        match self {
            Intent::Pause => "pause",
            Intent::Resume => "resume",
        }
    }
}

/// How a failure should be treated by the outer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Increment retryCount, release the lock, row re-eligible next tick.
    Retriable,
    /// Re-eligible only after the payment-retry instant written to the row.
    ScheduledRetry,
    /// Write a terminal result and stop retrying.
    Terminal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    TransportTransient,
    AuthTimeout,
    Captcha,
    SessionLost,
    BrowserError,
    StateUncertain,
    PaymentRecoveredNeedsRecheck,
    PaymentPending,
    AccountDisabled,
    PhoneVerification,
    PaymentMethodIssue,
    PaymentDelayExceeded,
}

impl FailureKind {
    pub fn class(self) -> FailureClass {
        match self {
            FailureKind::TransportTransient
            | FailureKind::AuthTimeout
            | FailureKind::Captcha
            | FailureKind::SessionLost
            | FailureKind::BrowserError
            | FailureKind::StateUncertain
            | FailureKind::PaymentRecoveredNeedsRecheck => FailureClass::Retriable,
            FailureKind::PaymentPending => FailureClass::ScheduledRetry,
            FailureKind::AccountDisabled
            | FailureKind::PhoneVerification
            | FailureKind::PaymentMethodIssue
            | FailureKind::PaymentDelayExceeded => FailureClass::Terminal,
        }
    }

    /// Short tag written into result cells and used in logs.
    pub fn tag(self) -> &'static str {
        match self {
            FailureKind::TransportTransient => "transport error",
            FailureKind::AuthTimeout => "auth timeout",
            FailureKind::Captcha => "captcha",
            FailureKind::SessionLost => "session lost",
            FailureKind::BrowserError => "browser error",
            FailureKind::StateUncertain => "state uncertain",
            FailureKind::PaymentRecoveredNeedsRecheck => "payment recovered, recheck",
            FailureKind::PaymentPending => "payment pending",
            FailureKind::AccountDisabled => "account disabled",
            FailureKind::PhoneVerification => "phone verification required",
            FailureKind::PaymentMethodIssue => "payment method issue",
            FailureKind::PaymentDelayExceeded => "payment delayed",
        }
    }
}

/// Result of one workflow attempt against one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The intent was applied and verified.
    Success {
        intent: Intent,
        /// Billing date read from the post-action page. Present on pause
        /// (the advanced date) and usually on resume.
        next_billing: Option<NaiveDate>,
        /// True when this success came from the already-in-target re-check
        /// rather than a performed action.
        rechecked: bool,
    },
    /// Pause intent found the billing date unchanged: the current cycle has
    /// not cleared yet. Scheduled for a payment retry.
    PaymentPending,
    /// The row was found already in the target state, but the mandatory
    /// fresh-session re-check has not happened yet. The worker loop turns
    /// this into `Success { rechecked: true }` or a retriable failure.
    AlreadyInTarget { intent: Intent },
    Failed { kind: FailureKind, detail: String },
}

impl AttemptOutcome {
    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            kind,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_match_taxonomy() {
        assert_eq!(FailureKind::Captcha.class(), FailureClass::Retriable);
        assert_eq!(FailureKind::AuthTimeout.class(), FailureClass::Retriable);
        assert_eq!(
            FailureKind::PaymentPending.class(),
            FailureClass::ScheduledRetry
        );
        assert_eq!(
            FailureKind::AccountDisabled.class(),
            FailureClass::Terminal
        );
        assert_eq!(
            FailureKind::PaymentDelayExceeded.class(),
            FailureClass::Terminal
        );
    }

    #[test]
    fn kind_serializes_camel_case() {
        let s = serde_json::to_string(&FailureKind::PaymentRecoveredNeedsRecheck).unwrap();
        assert_eq!(s, "\"paymentRecoveredNeedsRecheck\"");
    }
}
