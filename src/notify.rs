use crate::settings::NotifyToggles;

/// Out-of-band alert categories, each with its own config toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyCategory {
    PermanentFailure,
    PaymentDelay,
    LoopDetected,
    RetryCapExceeded,
    PaymentMethodIssue,
}

impl NotifyCategory {
    pub fn label(self) -> &'static str {
        match self {
            NotifyCategory::PermanentFailure => "permanent failure",
            NotifyCategory::PaymentDelay => "payment delay",
            NotifyCategory::LoopDetected => "loop detected",
            NotifyCategory::RetryCapExceeded => "retry cap exceeded",
            NotifyCategory::PaymentMethodIssue => "payment method issue",
        }
    }

    pub fn enabled(self, toggles: &NotifyToggles) -> bool {
        match self {
            NotifyCategory::PermanentFailure => toggles.permanent_failure,
            NotifyCategory::PaymentDelay => toggles.payment_delay,
            NotifyCategory::LoopDetected => toggles.loop_detected,
            NotifyCategory::RetryCapExceeded => toggles.retry_cap_exceeded,
            NotifyCategory::PaymentMethodIssue => toggles.payment_method_issue,
        }
    }
}

/// Fire-and-forget webhook alerts. Delivery failures are logged and never
/// block the commit that triggered them.
pub struct Notifier {
    webhook: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            webhook,
            http: reqwest::Client::new(),
        }
    }

    pub fn send(&self, toggles: &NotifyToggles, category: NotifyCategory, message: String) {
        if !category.enabled(toggles) {
            return;
        }
        tracing::info!(category = category.label(), %message, "alert");
        let Some(url) = self.webhook.clone() else {
            return;
        };
        let http = self.http.clone();
        let body = serde_json::json!({
            "category": category.label(),
            "message": message,
        });
        tokio::spawn(async move {
            if let Err(err) = http.post(&url).json(&body).send().await {
                tracing::warn!(error = %err, "alert delivery failed");
            }
        });
    }
}
