use crate::notify::{Notifier, NotifyCategory};
use crate::outcome::{AttemptOutcome, FailureClass, FailureKind, Intent};
use crate::rows::{Field, TaskLayout, TaskRow};
use crate::settings::TickSettings;
use crate::sheets::{SheetError, SheetTransport, SheetsClient};
use crate::timefmt;
use chrono::DateTime;
use chrono_tz::Tz;
use std::time::Duration;

/// Keep result cells small; long error chains go to the log instead.
const RESULT_TEXT_MAX: usize = 240;

/// Deterministic per-row spread so a fleet does not retry payment rows in
/// one burst.
const PAYMENT_JITTER_SECONDS: u32 = 60;

fn truncate_result(s: &str) -> String {
    let mut out: String = s.chars().take(RESULT_TEXT_MAX).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

/// Pick the backoff step for a payment retry from how long the row has
/// been pending. Walking the cumulative schedule keeps the step implicit:
/// no extra attempt-counter column is needed, and reruns of the same
/// elapsed window pick the same step.
pub fn payment_backoff(schedule: &[Duration], elapsed: Duration) -> Duration {
    let mut cumulative = Duration::ZERO;
    for step in schedule {
        cumulative += *step;
        if elapsed < cumulative {
            return *step;
        }
    }
    schedule
        .last()
        .copied()
        .unwrap_or(Duration::from_secs(15 * 60))
}

/// Commits typed outcomes back to the task tab, one batched write per
/// row, and emits the out-of-band alerts tied to terminal outcomes.
pub struct ResultWriter {
    tab: String,
}

impl ResultWriter {
    pub fn new(tab: String) -> Self {
        Self { tab }
    }

    pub async fn commit<T: SheetTransport>(
        &self,
        client: &SheetsClient<T>,
        layout: &TaskLayout,
        row: &TaskRow,
        outcome: &AttemptOutcome,
        settings: &TickSettings,
        notifier: &Notifier,
        now: DateTime<Tz>,
    ) -> Result<(), SheetError> {
        let updates = self.build_updates(layout, row, outcome, settings, now);
        client.write_batch(&self.tab, &updates).await?;

        if let Some((category, message)) = alert_for(row, outcome, settings) {
            notifier.send(&settings.notify, category, message);
        }
        Ok(())
    }

    /// The full cell set for one commit. Pure, so idempotence is a
    /// property of the inputs: the same row snapshot, outcome and instant
    /// always produce the same writes. The lock cell is cleared in every
    /// arm, so commit and release ride the same batch.
    pub fn build_updates(
        &self,
        layout: &TaskLayout,
        row: &TaskRow,
        outcome: &AttemptOutcome,
        settings: &TickSettings,
        now: DateTime<Tz>,
    ) -> Vec<(String, String)> {
        let cell = |f: Field| layout.a1(f, row.row);
        let stamp = timefmt::short_stamp(&now);
        let mut updates: Vec<(String, String)> = Vec::new();

        match outcome {
            AttemptOutcome::Success {
                intent,
                next_billing,
                rechecked,
            } => {
                let new_status = match intent {
                    Intent::Pause => "paused",
                    Intent::Resume => "active",
                };
                let verb = match intent {
                    Intent::Pause => "paused",
                    Intent::Resume => "resumed",
                };
                let mut text = format!("{verb} {stamp}");
                if *rechecked {
                    text.push_str(" (verified on re-check)");
                }
                updates.push((cell(Field::Status), new_status.to_string()));
                if let Some(date) = next_billing {
                    updates.push((
                        cell(Field::NextBillingDate),
                        timefmt::format_sheet_date(*date),
                    ));
                }
                updates.push((cell(Field::ResultText), text));
                updates.push((cell(Field::RetryCount), "0".to_string()));
                updates.push((cell(Field::PaymentPendingFirstSeenAt), String::new()));
                updates.push((cell(Field::PaymentPendingNextRetryAt), String::new()));
            }

            AttemptOutcome::PaymentPending => {
                // First-seen keeps its earliest value across attempts; the
                // backoff step follows the elapsed pending window.
                let first_seen = row.payment_first_seen.unwrap_or(now);
                let elapsed = (now - first_seen).to_std().unwrap_or_default();
                let step = payment_backoff(&settings.payment_backoff, elapsed);
                let jitter = row.row % PAYMENT_JITTER_SECONDS;
                let next_retry =
                    now + chrono::Duration::seconds(step.as_secs() as i64 + jitter as i64);

                updates.push((
                    cell(Field::ResultText),
                    format!("payment pending {stamp}"),
                ));
                updates.push((
                    cell(Field::PaymentPendingFirstSeenAt),
                    timefmt::long_stamp(&first_seen),
                ));
                updates.push((
                    cell(Field::PaymentPendingNextRetryAt),
                    timefmt::long_stamp(&next_retry),
                ));
            }

            AttemptOutcome::Failed {
                kind: FailureKind::PaymentDelayExceeded,
                ..
            } => {
                let hours = settings.payment_retry_max.as_secs() / 3600;
                updates.push((
                    cell(Field::ResultText),
                    format!("payment delayed >{hours}h"),
                ));
                updates.push((cell(Field::PaymentPendingFirstSeenAt), String::new()));
                updates.push((cell(Field::PaymentPendingNextRetryAt), String::new()));
            }

            AttemptOutcome::Failed { kind, detail } => {
                let text = if detail.is_empty() {
                    format!("{} {stamp}", kind.tag())
                } else {
                    truncate_result(&format!("{} {stamp}: {detail}", kind.tag()))
                };
                updates.push((cell(Field::ResultText), text));
                match kind.class() {
                    FailureClass::Retriable => {
                        updates.push((
                            cell(Field::RetryCount),
                            row.retry_count.saturating_add(1).to_string(),
                        ));
                    }
                    // Terminal failures freeze the retry count.
                    FailureClass::Terminal | FailureClass::ScheduledRetry => {}
                }
                updates.push((cell(Field::PaymentPendingFirstSeenAt), String::new()));
                updates.push((cell(Field::PaymentPendingNextRetryAt), String::new()));
            }

            // The worker converts this before committing; landing here
            // means the re-check session could not be opened.
            AttemptOutcome::AlreadyInTarget { .. } => {
                updates.push((
                    cell(Field::ResultText),
                    format!("{} {stamp}: re-check incomplete", FailureKind::StateUncertain.tag()),
                ));
                updates.push((
                    cell(Field::RetryCount),
                    row.retry_count.saturating_add(1).to_string(),
                ));
                updates.push((cell(Field::PaymentPendingFirstSeenAt), String::new()));
                updates.push((cell(Field::PaymentPendingNextRetryAt), String::new()));
            }
        }

        updates.push((cell(Field::LockValue), String::new()));
        updates
    }
}

fn alert_for(
    row: &TaskRow,
    outcome: &AttemptOutcome,
    settings: &TickSettings,
) -> Option<(NotifyCategory, String)> {
    let AttemptOutcome::Failed { kind, detail } = outcome else {
        return None;
    };
    let subject = &row.email;
    match kind {
        FailureKind::AccountDisabled | FailureKind::PhoneVerification => Some((
            NotifyCategory::PermanentFailure,
            format!("{subject}: {} ({detail})", kind.tag()),
        )),
        FailureKind::PaymentMethodIssue => Some((
            NotifyCategory::PaymentMethodIssue,
            format!("{subject}: {detail}"),
        )),
        FailureKind::PaymentDelayExceeded => Some((
            NotifyCategory::PaymentDelay,
            format!(
                "{subject}: payment still pending after {}h",
                settings.payment_retry_max.as_secs() / 3600
            ),
        )),
        FailureKind::AuthTimeout if detail.contains("step budget") => Some((
            NotifyCategory::LoopDetected,
            format!("{subject}: auth loop hit the step budget"),
        )),
        _ if kind.class() == FailureClass::Retriable
            && row.retry_count.saturating_add(1) >= settings.max_retries =>
        {
            Some((
                NotifyCategory::RetryCapExceeded,
                format!("{subject}: {} exhausted retries", kind.tag()),
            ))
        }
        _ => None,
    }
}
