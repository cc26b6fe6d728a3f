use crate::auth::{authenticate, AuthBudget, AuthOutcome, Credentials};
use crate::billing;
use crate::browser::{PageError, SessionPage};
use crate::outcome::{AttemptOutcome, FailureKind, Intent};
use crate::rows::TaskRow;
use chrono::NaiveDate;
use std::time::Duration;

pub const MEMBERSHIP_URL: &str = "https://www.youtube.com/paid_memberships";

pub const PAUSE_BUTTON: &str = "button[aria-label*='Pause membership']";
pub const RESUME_BUTTON: &str = "button[aria-label*='Resume membership']";
pub const MANAGE_BUTTON: &str = "button[aria-label*='Manage membership']";
pub const PAUSE_OPTION: &str = "tp-yt-paper-item#pause-membership";
pub const CONFIRM_BUTTON: &str = "yt-confirm-dialog-renderer #confirm-button";
pub const UPDATE_PAYMENT: &str = "button[aria-label*='Update payment method']";
pub const PAYMENT_RECOVERY_CONFIRM: &str = "ytd-button-renderer#retry-payment #confirm-button";

const PAUSED_TEXT_MARKERS: &[&str] = &["membership paused", "paused until", "일시중지"];

#[derive(Debug, Clone)]
pub struct WorkflowTuning {
    /// Upper bound on stability samples; two consecutive identical
    /// samples end the scan early.
    pub stability_samples: u32,
    pub sample_interval: Duration,
    /// How long to wait for the membership page to become readable.
    pub readiness_timeout: Duration,
    /// Minimum body length before the page counts as rendered.
    pub min_body_len: usize,
}

impl Default for WorkflowTuning {
    fn default() -> Self {
        Self {
            stability_samples: 3,
            sample_interval: Duration::from_millis(1500),
            readiness_timeout: Duration::from_secs(20),
            min_body_len: 200,
        }
    }
}

impl WorkflowTuning {
    /// The stability budget follows the row retry cap from settings.
    pub fn with_samples(max_retries: u32) -> Self {
        Self {
            stability_samples: max_retries.max(2),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    Active,
    Paused,
    /// Never committed; surfaces as a retriable failure.
    Uncertain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StateSample {
    pause: bool,
    resume: bool,
    manage: bool,
    paused_text: bool,
    billing: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub state: MembershipState,
    pub billing: Option<NaiveDate>,
}

async fn take_sample<P: SessionPage + ?Sized>(
    page: &P,
    today: NaiveDate,
) -> Result<StateSample, PageError> {
    let text = page.body_text().await?;
    let lower = text.to_lowercase();
    Ok(StateSample {
        pause: page.exists(PAUSE_BUTTON).await?,
        resume: page.exists(RESUME_BUTTON).await?,
        manage: page.exists(MANAGE_BUTTON).await?,
        paused_text: PAUSED_TEXT_MARKERS.iter().any(|m| lower.contains(m)),
        billing: billing::parse_billing_date(&text, today),
    })
}

fn map_sample(sample: &StateSample) -> MembershipState {
    let active_shape = (sample.pause && !sample.resume)
        || (sample.manage && sample.billing.is_some() && !sample.paused_text);
    let paused_shape = (sample.resume && !sample.pause) || (sample.paused_text && sample.resume);
    match (active_shape, paused_shape) {
        (true, false) => MembershipState::Active,
        (false, true) => MembershipState::Paused,
        _ => MembershipState::Uncertain,
    }
}

/// Load the membership page and read its state.
///
/// Readiness gate first (an action button exists AND the body has real
/// content), then repeated samples until two consecutive ones agree.
/// Anything that never stabilizes is `Uncertain` and is never committed.
pub async fn detect_state<P: SessionPage + ?Sized>(
    page: &P,
    tuning: &WorkflowTuning,
    today: NaiveDate,
) -> Result<Detection, PageError> {
    page.navigate(MEMBERSHIP_URL).await?;

    let deadline = tokio::time::Instant::now() + tuning.readiness_timeout;
    loop {
        let buttons = page.exists(PAUSE_BUTTON).await?
            || page.exists(RESUME_BUTTON).await?
            || page.exists(MANAGE_BUTTON).await?;
        let rendered = page.body_text().await?.len() >= tuning.min_body_len;
        if buttons && rendered {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("membership page never became readable");
            return Ok(Detection {
                state: MembershipState::Uncertain,
                billing: None,
            });
        }
        tokio::time::sleep(tuning.sample_interval).await;
    }

    let mut prev: Option<StateSample> = None;
    for _ in 0..tuning.stability_samples.max(2) {
        let sample = take_sample(page, today).await?;
        if prev.as_ref() == Some(&sample) {
            return Ok(Detection {
                state: map_sample(&sample),
                billing: sample.billing,
            });
        }
        prev = Some(sample);
        tokio::time::sleep(tuning.sample_interval).await;
    }

    tracing::warn!("membership state never stabilized");
    Ok(Detection {
        state: MembershipState::Uncertain,
        billing: None,
    })
}

fn target_state(intent: Intent) -> MembershipState {
    match intent {
        Intent::Pause => MembershipState::Paused,
        Intent::Resume => MembershipState::Active,
    }
}

fn page_failed(err: PageError) -> AttemptOutcome {
    match err {
        PageError::SessionLost(d) => AttemptOutcome::failed(FailureKind::SessionLost, d),
        PageError::Browser(d) => AttemptOutcome::failed(FailureKind::BrowserError, d),
    }
}

/// One attempt: authenticate, detect, apply the intent, verify by billing
/// date, and classify. The caller owns session lifetime and the commit.
pub async fn run_attempt<P: SessionPage>(
    page: &P,
    row: &TaskRow,
    intent: Intent,
    auth_budget: &AuthBudget,
    tuning: &WorkflowTuning,
    today: NaiveDate,
) -> AttemptOutcome {
    let creds = Credentials {
        email: &row.email,
        password: &row.password,
        recovery_email: &row.recovery_email,
        totp_secret: &row.totp_secret,
    };

    match authenticate(page, creds, auth_budget).await {
        AuthOutcome::LoggedIn { .. } => {}
        AuthOutcome::Failed { kind, detail } => return AttemptOutcome::Failed { kind, detail },
    }

    if !page.healthy().await {
        return AttemptOutcome::failed(FailureKind::SessionLost, "post-auth health check");
    }

    let detection = match detect_state(page, tuning, today).await {
        Ok(d) => d,
        Err(err) => return page_failed(err),
    };

    match detection.state {
        MembershipState::Uncertain => {
            return AttemptOutcome::failed(FailureKind::StateUncertain, "pre-action detection")
        }
        state if state == target_state(intent) => {
            // Roughly one row in twenty is misread; the worker re-checks
            // with a fresh session before committing this as a success.
            return AttemptOutcome::AlreadyInTarget { intent };
        }
        _ => {}
    }

    let mut payment_recovered = false;
    let applied = match intent {
        Intent::Pause => apply_pause(page).await,
        Intent::Resume => apply_resume(page, &mut payment_recovered).await,
    };
    if let Err(err) = applied {
        return page_failed(err);
    }

    let after = match detect_state(page, tuning, today).await {
        Ok(d) => d,
        Err(err) => return page_failed(err),
    };

    match intent {
        Intent::Pause => verify_pause(row, &after),
        Intent::Resume => verify_resume(page, &after, payment_recovered, today).await,
    }
}

async fn apply_pause<P: SessionPage>(page: &P) -> Result<(), PageError> {
    page.click(MANAGE_BUTTON).await?;
    page.click(PAUSE_OPTION).await?;
    page.click(CONFIRM_BUTTON).await?;
    Ok(())
}

async fn apply_resume<P: SessionPage>(
    page: &P,
    payment_recovered: &mut bool,
) -> Result<(), PageError> {
    page.click(RESUME_BUTTON).await?;
    page.click(CONFIRM_BUTTON).await?;
    // Some resumes interleave a payment-recovery confirmation. Complete
    // it, but flag the attempt so the outcome is re-verified from scratch.
    if page.exists(PAYMENT_RECOVERY_CONFIRM).await? {
        page.click(PAYMENT_RECOVERY_CONFIRM).await?;
        *payment_recovered = true;
    }
    Ok(())
}

fn verify_pause(row: &TaskRow, after: &Detection) -> AttemptOutcome {
    match after.billing {
        Some(shown) => match row.next_billing_date {
            // Pause confirmed: the displayed billing date moved past the
            // one we had stored.
            Some(prior) if shown > prior => AttemptOutcome::Success {
                intent: Intent::Pause,
                next_billing: Some(shown),
                rechecked: false,
            },
            Some(_) => AttemptOutcome::PaymentPending,
            None => AttemptOutcome::Success {
                intent: Intent::Pause,
                next_billing: Some(shown),
                rechecked: false,
            },
        },
        None => AttemptOutcome::failed(FailureKind::StateUncertain, "no billing date after pause"),
    }
}

async fn verify_resume<P: SessionPage>(
    page: &P,
    after: &Detection,
    payment_recovered: bool,
    today: NaiveDate,
) -> AttemptOutcome {
    match page.exists(UPDATE_PAYMENT).await {
        Ok(true) => {
            return AttemptOutcome::failed(
                FailureKind::PaymentMethodIssue,
                "update-payment-method prompt after resume",
            )
        }
        Ok(false) => {}
        Err(err) => return page_failed(err),
    }

    if payment_recovered {
        return AttemptOutcome::failed(
            FailureKind::PaymentRecoveredNeedsRecheck,
            "payment recovery confirmed mid-resume",
        );
    }

    match after.billing {
        // A resumed membership shows its next charge in the near future.
        Some(shown) if shown >= today && shown <= today + chrono::Duration::days(62) => {
            AttemptOutcome::Success {
                intent: Intent::Resume,
                next_billing: Some(shown),
                rechecked: false,
            }
        }
        Some(shown) => AttemptOutcome::failed(
            FailureKind::StateUncertain,
            format!("billing date {shown} implausibly far after resume"),
        ),
        None => {
            AttemptOutcome::failed(FailureKind::StateUncertain, "no billing date after resume")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakePage, Scene};
    use crate::timefmt;

    const LONG_ENOUGH: &str = "YouTube Premium membership. Manage, billing and history. \
        Recurring payment details and perks are listed below the fold.";

    fn tuning() -> WorkflowTuning {
        WorkflowTuning {
            stability_samples: 3,
            sample_interval: Duration::from_millis(5),
            readiness_timeout: Duration::from_millis(200),
            min_body_len: 20,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()
    }

    fn row() -> TaskRow {
        TaskRow {
            row: 2,
            email: "user@gmail.com".to_string(),
            password: "pw".to_string(),
            recovery_email: String::new(),
            totp_secret: String::new(),
            status: "active".parse().unwrap(),
            next_billing_date: timefmt::parse_sheet_date("2025-12-25"),
            scheduled_time: timefmt::parse_sheet_time("7:00"),
            result_text: String::new(),
            retry_count: 0,
            lock_value: String::new(),
            payment_first_seen: None,
            payment_next_retry: None,
        }
    }

    fn membership_active(billing_line: &str) -> Scene {
        Scene::at(MEMBERSHIP_URL)
            .text(&format!("{LONG_ENOUGH} Next billing date: {billing_line}"))
            .with(PAUSE_BUTTON)
            .with(MANAGE_BUTTON)
    }

    fn membership_paused(text: &str) -> Scene {
        Scene::at(MEMBERSHIP_URL)
            .text(&format!("{LONG_ENOUGH} Membership paused. {text}"))
            .with(RESUME_BUTTON)
    }

    #[tokio::test]
    async fn pause_happy_path_advances_billing_date() {
        let page = FakePage::script(vec![
            // Already logged in; auth completes on the first observation.
            membership_active("December 25, 2025"),
            // detect_state re-navigates to the membership URL.
            membership_active("December 25, 2025"),
            // manage -> pause option -> confirm.
            Scene::at(MEMBERSHIP_URL).with(PAUSE_OPTION),
            Scene::at(MEMBERSHIP_URL).with(CONFIRM_BUTTON),
            Scene::at(MEMBERSHIP_URL).text(LONG_ENOUGH),
            // post-action detection shows the advanced date.
            membership_paused("Billing resumes January 25, 2026"),
        ]);

        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Pause,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;

        assert_eq!(
            outcome,
            AttemptOutcome::Success {
                intent: Intent::Pause,
                next_billing: NaiveDate::from_ymd_opt(2026, 1, 25),
                rechecked: false,
            }
        );
        let actions = page.actions();
        assert!(actions.contains(&format!("click:{MANAGE_BUTTON}")));
        assert!(actions.contains(&format!("click:{PAUSE_OPTION}")));
        assert!(actions.contains(&format!("click:{CONFIRM_BUTTON}")));
    }

    #[tokio::test]
    async fn unchanged_billing_date_is_payment_pending() {
        let page = FakePage::script(vec![
            membership_active("December 25, 2025"),
            membership_active("December 25, 2025"),
            Scene::at(MEMBERSHIP_URL).with(PAUSE_OPTION),
            Scene::at(MEMBERSHIP_URL).with(CONFIRM_BUTTON),
            Scene::at(MEMBERSHIP_URL).text(LONG_ENOUGH),
            // Still the same date: the cycle has not cleared.
            membership_active("December 25, 2025"),
        ]);

        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Pause,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert_eq!(outcome, AttemptOutcome::PaymentPending);
    }

    #[tokio::test]
    async fn already_paused_defers_to_recheck() {
        let page = FakePage::script(vec![
            membership_paused("since last week"),
            membership_paused("since last week"),
        ]);
        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Pause,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert_eq!(
            outcome,
            AttemptOutcome::AlreadyInTarget {
                intent: Intent::Pause
            }
        );
    }

    #[tokio::test]
    async fn resume_happy_path() {
        let paused = membership_paused("resumes later");
        let page = FakePage::script(vec![
            paused.clone(),
            paused,
            Scene::at(MEMBERSHIP_URL).with(CONFIRM_BUTTON),
            Scene::at(MEMBERSHIP_URL).text(LONG_ENOUGH),
            membership_active("January 25, 2026"),
        ]);

        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Resume,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert_eq!(
            outcome,
            AttemptOutcome::Success {
                intent: Intent::Resume,
                next_billing: NaiveDate::from_ymd_opt(2026, 1, 25),
                rechecked: false,
            }
        );
    }

    #[tokio::test]
    async fn resume_with_update_payment_prompt_is_terminal() {
        let paused = membership_paused("resumes later");
        let page = FakePage::script(vec![
            paused.clone(),
            paused,
            Scene::at(MEMBERSHIP_URL).with(CONFIRM_BUTTON),
            Scene::at(MEMBERSHIP_URL).text(LONG_ENOUGH),
            membership_active("January 25, 2026").with(UPDATE_PAYMENT),
        ]);

        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Resume,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                kind: FailureKind::PaymentMethodIssue,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resume_through_payment_recovery_requests_recheck() {
        let paused = membership_paused("resumes later");
        let page = FakePage::script(vec![
            paused.clone(),
            paused,
            Scene::at(MEMBERSHIP_URL).with(CONFIRM_BUTTON),
            Scene::at(MEMBERSHIP_URL)
                .text(LONG_ENOUGH)
                .with(PAYMENT_RECOVERY_CONFIRM),
            Scene::at(MEMBERSHIP_URL).text(LONG_ENOUGH),
            membership_active("January 25, 2026"),
        ]);

        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Resume,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                kind: FailureKind::PaymentRecoveredNeedsRecheck,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreadable_page_is_state_uncertain() {
        let page = FakePage::script(vec![
            membership_active("December 25, 2025"),
            Scene::at(MEMBERSHIP_URL).text("thin"),
        ]);
        let outcome = run_attempt(
            &page,
            &row(),
            Intent::Pause,
            &AuthBudget::default(),
            &tuning(),
            today(),
        )
        .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                kind: FailureKind::StateUncertain,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn ambiguous_stable_shape_is_uncertain() {
        // Both action buttons at once matches neither state shape.
        let both = Scene::at(MEMBERSHIP_URL)
            .text(LONG_ENOUGH)
            .with(PAUSE_BUTTON)
            .with(RESUME_BUTTON);
        let page = FakePage::script(vec![both.clone(), both]);
        let detection = detect_state(&page, &tuning(), today()).await.unwrap();
        assert_eq!(detection.state, MembershipState::Uncertain);
    }
}
