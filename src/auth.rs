use crate::browser::{PageError, SessionPage};
use crate::outcome::FailureKind;
use crate::pages::{classify, observe, PageKind};
use crate::totp;
use std::time::Duration;

/// Canonical sign-in entry point; error recovery re-navigates here.
pub const SIGNIN_URL: &str =
    "https://accounts.google.com/ServiceLogin?continue=https://www.youtube.com/";
pub const YOUTUBE_URL: &str = "https://www.youtube.com/";

pub const EMAIL_FIELD: &str = "input[type='email'], #identifierId";
pub const EMAIL_NEXT: &str = "#identifierNext";
pub const PASSWORD_FIELD: &str = "input[type='password'], input[name='Passwd']";
pub const PASSWORD_NEXT: &str = "#passwordNext";
pub const TOTP_FIELD: &str = "#totpPin, input[name='totpPin']";
pub const TOTP_NEXT: &str = "#totpNext";
pub const CHOOSER_USE_ANOTHER: &str = "li [data-authuser='-1'], div[data-action='ADD_ACCOUNT']";
pub const RECOVERY_EMAIL_OPTION: &str = "[data-challengetype='12']";
pub const CHALLENGE_OPTION_ANY: &str = "form [data-challengetype]";
pub const PASSKEY_SKIP: &str = "button[jsname='bySMBb'], [data-skip-enrollment]";
pub const IDENTITY_CONFIRM: &str = "#confirmButton, button[jsname='LgbsSe']";

/// Credentials borrowed from the row for the duration of one attempt.
/// Never cached across attempts.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub recovery_email: &'a str,
    pub totp_secret: &'a str,
}

#[derive(Debug, Clone)]
pub struct AuthBudget {
    /// Absolute wall-clock ceiling for one auth attempt.
    pub wall_clock: Duration,
    /// Maximum page transitions before giving up.
    pub max_steps: u32,
}

impl Default for AuthBudget {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(180),
            max_steps: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    LoggedIn { premium: bool },
    Failed { kind: FailureKind, detail: String },
}

enum Verdict {
    Advanced,
    Done { premium: bool },
    Retriable(FailureKind, String),
    Terminal(FailureKind, String),
}

fn page_failure(err: PageError) -> AuthOutcome {
    let (kind, detail) = match err {
        PageError::SessionLost(d) => (FailureKind::SessionLost, d),
        PageError::Browser(d) => (FailureKind::BrowserError, d),
    };
    AuthOutcome::Failed { kind, detail }
}

/// Per-attempt recovery state. Counters are deliberately attempt-scoped:
/// a fresh session starts from zero.
struct Recovery {
    reloaded_for_error: bool,
    reloaded_for_passkey: bool,
    reloaded_for_unknown: bool,
    signin_navs: u32,
}

/// Drive a fresh session to a logged-in state or a typed failure.
///
/// One outer loop: classify the page, dispatch to its handler, repeat.
/// Bounded by both the wall clock and the step budget; whichever trips
/// first yields `auth_timeout`. Handlers never call back into the
/// dispatcher.
pub async fn authenticate<P: SessionPage>(
    page: &P,
    creds: Credentials<'_>,
    budget: &AuthBudget,
) -> AuthOutcome {
    let deadline = tokio::time::Instant::now() + budget.wall_clock;
    let mut recovery = Recovery {
        reloaded_for_error: false,
        reloaded_for_passkey: false,
        reloaded_for_unknown: false,
        signin_navs: 0,
    };

    for step in 1..=budget.max_steps {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return AuthOutcome::Failed {
                kind: FailureKind::AuthTimeout,
                detail: "wall clock exhausted".to_string(),
            };
        }

        let snap = match observe(page).await {
            Ok(snap) => snap,
            Err(err) => return page_failure(err),
        };
        let kind = classify(&snap);
        tracing::debug!(step, page = ?kind, url = %snap.url, "auth step");

        let handled = tokio::time::timeout(
            remaining,
            handle(page, kind, &snap.text, creds, &mut recovery),
        )
        .await;
        let verdict = match handled {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => return page_failure(err),
            Err(_) => {
                return AuthOutcome::Failed {
                    kind: FailureKind::AuthTimeout,
                    detail: "wall clock exhausted mid-step".to_string(),
                }
            }
        };

        match verdict {
            Verdict::Advanced => continue,
            Verdict::Done { premium } => return AuthOutcome::LoggedIn { premium },
            Verdict::Retriable(kind, detail) => return AuthOutcome::Failed { kind, detail },
            Verdict::Terminal(kind, detail) => return AuthOutcome::Failed { kind, detail },
        }
    }

    AuthOutcome::Failed {
        kind: FailureKind::AuthTimeout,
        detail: "step budget exhausted".to_string(),
    }
}

async fn handle<P: SessionPage>(
    page: &P,
    kind: PageKind,
    body_text: &str,
    creds: Credentials<'_>,
    recovery: &mut Recovery,
) -> Result<Verdict, PageError> {
    match kind {
        PageKind::LoggedIn => Ok(Verdict::Done { premium: false }),
        PageKind::LoggedInPremium => Ok(Verdict::Done { premium: true }),

        // Logged into the Google account but not on YouTube yet.
        PageKind::ProfileHome => {
            page.navigate(YOUTUBE_URL).await?;
            Ok(Verdict::Advanced)
        }

        PageKind::AccountChooser => {
            // Prefer "use another account": routing through the identifier
            // page avoids a known CAPTCHA trigger on the tile path.
            if page.exists(CHOOSER_USE_ANOTHER).await? {
                page.click(CHOOSER_USE_ANOTHER).await?;
                return Ok(Verdict::Advanced);
            }
            let tile = format!("[data-identifier='{}']", creds.email);
            if page.exists(&tile).await? {
                page.click(&tile).await?;
                return Ok(Verdict::Advanced);
            }
            Ok(Verdict::Retriable(
                FailureKind::BrowserError,
                "account chooser had no usable entries".to_string(),
            ))
        }

        PageKind::EmailInput => {
            let prefilled = page
                .value_of(EMAIL_FIELD)
                .await?
                .map(|v| v.trim().eq_ignore_ascii_case(creds.email))
                .unwrap_or(false);
            if !prefilled {
                page.type_text(EMAIL_FIELD, creds.email).await?;
            }
            page.click(EMAIL_NEXT).await?;
            Ok(Verdict::Advanced)
        }

        PageKind::PasswordInput => {
            page.type_text(PASSWORD_FIELD, creds.password).await?;
            page.click(PASSWORD_NEXT).await?;
            Ok(Verdict::Advanced)
        }

        PageKind::TwoFactor => {
            if creds.totp_secret.is_empty() {
                return Ok(Verdict::Retriable(
                    FailureKind::AuthTimeout,
                    "totp challenge but the row has no secret".to_string(),
                ));
            }
            let now = unix_now();
            // Too close to the window edge: the code could expire between
            // typing and submit. Wait for the next window and regenerate.
            if totp::seconds_remaining(now) < 5 {
                tokio::time::sleep(Duration::from_secs(totp::seconds_remaining(now) + 1)).await;
            }
            let code = match totp::code_at(creds.totp_secret, unix_now()) {
                Ok(code) => code,
                Err(err) => {
                    return Ok(Verdict::Retriable(
                        FailureKind::AuthTimeout,
                        format!("totp generation failed: {err}"),
                    ))
                }
            };
            page.type_text(TOTP_FIELD, &code).await?;
            page.click(TOTP_NEXT).await?;
            Ok(Verdict::Advanced)
        }

        PageKind::RecoverySelection => {
            if page.exists(RECOVERY_EMAIL_OPTION).await? {
                page.click(RECOVERY_EMAIL_OPTION).await?;
            } else if page.exists(CHALLENGE_OPTION_ANY).await? {
                page.click(CHALLENGE_OPTION_ANY).await?;
            } else {
                return Ok(Verdict::Retriable(
                    FailureKind::StateUncertain,
                    "challenge selection offered no options".to_string(),
                ));
            }
            Ok(Verdict::Advanced)
        }

        PageKind::IdentityConfirmation => {
            if page.exists(IDENTITY_CONFIRM).await? {
                page.click(IDENTITY_CONFIRM).await?;
                return Ok(Verdict::Advanced);
            }
            Ok(Verdict::Retriable(
                FailureKind::StateUncertain,
                "identity confirmation without a continue control".to_string(),
            ))
        }

        // Never solved, only reported; the outer pipeline reschedules
        // with a fresh session later.
        PageKind::ImageCaptcha => Ok(Verdict::Retriable(
            FailureKind::Captcha,
            "image captcha".to_string(),
        )),
        PageKind::Recaptcha => Ok(Verdict::Retriable(
            FailureKind::Captcha,
            "recaptcha".to_string(),
        )),

        PageKind::PhoneVerification => Ok(Verdict::Terminal(
            FailureKind::PhoneVerification,
            "phone verification demanded".to_string(),
        )),
        PageKind::AccountDisabled => Ok(Verdict::Terminal(
            FailureKind::AccountDisabled,
            "account disabled".to_string(),
        )),

        PageKind::PasskeyEnrollment => {
            if page.exists(PASSKEY_SKIP).await? {
                page.click(PASSKEY_SKIP).await?;
                return Ok(Verdict::Advanced);
            }
            // Known failure mode: the enrollment page renders black or
            // dies on an SSL error. One reload, then report.
            if !recovery.reloaded_for_passkey {
                recovery.reloaded_for_passkey = true;
                page.reload().await?;
                return Ok(Verdict::Advanced);
            }
            Ok(Verdict::Retriable(
                FailureKind::BrowserError,
                "passkey_black_screen".to_string(),
            ))
        }

        PageKind::BrowserError | PageKind::ProviderError => {
            if !recovery.reloaded_for_error {
                recovery.reloaded_for_error = true;
                page.reload().await?;
                return Ok(Verdict::Advanced);
            }
            if recovery.signin_navs < 3 {
                recovery.signin_navs += 1;
                tokio::time::sleep(Duration::from_secs(2)).await;
                page.navigate(SIGNIN_URL).await?;
                return Ok(Verdict::Advanced);
            }
            let lower = body_text.to_lowercase();
            let detail = if lower.contains("err_connection_closed")
                || lower.contains("err_network_changed")
            {
                // Proxy reconnects show up as these two; same retriable
                // class, clearer operator message.
                "proxy reconnect transient".to_string()
            } else {
                "error page persisted through recovery".to_string()
            };
            Ok(Verdict::Retriable(FailureKind::BrowserError, detail))
        }

        PageKind::Unknown => {
            if !recovery.reloaded_for_unknown {
                recovery.reloaded_for_unknown = true;
                page.reload().await?;
                return Ok(Verdict::Advanced);
            }
            Ok(Verdict::Retriable(
                FailureKind::AuthTimeout,
                "unrecognized page".to_string(),
            ))
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakePage, Scene};

    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn creds() -> Credentials<'static> {
        Credentials {
            email: "user@gmail.com",
            password: "hunter2",
            recovery_email: "rec@gmail.com",
            totp_secret: RFC_SECRET,
        }
    }

    fn budget() -> AuthBudget {
        AuthBudget::default()
    }

    #[tokio::test]
    async fn full_login_path_reaches_premium() {
        let page = FakePage::script(vec![
            Scene::at("https://accounts.google.com/accountchooser").with(CHOOSER_USE_ANOTHER),
            Scene::at("https://accounts.google.com/v3/signin/identifier")
                .value(EMAIL_FIELD, "")
                .with(EMAIL_NEXT),
            Scene::at("https://accounts.google.com/v3/signin/challenge/pwd")
                .with(PASSWORD_FIELD)
                .with(PASSWORD_NEXT),
            Scene::at("https://accounts.google.com/v3/signin/challenge/totp")
                .with(TOTP_FIELD)
                .with(TOTP_NEXT),
            Scene::at("https://www.youtube.com/paid_memberships"),
        ]);

        // Two clicks per input page: type does not advance the scene, the
        // "next" click does... except the chooser, which advances on its
        // single click.
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(outcome, AuthOutcome::LoggedIn { premium: true });

        let actions = page.actions();
        assert_eq!(actions[0], format!("click:{CHOOSER_USE_ANOTHER}"));
        assert!(actions
            .iter()
            .any(|a| a == &format!("type:{EMAIL_FIELD}=user@gmail.com")));
        assert!(actions
            .iter()
            .any(|a| a == &format!("type:{PASSWORD_FIELD}=hunter2")));
        assert!(actions
            .iter()
            .any(|a| a.starts_with(&format!("type:{TOTP_FIELD}="))));
    }

    #[tokio::test]
    async fn prefilled_email_is_not_retyped() {
        let page = FakePage::script(vec![
            Scene::at("https://accounts.google.com/v3/signin/identifier")
                .value(EMAIL_FIELD, "User@gmail.com")
                .with(EMAIL_NEXT),
            Scene::at("https://www.youtube.com/").with("button#avatar-btn"),
        ]);

        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(outcome, AuthOutcome::LoggedIn { premium: false });
        assert!(page.actions().iter().all(|a| !a.starts_with("type:")));
    }

    #[tokio::test]
    async fn chooser_falls_back_to_email_tile() {
        let tile = "[data-identifier='user@gmail.com']";
        let page = FakePage::script(vec![
            Scene::at("https://accounts.google.com/accountchooser").with(tile),
            Scene::at("https://www.youtube.com/paid_memberships"),
        ]);

        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(outcome, AuthOutcome::LoggedIn { premium: true });
        assert_eq!(page.actions(), vec![format!("click:{tile}")]);
    }

    #[tokio::test]
    async fn captcha_aborts_retriable_without_solving() {
        let page = FakePage::script(vec![Scene::at(
            "https://accounts.google.com/v3/signin/challenge/recaptcha",
        )]);
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(
            outcome,
            AuthOutcome::Failed {
                kind: FailureKind::Captcha,
                detail: "recaptcha".to_string()
            }
        );
        assert!(page.actions().is_empty());
    }

    #[tokio::test]
    async fn phone_verification_is_terminal() {
        let page = FakePage::script(vec![Scene::at(
            "https://accounts.google.com/v3/signin/challenge/ipp",
        )]);
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert!(matches!(
            outcome,
            AuthOutcome::Failed {
                kind: FailureKind::PhoneVerification,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_page_retries_once_then_times_out() {
        let page = FakePage::script(vec![
            Scene::at("https://example.com/strange"),
            Scene::at("https://example.com/still-strange"),
        ]);
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(
            outcome,
            AuthOutcome::Failed {
                kind: FailureKind::AuthTimeout,
                detail: "unrecognized page".to_string()
            }
        );
        assert_eq!(page.actions(), vec!["reload".to_string()]);
    }

    #[tokio::test]
    async fn passkey_enrollment_is_skipped() {
        let page = FakePage::script(vec![
            Scene::at("https://accounts.google.com/signin/passkeyenrollment").with(PASSKEY_SKIP),
            Scene::at("https://www.youtube.com/paid_memberships"),
        ]);
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(outcome, AuthOutcome::LoggedIn { premium: true });
        assert_eq!(page.actions(), vec![format!("click:{PASSKEY_SKIP}")]);
    }

    #[tokio::test]
    async fn step_budget_bounds_the_loop() {
        // An endless chain of chooser pages that keep advancing.
        let scenes: Vec<Scene> = (0..30)
            .map(|_| Scene::at("https://accounts.google.com/accountchooser").with(CHOOSER_USE_ANOTHER))
            .collect();
        let page = FakePage::script(scenes);
        let outcome = authenticate(&page, creds(), &budget()).await;
        assert_eq!(
            outcome,
            AuthOutcome::Failed {
                kind: FailureKind::AuthTimeout,
                detail: "step budget exhausted".to_string()
            }
        );
        assert_eq!(page.actions().len(), budget().max_steps as usize);
    }
}
