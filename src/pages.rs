use crate::browser::{PageError, SessionPage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Closed set of page types the auth driver can land on. The classifier
/// returns exactly one; every variant has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageKind {
    ProfileHome,
    BrowserError,
    ProviderError,
    AccountDisabled,
    PasskeyEnrollment,
    ImageCaptcha,
    Recaptcha,
    PhoneVerification,
    IdentityConfirmation,
    AccountChooser,
    EmailInput,
    PasswordInput,
    TwoFactor,
    RecoverySelection,
    LoggedIn,
    LoggedInPremium,
    Unknown,
}

/// DOM probes taken for every snapshot, keyed by a stable marker id.
/// Selector churn on the remote side only ever touches this table.
pub const MARKER_SELECTORS: &[(&str, &str)] = &[
    ("email-field", "input[type='email'], #identifierId"),
    ("email-next", "#identifierNext"),
    ("password-field", "input[type='password'], input[name='Passwd']"),
    ("password-next", "#passwordNext"),
    ("totp-field", "#totpPin, input[name='totpPin']"),
    ("captcha-image", "img#captchaimg"),
    ("recaptcha-frame", "iframe[src*='recaptcha']"),
    ("chooser-list", "ul li[data-identifier]"),
    ("chooser-use-another", "li [data-authuser='-1'], div[data-action='ADD_ACCOUNT']"),
    ("challenge-list", "form [data-challengetype]"),
    ("recovery-email-option", "[data-challengetype='12']"),
    ("passkey-skip", "button[jsname='bySMBb'], [data-skip-enrollment]"),
    ("yt-avatar", "button#avatar-btn"),
    ("yt-premium-logo", "ytd-topbar-logo-renderer[is-premium-logo], #premium-logo"),
];

/// What the classifier looks at: one consistent scrape of the page.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: String,
    pub text: String,
    pub markers: BTreeSet<&'static str>,
}

impl PageSnapshot {
    pub fn has(&self, marker: &str) -> bool {
        self.markers.contains(marker)
    }
}

/// Scrape the current page into a snapshot.
pub async fn observe<P: SessionPage + ?Sized>(page: &P) -> Result<PageSnapshot, PageError> {
    let url = page.current_url().await?;
    let text = page.body_text().await?;
    let mut markers = BTreeSet::new();
    for (id, selector) in MARKER_SELECTORS {
        if page.exists(selector).await? {
            markers.insert(*id);
        }
    }
    Ok(PageSnapshot { url, text, markers })
}

fn classify_by_url(url: &str) -> Option<PageKind> {
    if url.starts_with("chrome-error://") || url.starts_with("about:neterror") {
        return Some(PageKind::BrowserError);
    }
    if url.contains("myaccount.google.com") {
        return Some(PageKind::ProfileHome);
    }
    if url.contains("youtube.com/paid_memberships") || url.contains("youtube.com/premium") {
        return Some(PageKind::LoggedInPremium);
    }

    if !url.contains("accounts.google.com") {
        return None;
    }
    let rules: &[(&str, PageKind)] = &[
        ("/signin/rejected", PageKind::AccountDisabled),
        ("/deniedsigninrejected", PageKind::AccountDisabled),
        ("/accountchooser", PageKind::AccountChooser),
        ("/signinchooser", PageKind::AccountChooser),
        ("/challenge/pwd", PageKind::PasswordInput),
        ("/challenge/totp", PageKind::TwoFactor),
        ("/challenge/selection", PageKind::RecoverySelection),
        ("/challenge/recaptcha", PageKind::Recaptcha),
        ("/challenge/ipp", PageKind::PhoneVerification),
        ("/challenge/iap", PageKind::PhoneVerification),
        ("/speedbump/idvreenable", PageKind::PhoneVerification),
        ("/passkeyenrollment", PageKind::PasskeyEnrollment),
        ("/signin/identifier", PageKind::EmailInput),
        ("/confirmidentity", PageKind::IdentityConfirmation),
    ];
    rules
        .iter()
        .find(|(needle, _)| url.contains(needle))
        .map(|(_, kind)| *kind)
}

fn classify_by_markers(snap: &PageSnapshot) -> Option<PageKind> {
    if snap.has("captcha-image") {
        return Some(PageKind::ImageCaptcha);
    }
    if snap.has("recaptcha-frame") {
        return Some(PageKind::Recaptcha);
    }
    if snap.has("totp-field") {
        return Some(PageKind::TwoFactor);
    }
    if snap.has("password-field") {
        return Some(PageKind::PasswordInput);
    }
    if snap.has("chooser-list") {
        return Some(PageKind::AccountChooser);
    }
    if snap.has("recovery-email-option") || snap.has("challenge-list") {
        return Some(PageKind::RecoverySelection);
    }
    if snap.has("email-field") {
        return Some(PageKind::EmailInput);
    }
    if snap.has("yt-avatar") {
        return Some(if snap.has("yt-premium-logo") {
            PageKind::LoggedInPremium
        } else {
            PageKind::LoggedIn
        });
    }
    None
}

fn classify_by_text(text: &str) -> Option<PageKind> {
    let lower = text.to_lowercase();
    let rules: &[(&str, PageKind)] = &[
        ("err_connection_closed", PageKind::BrowserError),
        ("err_network_changed", PageKind::BrowserError),
        ("this site can't be reached", PageKind::BrowserError),
        ("your account has been disabled", PageKind::AccountDisabled),
        ("계정이 사용 중지", PageKind::AccountDisabled),
        ("verify it's you", PageKind::IdentityConfirmation),
        ("verify your phone", PageKind::PhoneVerification),
        ("confirm your phone", PageKind::PhoneVerification),
        ("simplify your sign-in", PageKind::PasskeyEnrollment),
        ("choose an account", PageKind::AccountChooser),
        ("something went wrong", PageKind::ProviderError),
        ("try again later", PageKind::ProviderError),
    ];
    rules
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
}

/// Classify a snapshot. URL patterns are authoritative and checked first,
/// then DOM markers, then body-text keywords. The order is load-bearing:
/// body text carries false positives (a Premium page can legitimately
/// display "Something went wrong" as UI copy).
pub fn classify(snap: &PageSnapshot) -> PageKind {
    if let Some(kind) = classify_by_url(&snap.url) {
        return kind;
    }
    if let Some(kind) = classify_by_markers(snap) {
        return kind;
    }
    if let Some(kind) = classify_by_text(&snap.text) {
        return kind;
    }
    PageKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(url: &str, text: &str, markers: &[&'static str]) -> PageSnapshot {
        PageSnapshot {
            url: url.to_string(),
            text: text.to_string(),
            markers: markers.iter().copied().collect(),
        }
    }

    #[test]
    fn url_patterns_are_authoritative() {
        assert_eq!(
            classify(&snap(
                "https://accounts.google.com/v3/signin/challenge/pwd?x=1",
                "",
                &[]
            )),
            PageKind::PasswordInput
        );
        assert_eq!(
            classify(&snap(
                "https://accounts.google.com/v3/signin/challenge/totp",
                "",
                &[]
            )),
            PageKind::TwoFactor
        );
        assert_eq!(
            classify(&snap("https://accounts.google.com/accountchooser", "", &[])),
            PageKind::AccountChooser
        );
        assert_eq!(
            classify(&snap("https://myaccount.google.com/", "", &[])),
            PageKind::ProfileHome
        );
        assert_eq!(
            classify(&snap("chrome-error://chromewebdata/", "", &[])),
            PageKind::BrowserError
        );
    }

    #[test]
    fn url_wins_over_misleading_body_text() {
        // Premium pages can contain error-sounding UI copy.
        let s = snap(
            "https://www.youtube.com/paid_memberships",
            "Something went wrong with a thumbnail",
            &[],
        );
        assert_eq!(classify(&s), PageKind::LoggedInPremium);
    }

    #[test]
    fn markers_beat_body_text() {
        let s = snap(
            "https://example.com/interstitial",
            "Something went wrong",
            &["password-field"],
        );
        assert_eq!(classify(&s), PageKind::PasswordInput);
    }

    #[test]
    fn captcha_markers() {
        assert_eq!(
            classify(&snap("https://example.com/", "", &["captcha-image"])),
            PageKind::ImageCaptcha
        );
        assert_eq!(
            classify(&snap("https://example.com/", "", &["recaptcha-frame"])),
            PageKind::Recaptcha
        );
    }

    #[test]
    fn logged_in_detection() {
        assert_eq!(
            classify(&snap("https://www.youtube.com/", "", &["yt-avatar"])),
            PageKind::LoggedIn
        );
        assert_eq!(
            classify(&snap(
                "https://www.youtube.com/",
                "",
                &["yt-avatar", "yt-premium-logo"]
            )),
            PageKind::LoggedInPremium
        );
    }

    #[test]
    fn text_keywords_as_last_resort() {
        assert_eq!(
            classify(&snap("https://example.com/", "Something went wrong. Try again.", &[])),
            PageKind::ProviderError
        );
        assert_eq!(
            classify(&snap("https://example.com/", "계정이 사용 중지되었습니다", &[])),
            PageKind::AccountDisabled
        );
    }

    #[test]
    fn unknown_when_nothing_matches() {
        assert_eq!(
            classify(&snap("https://example.com/", "hello", &[])),
            PageKind::Unknown
        );
    }
}
