use crate::sheets::{SheetTransport, SheetsClient};
use chrono_tz::Tz;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration, fixed at startup from CLI flags and
/// environment. Per-tick knobs live in [`TickSettings`] instead and come
/// from the config tab.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub spreadsheet_id: String,
    pub credentials_path: PathBuf,
    pub zone: Tz,
    pub worker_id: String,
    pub task_tab: String,
    pub mapping_tab: String,
    pub config_tab: String,
    pub profile_host: String,
    pub profile_ports: Vec<u16>,
    pub webhook_url: Option<String>,
    /// Concurrent attempts; 1 means strictly sequential rows.
    pub pool_size: usize,
    /// Soft memory ceiling for the recycle hint; 0 disables the probe.
    pub memory_ceiling_mb: u64,
    pub lock_file: PathBuf,
    pub once: bool,
    pub dry_run: bool,
    /// Authenticate only; never touch the membership.
    pub login_mode: bool,
    pub debug_startup: bool,
}

impl KeeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.spreadsheet_id.trim().is_empty() {
            return Err(eyre!("spreadsheet id is empty; set GOOGLE_SHEETS_ID"));
        }
        if self.worker_id.trim().is_empty() || self.worker_id.contains('|') {
            return Err(eyre!(
                "worker id '{}' is empty or contains '|' (the lock separator)",
                self.worker_id
            ));
        }
        if self.pool_size == 0 {
            return Err(eyre!("pool size must be > 0"));
        }
        if self.profile_ports.is_empty() {
            return Err(eyre!("at least one profile service port is required"));
        }
        Ok(())
    }

    pub fn parse_zone(name: &str) -> Result<Tz> {
        name.parse()
            .map_err(|_| eyre!("unknown time zone '{name}'"))
    }

    /// Lock owner string for one pool slot. With a single slot the base
    /// worker id is used unchanged.
    pub fn slot_worker_id(&self, slot: usize) -> String {
        if self.pool_size <= 1 {
            self.worker_id.clone()
        } else {
            format!("{}-{slot}", self.worker_id)
        }
    }
}

/// Per-category toggles for out-of-band alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyToggles {
    pub permanent_failure: bool,
    pub payment_delay: bool,
    pub loop_detected: bool,
    pub retry_cap_exceeded: bool,
    pub payment_method_issue: bool,
}

impl Default for NotifyToggles {
    fn default() -> Self {
        Self {
            permanent_failure: true,
            payment_delay: true,
            loop_detected: true,
            retry_cap_exceeded: true,
            payment_method_issue: true,
        }
    }
}

/// Runtime parameters read from the config tab once per tick.
///
/// A snapshot is a value: it is taken at tick start and never mutates
/// mid-tick. On a load failure the last good snapshot is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSettings {
    /// How long AFTER the scheduled billing instant a row becomes
    /// pause-eligible.
    pub pause_after: Duration,
    /// How long BEFORE the scheduled billing instant a row becomes
    /// resume-eligible.
    pub resume_before: Duration,
    pub tick_interval: Duration,
    pub max_retries: u32,
    pub lock_ttl: Duration,
    /// Cap on how long a payment-pending row keeps rescheduling, measured
    /// from the first time the pending state was seen.
    pub payment_retry_max: Duration,
    /// Backoff schedule for payment retries, first entry first.
    pub payment_backoff: Vec<Duration>,
    pub notify: NotifyToggles,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            pause_after: Duration::from_secs(30 * 60),
            resume_before: Duration::from_secs(60 * 60),
            tick_interval: Duration::from_secs(60),
            max_retries: 3,
            lock_ttl: Duration::from_secs(600),
            payment_retry_max: Duration::from_secs(24 * 3600),
            payment_backoff: vec![
                Duration::from_secs(15 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(120 * 60),
            ],
            notify: NotifyToggles::default(),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl TickSettings {
    /// Parse key/value rows. Unknown keys are ignored, malformed values
    /// keep the default and warn once per load.
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut out = TickSettings::default();

        for row in rows {
            let key = row.first().map(|s| s.trim()).unwrap_or_default();
            let value = row.get(1).map(|s| s.trim()).unwrap_or_default();
            if key.is_empty() || key.eq_ignore_ascii_case("key") {
                continue;
            }

            let mut bad = false;
            match key {
                "pauseAfterMinutes" => match value.parse::<u64>() {
                    Ok(m) => out.pause_after = Duration::from_secs(m * 60),
                    Err(_) => bad = true,
                },
                "resumeBeforeMinutes" => match value.parse::<u64>() {
                    Ok(m) => out.resume_before = Duration::from_secs(m * 60),
                    Err(_) => bad = true,
                },
                "tickSeconds" => match value.parse::<u64>() {
                    Ok(s) => out.tick_interval = Duration::from_secs(s.max(1)),
                    Err(_) => bad = true,
                },
                "maxRetries" => match value.parse::<u32>() {
                    Ok(n) => out.max_retries = n,
                    Err(_) => bad = true,
                },
                "lockTtlSeconds" => match value.parse::<u64>() {
                    Ok(s) => out.lock_ttl = Duration::from_secs(s.max(30)),
                    Err(_) => bad = true,
                },
                "paymentRetryMaxHours" => match value.parse::<u64>() {
                    Ok(h) => out.payment_retry_max = Duration::from_secs(h.max(1) * 3600),
                    Err(_) => bad = true,
                },
                "paymentBackoffMinutes" => {
                    let parsed: Option<Vec<Duration>> = value
                        .split(',')
                        .map(|p| {
                            p.trim()
                                .parse::<u64>()
                                .ok()
                                .map(|m| Duration::from_secs(m * 60))
                        })
                        .collect();
                    match parsed {
                        Some(sched) if !sched.is_empty() => out.payment_backoff = sched,
                        _ => bad = true,
                    }
                }
                "notifyPermanentFailure" => match parse_bool(value) {
                    Some(b) => out.notify.permanent_failure = b,
                    None => bad = true,
                },
                "notifyPaymentDelay" => match parse_bool(value) {
                    Some(b) => out.notify.payment_delay = b,
                    None => bad = true,
                },
                "notifyLoopDetected" => match parse_bool(value) {
                    Some(b) => out.notify.loop_detected = b,
                    None => bad = true,
                },
                "notifyRetryCapExceeded" => match parse_bool(value) {
                    Some(b) => out.notify.retry_cap_exceeded = b,
                    None => bad = true,
                },
                "notifyPaymentMethodIssue" => match parse_bool(value) {
                    Some(b) => out.notify.payment_method_issue = b,
                    None => bad = true,
                },
                _ => {}
            }
            if bad {
                tracing::warn!(key, value, "config value did not parse; keeping default");
            }
        }

        out
    }
}

/// Loads a settings snapshot each tick, falling back to the last good one
/// when the config tab cannot be read.
pub struct SettingsStore {
    tab: String,
    last_good: Option<TickSettings>,
}

impl SettingsStore {
    pub fn new(tab: String) -> Self {
        Self {
            tab,
            last_good: None,
        }
    }

    pub async fn load<T: SheetTransport>(&mut self, client: &SheetsClient<T>) -> TickSettings {
        match client.read_rows(&self.tab).await {
            Ok(rows) => {
                let snapshot = TickSettings::from_rows(&rows);
                self.last_good = Some(snapshot.clone());
                snapshot
            }
            Err(err) => {
                let fallback = self.last_good.clone().unwrap_or_default();
                tracing::warn!(
                    tab = %self.tab,
                    error = %err,
                    "config load failed; reusing last good snapshot"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::mock::MockTransport;

    fn rows(pairs: &[(&str, &str)]) -> Vec<Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| vec![k.to_string(), v.to_string()])
            .collect()
    }

    #[test]
    fn parses_known_keys() {
        let s = TickSettings::from_rows(&rows(&[
            ("pauseAfterMinutes", "30"),
            ("resumeBeforeMinutes", "60"),
            ("tickSeconds", "45"),
            ("maxRetries", "5"),
            ("lockTtlSeconds", "300"),
            ("paymentRetryMaxHours", "24"),
            ("paymentBackoffMinutes", "15, 30, 60, 120"),
            ("notifyPaymentDelay", "off"),
        ]));
        assert_eq!(s.pause_after, Duration::from_secs(1800));
        assert_eq!(s.resume_before, Duration::from_secs(3600));
        assert_eq!(s.tick_interval, Duration::from_secs(45));
        assert_eq!(s.max_retries, 5);
        assert_eq!(s.lock_ttl, Duration::from_secs(300));
        assert_eq!(s.payment_backoff.len(), 4);
        assert!(!s.notify.payment_delay);
        assert!(s.notify.permanent_failure);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let s = TickSettings::from_rows(&rows(&[
            ("maxRetries", "lots"),
            ("paymentBackoffMinutes", "15,soon"),
            ("tickSeconds", "0"),
        ]));
        let d = TickSettings::default();
        assert_eq!(s.max_retries, d.max_retries);
        assert_eq!(s.payment_backoff, d.payment_backoff);
        // tickSeconds=0 parses but is clamped.
        assert_eq!(s.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn header_row_is_skipped() {
        let s = TickSettings::from_rows(&rows(&[("key", "value"), ("maxRetries", "7")]));
        assert_eq!(s.max_retries, 7);
    }

    #[tokio::test]
    async fn store_falls_back_to_last_good() {
        let transport = MockTransport::default().with_tab(
            "Config",
            vec![vec!["key", "value"], vec!["maxRetries", "9"]],
        );
        let client = SheetsClient::new(transport);
        let mut store = SettingsStore::new("Config".to_string());

        let first = store.load(&client).await;
        assert_eq!(first.max_retries, 9);

        // All retries fail: the previous snapshot is reused.
        client.transport().fail_next(10);
        let second = store.load(&client).await;
        assert_eq!(second, first);
    }
}
