use crate::sheets::{normalize_gmail, SheetRecord};
use crate::timefmt;
use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Semantic fields of the integrated worker tab.
///
/// The physical column of each field is derived from the header row at read
/// time; nothing in the keeper refers to a column letter directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Email,
    Password,
    RecoveryEmail,
    TotpSecret,
    Status,
    NextBillingDate,
    ScheduledTimeOfDay,
    ResultText,
    RetryCount,
    LockValue,
    PaymentPendingFirstSeenAt,
    PaymentPendingNextRetryAt,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Email,
        Field::Password,
        Field::RecoveryEmail,
        Field::TotpSecret,
        Field::Status,
        Field::NextBillingDate,
        Field::ScheduledTimeOfDay,
        Field::ResultText,
        Field::RetryCount,
        Field::LockValue,
        Field::PaymentPendingFirstSeenAt,
        Field::PaymentPendingNextRetryAt,
    ];

    /// Header cell text that binds this field to a column.
    pub fn header(self) -> &'static str {
        match self {
            Field::Email => "email",
            Field::Password => "password",
            Field::RecoveryEmail => "recoveryEmail",
            Field::TotpSecret => "totpSecret",
            Field::Status => "status",
            Field::NextBillingDate => "nextBillingDate",
            Field::ScheduledTimeOfDay => "scheduledTimeOfDay",
            Field::ResultText => "resultText",
            Field::RetryCount => "retryCount",
            Field::LockValue => "lockValue",
            Field::PaymentPendingFirstSeenAt => "paymentPendingFirstSeenAt",
            Field::PaymentPendingNextRetryAt => "paymentPendingNextRetryAt",
        }
    }
}

/// Column positions of the semantic fields, derived from the actual header
/// row of the task tab.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    cols: BTreeMap<Field, usize>,
}

fn col_letter(mut idx: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

impl TaskLayout {
    pub fn from_headers(headers: &[String]) -> Result<Self> {
        let mut cols = BTreeMap::new();
        for field in Field::ALL {
            let want = field.header();
            let idx = headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(want))
                .ok_or_else(|| eyre!("task tab is missing required column '{want}'"))?;
            cols.insert(field, idx);
        }
        Ok(Self { cols })
    }

    /// A1 reference of `field` on sheet row `row` (1-based).
    pub fn a1(&self, field: Field, row: u32) -> String {
        let idx = self.cols[&field];
        format!("{}{}", col_letter(idx), row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Active,
    Paused,
    Empty,
    /// Free-text statuses are carried through untouched; the keeper never
    /// schedules work for them.
    Other,
}

impl FromStr for RowStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        Ok(if t.is_empty() || t.eq_ignore_ascii_case("empty") {
            RowStatus::Empty
        } else if t.eq_ignore_ascii_case("active") {
            RowStatus::Active
        } else if t.eq_ignore_ascii_case("paused") {
            RowStatus::Paused
        } else {
            RowStatus::Other
        })
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowStatus::Active => write!(f, "active"),
            RowStatus::Paused => write!(f, "paused"),
            RowStatus::Empty => write!(f, "empty"),
            RowStatus::Other => write!(f, "other"),
        }
    }
}

/// One account's lifecycle state, parsed from one sheet row.
///
/// Parsing is total: malformed cells become `None`/defaults rather than
/// errors, and the filter refuses to schedule rows whose schedule cells did
/// not parse. The sheet remains the single source of truth; this view is
/// derived and disposable.
#[derive(Debug, Clone)]
pub struct TaskRow {
    /// 1-based sheet row number, used to address cells on write-back.
    pub row: u32,
    pub email: String,
    pub password: String,
    pub recovery_email: String,
    pub totp_secret: String,
    pub status: RowStatus,
    pub next_billing_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    pub result_text: String,
    pub retry_count: u32,
    pub lock_value: String,
    pub payment_first_seen: Option<DateTime<Tz>>,
    pub payment_next_retry: Option<DateTime<Tz>>,
}

impl TaskRow {
    pub fn from_record(rec: &SheetRecord, zone: Tz) -> Self {
        let get = |f: Field| -> String { rec.fields.get(f.header()).cloned().unwrap_or_default() };

        TaskRow {
            row: rec.row,
            email: get(Field::Email).trim().to_string(),
            password: get(Field::Password),
            recovery_email: get(Field::RecoveryEmail).trim().to_string(),
            totp_secret: get(Field::TotpSecret).trim().to_string(),
            status: get(Field::Status).parse().unwrap_or(RowStatus::Other),
            next_billing_date: timefmt::parse_sheet_date(&get(Field::NextBillingDate)),
            scheduled_time: timefmt::parse_sheet_time(&get(Field::ScheduledTimeOfDay)),
            result_text: get(Field::ResultText),
            retry_count: get(Field::RetryCount).trim().parse().unwrap_or(0),
            lock_value: get(Field::LockValue).trim().to_string(),
            payment_first_seen: timefmt::parse_long_stamp(
                &get(Field::PaymentPendingFirstSeenAt),
                zone,
            ),
            payment_next_retry: timefmt::parse_long_stamp(
                &get(Field::PaymentPendingNextRetryAt),
                zone,
            ),
        }
    }

    /// The instant this row's billing event is scheduled at, in `zone`.
    /// `None` when either schedule cell is missing or unparseable.
    pub fn scheduled_instant(&self, zone: Tz) -> Option<DateTime<Tz>> {
        timefmt::combine(self.next_billing_date?, self.scheduled_time?, zone)
    }
}

/// One row of the profile mapping tab.
#[derive(Debug, Clone)]
pub struct ProfileMapping {
    pub profile_number: String,
    pub profile_id: String,
    pub group: String,
    pub email: String,
}

/// Email -> browser profile lookup, keyed by normalized address.
#[derive(Debug, Clone, Default)]
pub struct ProfileDirectory {
    by_email: BTreeMap<String, ProfileMapping>,
}

impl ProfileDirectory {
    pub fn from_records(records: &[SheetRecord]) -> Self {
        let mut by_email = BTreeMap::new();
        for rec in records {
            let get = |k: &str| rec.fields.get(k).cloned().unwrap_or_default();
            let mapping = ProfileMapping {
                profile_number: get("profileNumber").trim().to_string(),
                profile_id: get("profileId").trim().to_string(),
                group: get("group").trim().to_string(),
                email: get("email").trim().to_string(),
            };
            if mapping.profile_id.is_empty() || mapping.email.is_empty() {
                continue;
            }
            by_email.insert(normalize_gmail(&mapping.email), mapping);
        }
        Self { by_email }
    }

    pub fn lookup(&self, email: &str) -> Option<&ProfileMapping> {
        self.by_email.get(&normalize_gmail(email))
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}
