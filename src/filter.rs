use crate::lock::cell_is_claimable;
use crate::rows::{RowStatus, TaskRow};
use crate::settings::TickSettings;
use chrono::{DateTime, Duration};
use chrono_tz::Tz;

/// The three ordered work queues of one tick, plus the payment-pending
/// rows that aged past the retry cap and must be given up on.
#[derive(Debug, Default)]
pub struct TickQueues {
    pub payment_retry: Vec<TaskRow>,
    pub resume: Vec<TaskRow>,
    pub pause: Vec<TaskRow>,
    pub payment_expired: Vec<TaskRow>,
}

impl TickQueues {
    pub fn is_empty(&self) -> bool {
        self.payment_retry.is_empty()
            && self.resume.is_empty()
            && self.pause.is_empty()
            && self.payment_expired.is_empty()
    }
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::seconds(d.as_secs() as i64)
}

/// Partition raw rows into the tick's queues. Pure: all inputs explicit,
/// boundaries inclusive, rows with unparseable schedule cells never
/// eligible.
pub fn partition(
    rows: Vec<TaskRow>,
    now: DateTime<Tz>,
    settings: &TickSettings,
    zone: Tz,
) -> TickQueues {
    let mut queues = TickQueues::default();

    let resume_horizon = now + to_chrono(settings.resume_before);
    let pause_horizon = now - to_chrono(settings.pause_after);
    let payment_cap = to_chrono(settings.payment_retry_max);

    for row in rows {
        let unlocked = cell_is_claimable(&row.lock_value, now, zone);
        let retries_left = row.retry_count < settings.max_retries;

        // Payment-pending rows are handled before the normal queues: a
        // pending next-retry instant excludes a row from pause/resume
        // regardless of its status cell.
        if let Some(first_seen) = row.payment_first_seen {
            if now - first_seen >= payment_cap {
                if unlocked {
                    queues.payment_expired.push(row);
                }
                continue;
            }
        }

        if let Some(next_retry) = row.payment_next_retry {
            if next_retry <= now && row.payment_first_seen.is_some() && retries_left && unlocked {
                queues.payment_retry.push(row);
            }
            continue;
        }

        let Some(scheduled) = row.scheduled_instant(zone) else {
            continue;
        };
        if !retries_left || !unlocked {
            continue;
        }

        match row.status {
            RowStatus::Paused if scheduled <= resume_horizon => queues.resume.push(row),
            RowStatus::Active if scheduled <= pause_horizon => queues.pause.push(row),
            _ => {}
        }
    }

    let by_schedule = |a: &TaskRow, b: &TaskRow| {
        let sa = a.scheduled_instant(zone);
        let sb = b.scheduled_instant(zone);
        sa.cmp(&sb).then(a.retry_count.cmp(&b.retry_count))
    };
    queues.resume.sort_by(by_schedule);
    queues.pause.sort_by(by_schedule);
    queues
        .payment_retry
        .sort_by(|a, b| a.payment_next_retry.cmp(&b.payment_next_retry));

    queues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::{self, DEFAULT_ZONE};

    fn at(stamp: &str) -> DateTime<Tz> {
        timefmt::parse_long_stamp(stamp, DEFAULT_ZONE).unwrap()
    }

    fn base_row(status: &str, date: &str, time: &str) -> TaskRow {
        TaskRow {
            row: 2,
            email: "a@gmail.com".to_string(),
            password: "pw".to_string(),
            recovery_email: String::new(),
            totp_secret: String::new(),
            status: status.parse().unwrap(),
            next_billing_date: timefmt::parse_sheet_date(date),
            scheduled_time: timefmt::parse_sheet_time(time),
            result_text: String::new(),
            retry_count: 0,
            lock_value: String::new(),
            payment_first_seen: None,
            payment_next_retry: None,
        }
    }

    fn settings() -> TickSettings {
        TickSettings::default()
    }

    #[test]
    fn pause_happy_path_elects_row() {
        // pauseAfterMinutes=30, schedule 07:00, tick at 07:45.
        let row = base_row("active", "2025-12-25", "7:00");
        let q = partition(vec![row], at("2025-12-25 07:45:00"), &settings(), DEFAULT_ZONE);
        assert_eq!(q.pause.len(), 1);
        assert!(q.resume.is_empty());
    }

    #[test]
    fn pause_boundary_is_inclusive() {
        let row = base_row("active", "2025-12-25", "7:00");
        // now - 30 min == 07:00 exactly.
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 07:30:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert_eq!(q.pause.len(), 1);

        // One second earlier: not yet eligible.
        let q = partition(vec![row], at("2025-12-25 07:29:59"), &settings(), DEFAULT_ZONE);
        assert!(q.pause.is_empty());
    }

    #[test]
    fn resume_happy_path_and_boundary() {
        // resumeBeforeMinutes=60, schedule 07:00, tick at 06:15.
        let mut row = base_row("paused", "2025-12-25", "7:00");
        row.retry_count = 1;
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 06:15:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert_eq!(q.resume.len(), 1);

        // now + 60 min == 07:00 exactly: inclusive.
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 06:00:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert_eq!(q.resume.len(), 1);

        let q = partition(vec![row], at("2025-12-25 05:59:59"), &settings(), DEFAULT_ZONE);
        assert!(q.resume.is_empty());
    }

    #[test]
    fn retry_cap_excludes_rows() {
        let mut row = base_row("active", "2025-12-25", "7:00");
        row.retry_count = settings().max_retries;
        let q = partition(vec![row], at("2025-12-25 07:45:00"), &settings(), DEFAULT_ZONE);
        assert!(q.is_empty());
    }

    #[test]
    fn live_lock_excludes_expired_lock_does_not() {
        let mut row = base_row("active", "2025-12-25", "7:00");
        row.lock_value = "w9|2025-12-25 08:00:00".to_string();
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 07:45:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert!(q.pause.is_empty());

        // Expiry equal to now counts as expired.
        row.lock_value = "w9|2025-12-25 07:45:00".to_string();
        let q = partition(vec![row], at("2025-12-25 07:45:00"), &settings(), DEFAULT_ZONE);
        assert_eq!(q.pause.len(), 1);
    }

    #[test]
    fn unparseable_schedule_never_eligible() {
        let row = base_row("active", "not a date", "7:00");
        let q = partition(vec![row], at("2025-12-25 07:45:00"), &settings(), DEFAULT_ZONE);
        assert!(q.is_empty());
    }

    #[test]
    fn payment_pending_rows_leave_normal_queues() {
        let mut row = base_row("active", "2025-12-25", "7:00");
        row.payment_first_seen = Some(at("2025-12-25 07:45:00"));
        row.payment_next_retry = Some(at("2025-12-25 08:00:00"));

        // Before the retry instant: nowhere.
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 07:50:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert!(q.is_empty());

        // At the retry instant: payment-retry queue only.
        let q = partition(
            vec![row.clone()],
            at("2025-12-25 08:00:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        assert_eq!(q.payment_retry.len(), 1);
        assert!(q.pause.is_empty());
    }

    #[test]
    fn aged_payment_rows_surface_as_give_up() {
        let mut row = base_row("active", "2025-12-25", "7:00");
        row.payment_first_seen = Some(at("2025-12-25 07:45:00"));
        row.payment_next_retry = Some(at("2025-12-26 07:00:00"));

        // 24 h after first-seen: dropped from the retry queue, surfaced
        // for the give-up commit.
        let q = partition(vec![row], at("2025-12-26 07:45:00"), &settings(), DEFAULT_ZONE);
        assert!(q.payment_retry.is_empty());
        assert_eq!(q.payment_expired.len(), 1);
    }

    #[test]
    fn queues_order_by_schedule_then_retry() {
        let mut early = base_row("active", "2025-12-25", "6:00");
        early.row = 4;
        let mut late = base_row("active", "2025-12-25", "7:00");
        late.row = 2;
        let mut tied_more_retries = base_row("active", "2025-12-25", "6:00");
        tied_more_retries.row = 3;
        tied_more_retries.retry_count = 2;

        let q = partition(
            vec![late, tied_more_retries, early],
            at("2025-12-25 12:00:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        let rows: Vec<u32> = q.pause.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![4, 3, 2]);
    }

    #[test]
    fn payment_retry_orders_by_retry_instant() {
        let mut a = base_row("active", "2025-12-25", "7:00");
        a.row = 2;
        a.payment_first_seen = Some(at("2025-12-25 07:45:00"));
        a.payment_next_retry = Some(at("2025-12-25 09:00:00"));
        let mut b = base_row("active", "2025-12-25", "7:00");
        b.row = 3;
        b.payment_first_seen = Some(at("2025-12-25 07:45:00"));
        b.payment_next_retry = Some(at("2025-12-25 08:00:00"));

        let q = partition(
            vec![a, b],
            at("2025-12-25 10:00:00"),
            &settings(),
            DEFAULT_ZONE,
        );
        let rows: Vec<u32> = q.payment_retry.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![3, 2]);
    }
}
