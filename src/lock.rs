use crate::rows::{Field, TaskLayout};
use crate::sheets::{SheetError, SheetTransport, SheetsClient};
use crate::timefmt;
use chrono::DateTime;
use chrono_tz::Tz;
use std::time::Duration;

/// A row is locked by `owner` until `expires_at`. Encoded in one cell as
/// `"<owner>|<long stamp>"`; any other cell content (empty, malformed, or
/// past expiry) counts as unlocked and stealable. TTL is the only liveness
/// signal; there is no "is this worker alive?" check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub owner: String,
    pub expires_at: DateTime<Tz>,
}

impl RowLock {
    pub fn parse(cell: &str, zone: Tz) -> Option<RowLock> {
        let (owner, stamp) = cell.trim().split_once('|')?;
        if owner.is_empty() {
            return None;
        }
        Some(RowLock {
            owner: owner.to_string(),
            expires_at: timefmt::parse_long_stamp(stamp, zone)?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.owner, timefmt::long_stamp(&self.expires_at))
    }

    /// Expiry is inclusive: a lock whose expiry equals `now` is expired.
    pub fn is_expired(&self, now: DateTime<Tz>) -> bool {
        self.expires_at <= now
    }
}

/// True when the cell does not hold a live lock.
pub fn cell_is_claimable(cell: &str, now: DateTime<Tz>, zone: Tz) -> bool {
    match RowLock::parse(cell, zone) {
        Some(lock) => lock.is_expired(now),
        None => true,
    }
}

/// Claims and releases per-row locks for one worker.
pub struct LockManager {
    tab: String,
    worker_id: String,
    zone: Tz,
}

impl LockManager {
    pub fn new(tab: String, worker_id: String, zone: Tz) -> Self {
        Self {
            tab,
            worker_id,
            zone,
        }
    }

    /// Claim protocol: read, refuse on a live foreign lock, write
    /// `"W|T"`, then re-read and require an exact match. The verification
    /// read is mandatory: the spreadsheet has no compare-and-set, and two
    /// workers writing near-simultaneously will both see their own write
    /// land; exactly one survives the re-read.
    pub async fn claim<T: SheetTransport>(
        &self,
        client: &SheetsClient<T>,
        layout: &TaskLayout,
        row: u32,
        ttl: Duration,
        now: DateTime<Tz>,
    ) -> Result<bool, SheetError> {
        let cell = layout.a1(Field::LockValue, row);

        let current = client.read_cell(&self.tab, &cell).await?;
        if let Some(lock) = RowLock::parse(&current, self.zone) {
            if !lock.is_expired(now) && lock.owner != self.worker_id {
                tracing::debug!(row, owner = %lock.owner, "row locked by another worker");
                return Ok(false);
            }
        }

        let claim = RowLock {
            owner: self.worker_id.clone(),
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
        };
        let encoded = claim.encode();
        client.write_cell(&self.tab, &cell, &encoded).await?;

        let verify = client.read_cell(&self.tab, &cell).await?;
        if verify == encoded {
            Ok(true)
        } else {
            tracing::info!(row, observed = %verify, "lost claim race; skipping row");
            Ok(false)
        }
    }

    /// Best-effort release. A failed release is not fatal: the lock
    /// expires on TTL and any worker may then steal it.
    pub async fn release<T: SheetTransport>(
        &self,
        client: &SheetsClient<T>,
        layout: &TaskLayout,
        row: u32,
    ) {
        let cell = layout.a1(Field::LockValue, row);
        if let Err(err) = client.write_cell(&self.tab, &cell, "").await {
            tracing::warn!(row, error = %err, "lock release failed; TTL will expire it");
        }
    }
}
