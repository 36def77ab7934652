//! Send log: append-only record of accepted sends, counted per window.

use crate::clock::{format_timestamp, start_of_day, Clock};
use crate::store::PolicyStore;
use chrono::{Duration, NaiveDateTime};
use rusqlite::params;
use std::sync::Arc;

pub struct CounterStore {
    store: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    pub fn new(store: Arc<PolicyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Sends for `tenant_id` with `sent_at >= since` (inclusive).
    pub fn count_since(&self, tenant_id: i64, since: NaiveDateTime) -> anyhow::Result<i64> {
        let since = format_timestamp(since);
        self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM email_send_log WHERE user_id = ?1 AND sent_at >= ?2",
                params![tenant_id, since],
                |row| row.get(0),
            )
        })
    }

    /// Count used for decisions: query errors count as zero.
    pub fn count_or_zero(&self, tenant_id: i64, since: NaiveDateTime, window: &str) -> i64 {
        match self.count_since(tenant_id, since) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("{window} count for tenant {tenant_id} failed, assuming 0: {e:#}");
                0
            }
        }
    }

    pub fn append_send(&self, tenant_id: i64, sender: &str, recipient: &str, subject: &str) -> anyhow::Result<()> {
        let sent_at = format_timestamp(self.clock.now());
        self.store.write(|conn| {
            conn.execute(
                "INSERT INTO email_send_log (user_id, sender, recipient, subject, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tenant_id, sender, recipient, subject, sent_at],
            )
        })?;
        Ok(())
    }
}

/// Window boundaries for a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    /// Sliding: one hour back.
    pub hourly_since: NaiveDateTime,
    /// Fixed: midnight of the current day.
    pub daily_since: NaiveDateTime,
}

impl Windows {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            hourly_since: now - Duration::hours(1),
            daily_since: start_of_day(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::test_support::Fixture;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn counters(fixture: &Fixture) -> CounterStore {
        CounterStore::new(Arc::new(fixture.open_store()), Arc::new(FixedClock(noon())))
    }

    #[test]
    fn test_windows() {
        let w = Windows::at(noon());
        assert_eq!(format_timestamp(w.hourly_since), "2024-05-01 11:00:00");
        assert_eq!(format_timestamp(w.daily_since), "2024-05-01 00:00:00");

        let just_after_midnight = NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(0, 10, 0)
            .unwrap();
        let w = Windows::at(just_after_midnight);
        assert_eq!(format_timestamp(w.hourly_since), "2024-05-01 23:10:00");
        assert_eq!(format_timestamp(w.daily_since), "2024-05-02 00:00:00");
    }

    #[test]
    fn test_count_since_is_inclusive_and_per_tenant() {
        let fixture = Fixture::new();
        fixture.add_tenant(1, "a.test");
        fixture.add_tenant(2, "b.test");
        fixture.add_sends(1, "2024-05-01 11:00:00", 2);
        fixture.add_sends(1, "2024-05-01 10:59:59", 3);
        fixture.add_sends(2, "2024-05-01 11:30:00", 4);

        let counters = counters(&fixture);
        let w = Windows::at(noon());
        assert_eq!(counters.count_since(1, w.hourly_since).unwrap(), 2);
        assert_eq!(counters.count_since(1, w.daily_since).unwrap(), 5);
        assert_eq!(counters.count_since(2, w.hourly_since).unwrap(), 4);
        assert_eq!(counters.count_since(3, w.daily_since).unwrap(), 0);
    }

    #[test]
    fn test_append_send_uses_clock() {
        let fixture = Fixture::new();
        fixture.add_tenant(1, "a.test");

        let counters = counters(&fixture);
        counters
            .append_send(1, "alice@a.test", "bob@x.test", "hello")
            .unwrap();

        let (sent_at, subject): (String, String) = fixture
            .seed
            .query_row("SELECT sent_at, subject FROM email_send_log", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(sent_at, "2024-05-01 12:00:00");
        assert_eq!(subject, "hello");
        assert_eq!(counters.count_since(1, noon()).unwrap(), 1);
    }

    #[test]
    fn test_count_or_zero_on_failure() {
        let fixture = Fixture::new();
        fixture.seed.execute_batch("DROP TABLE email_send_log;").unwrap();
        let counters = counters(&fixture);
        assert_eq!(counters.count_or_zero(1, noon(), "hourly"), 0);
    }
}
