//! Overflow queue: deferred sends parked for a later drain.

use crate::clock::{format_timestamp, Clock};
use crate::store::PolicyStore;
use chrono::Duration;
use rusqlite::params;
use std::sync::Arc;

pub const STATUS_PENDING: &str = "pending";

pub struct OverflowQueue {
    store: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
    delay: Duration,
}

impl OverflowQueue {
    pub fn new(store: Arc<PolicyStore>, clock: Arc<dyn Clock>, defer_seconds: i64) -> Self {
        Self {
            store,
            clock,
            delay: Duration::seconds(defer_seconds),
        }
    }

    /// Insert a pending entry scheduled `delay` from now. Failures are logged
    /// and reported as `false`; the MTA response does not depend on them.
    pub fn enqueue(&self, tenant_id: i64, sender: &str, recipient: &str, subject: &str) -> bool {
        match self.insert(tenant_id, sender, recipient, subject) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to queue deferred mail for tenant {tenant_id} ({sender} -> {recipient}): {e:#}");
                false
            }
        }
    }

    fn insert(&self, tenant_id: i64, sender: &str, recipient: &str, subject: &str) -> anyhow::Result<()> {
        let scheduled_at = format_timestamp(self.clock.now() + self.delay);
        self.store.write(|conn| {
            conn.execute(
                "INSERT INTO mail_queue (user_id, sender, recipient, subject, scheduled_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![tenant_id, sender, recipient, subject, scheduled_at, STATUS_PENDING],
            )
        })?;
        Ok(())
    }

    pub fn pending_count(&self, tenant_id: i64) -> anyhow::Result<i64> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM mail_queue WHERE user_id = ?1 AND status = ?2",
                params![tenant_id, STATUS_PENDING],
                |row| row.get(0),
            )
        })
    }
}
