//! Decision Engine
//!
//! Walks the admission steps in order and stops at the first that applies:
//!
//! 1. malformed or empty sender: abstain
//! 2. no tenant owns the sender domain: abstain
//! 3. hourly count at or over the limit: defer, queue the mail
//! 4. daily count at or over the limit: defer, queue the mail
//! 5. otherwise allow and record the send
//!
//! Counts are read before the current request is recorded. Two concurrent
//! requests for one tenant can both see the same count and both pass.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::counters::{CounterStore, Windows};
use crate::protocol::{PolicyAction, PolicyRequest};
use crate::queue::OverflowQueue;
use crate::store::PolicyStore;
use crate::tenant::{SenderAddress, Tenant, TenantResolver};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstainReason {
    MalformedSender,
    NoTenant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Decision {
    Abstain {
        reason: AbstainReason,
    },
    Allow {
        tenant: Tenant,
        hourly_count: i64,
        daily_count: i64,
    },
    DeferHourly {
        tenant: Tenant,
        hourly_count: i64,
    },
    DeferDaily {
        tenant: Tenant,
        hourly_count: i64,
        daily_count: i64,
    },
}

impl Decision {
    pub fn action(&self) -> PolicyAction {
        match *self {
            Decision::Abstain { .. } | Decision::Allow { .. } => PolicyAction::Dunno,
            Decision::DeferHourly {
                tenant,
                hourly_count,
            } => PolicyAction::DeferHourly {
                count: hourly_count,
                limit: tenant.hourly_limit,
            },
            Decision::DeferDaily {
                tenant, daily_count, ..
            } => PolicyAction::DeferDaily {
                count: daily_count,
                limit: tenant.daily_limit,
            },
        }
    }

    pub fn tenant(&self) -> Option<Tenant> {
        match *self {
            Decision::Abstain { .. } => None,
            Decision::Allow { tenant, .. }
            | Decision::DeferHourly { tenant, .. }
            | Decision::DeferDaily { tenant, .. } => Some(tenant),
        }
    }
}

pub struct DecisionEngine {
    clock: Arc<dyn Clock>,
    tenants: TenantResolver,
    counters: CounterStore,
    queue: OverflowQueue,
}

impl DecisionEngine {
    pub fn new(store: Arc<PolicyStore>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            tenants: TenantResolver::new(store.clone(), config.limits),
            counters: CounterStore::new(store.clone(), clock.clone()),
            queue: OverflowQueue::new(store, clock.clone(), config.queue.defer_seconds),
            clock,
        }
    }

    /// Open the configured database on the system clock. Each call opens
    /// fresh handles, so a daemon builds its engine after forking.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = PolicyStore::open(&config.database_path, &config.store)?;
        let clock = Arc::new(SystemClock::new(config.timezone()?));
        Ok(Self::new(Arc::new(store), clock, config))
    }

    pub fn tenants(&self) -> &TenantResolver {
        &self.tenants
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn queue(&self) -> &OverflowQueue {
        &self.queue
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Decide without touching the send log or the queue.
    pub fn preview(&self, request: &PolicyRequest) -> Decision {
        let sender = request.sender();
        if SenderAddress::parse(sender).is_none() {
            return Decision::Abstain {
                reason: AbstainReason::MalformedSender,
            };
        }

        let Some(tenant) = self.tenants.resolve(sender) else {
            return Decision::Abstain {
                reason: AbstainReason::NoTenant,
            };
        };

        let windows = Windows::at(self.clock.now());
        let hourly_count = self
            .counters
            .count_or_zero(tenant.id, windows.hourly_since, "hourly");
        if hourly_count >= tenant.hourly_limit {
            return Decision::DeferHourly {
                tenant,
                hourly_count,
            };
        }

        let daily_count = self
            .counters
            .count_or_zero(tenant.id, windows.daily_since, "daily");
        if daily_count >= tenant.daily_limit {
            return Decision::DeferDaily {
                tenant,
                hourly_count,
                daily_count,
            };
        }

        Decision::Allow {
            tenant,
            hourly_count,
            daily_count,
        }
    }

    /// Decide and apply the matching side effect. Write failures are logged
    /// and never change the decision.
    pub fn evaluate(&self, request: &PolicyRequest) -> Decision {
        let decision = self.preview(request);
        let (sender, recipient, subject) = (request.sender(), request.recipient(), request.subject());

        match decision {
            Decision::Abstain { reason } => {
                log::debug!("No quota applies to sender {sender:?} ({reason:?})");
            }
            Decision::Allow {
                tenant,
                hourly_count,
                daily_count,
            } => {
                if let Err(e) = self.counters.append_send(tenant.id, sender, recipient, subject) {
                    log::error!("Failed to record send for tenant {}: {e:#}", tenant.id);
                }
                log::info!(
                    "ALLOW tenant={} sender={} recipient={} sasl={} hourly={}/{} daily={}/{}",
                    tenant.id,
                    sender,
                    recipient,
                    request.sasl_username().unwrap_or("-"),
                    hourly_count + 1,
                    tenant.hourly_limit,
                    daily_count + 1,
                    tenant.daily_limit
                );
            }
            Decision::DeferHourly {
                tenant,
                hourly_count,
            } => {
                self.queue.enqueue(tenant.id, sender, recipient, subject);
                log::info!(
                    "DEFER_HOURLY tenant={} sender={} recipient={} hourly={}/{}",
                    tenant.id,
                    sender,
                    recipient,
                    hourly_count,
                    tenant.hourly_limit
                );
            }
            Decision::DeferDaily {
                tenant, daily_count, ..
            } => {
                self.queue.enqueue(tenant.id, sender, recipient, subject);
                log::info!(
                    "DEFER_DAILY tenant={} sender={} recipient={} daily={}/{}",
                    tenant.id,
                    sender,
                    recipient,
                    daily_count,
                    tenant.daily_limit
                );
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::test_support::Fixture;
    use chrono::{NaiveDate, NaiveDateTime};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap()
    }

    fn engine(fixture: &Fixture) -> DecisionEngine {
        DecisionEngine::new(
            Arc::new(fixture.open_store()),
            Arc::new(FixedClock(now())),
            &Config::default(),
        )
    }

    fn request(pairs: &[(&str, &str)]) -> PolicyRequest {
        pairs.iter().copied().collect()
    }

    fn tenant_fixture() -> Fixture {
        let fixture = Fixture::new();
        fixture.add_tenant(7, "example.com");
        fixture
    }

    #[test]
    fn test_allow_under_limit() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:30:00", 3);
        fixture.add_sends(7, "2024-05-01 09:00:00", 17);

        let decision = engine(&fixture).evaluate(&request(&[
            ("sender", "alice@example.com"),
            ("recipient", "bob@x.test"),
        ]));

        assert_eq!(decision.action().to_response(), "action=DUNNO\n\n");
        assert!(matches!(
            decision,
            Decision::Allow {
                hourly_count: 3,
                daily_count: 20,
                ..
            }
        ));
        assert_eq!(fixture.count("email_send_log"), 21);
        assert_eq!(fixture.count("mail_queue"), 0);
    }

    #[test]
    fn test_hourly_exhaustion_queues() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:10:00", 100);

        let decision = engine(&fixture).evaluate(&request(&[
            ("sender", "alice@example.com"),
            ("recipient", "c@x.test"),
            ("subject", "hi"),
        ]));

        assert_eq!(
            decision.action().to_response(),
            "action=DEFER_IF_PERMIT Saatlik mail limiti aşıldı (100/100). Mail kuyruğa alındı.\n\n"
        );
        assert_eq!(fixture.count("email_send_log"), 100);
        let (scheduled_at, status, subject): (String, String, String) = fixture
            .seed
            .query_row("SELECT scheduled_at, status, subject FROM mail_queue", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(scheduled_at, "2024-05-01 16:00:00");
        assert_eq!(status, "pending");
        assert_eq!(subject, "hi");
    }

    #[test]
    fn test_hourly_boundary_row_counts() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:00:00", 99);
        fixture.add_sends(7, "2024-05-01 15:00:00", 1);

        let decision = engine(&fixture).preview(&request(&[("sender", "alice@example.com")]));
        assert!(matches!(decision, Decision::DeferHourly { hourly_count: 100, .. }));
    }

    #[test]
    fn test_daily_exhaustion_hourly_fine() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:45:00", 10);
        fixture.add_sends(7, "2024-05-01 08:00:00", 490);

        let decision = engine(&fixture).evaluate(&request(&[
            ("sender", "alice@example.com"),
            ("recipient", "d@x.test"),
        ]));

        assert_eq!(
            decision.action().to_response(),
            "action=DEFER_IF_PERMIT Günlük mail limiti aşıldı (500/500). Mail kuyruğa alındı.\n\n"
        );
        assert_eq!(fixture.count("mail_queue"), 1);
        assert_eq!(fixture.count("email_send_log"), 500);
    }

    #[test]
    fn test_daily_window_resets_at_midnight() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-04-30 23:59:59", 500);

        let decision = engine(&fixture).preview(&request(&[("sender", "alice@example.com")]));
        assert!(matches!(decision, Decision::Allow { daily_count: 0, .. }));
    }

    #[test]
    fn test_hourly_precedes_daily() {
        let fixture = tenant_fixture();
        fixture.attach_package(7, 1, Some(5), Some(5));
        fixture.add_sends(7, "2024-05-01 14:30:00", 6);

        let decision = engine(&fixture).evaluate(&request(&[("sender", "alice@example.com")]));
        assert_eq!(
            decision.action(),
            PolicyAction::DeferHourly { count: 6, limit: 5 }
        );
        assert_eq!(fixture.count("mail_queue"), 1);
    }

    #[test]
    fn test_unknown_domain_and_malformed_sender_write_nothing() {
        let fixture = tenant_fixture();
        let engine = engine(&fixture);

        for pairs in [
            vec![("sender", "root@nowhere.invalid"), ("recipient", "ops@x.test")],
            vec![("sender", "not-an-email"), ("recipient", "x@x.test")],
            vec![("recipient", "x@x.test")],
            vec![("sender", "")],
        ] {
            let decision = engine.evaluate(&request(&pairs));
            assert!(matches!(decision, Decision::Abstain { .. }), "{pairs:?}");
            assert_eq!(decision.action().to_response(), "action=DUNNO\n\n");
        }

        assert_eq!(fixture.count("email_send_log"), 0);
        assert_eq!(fixture.count("mail_queue"), 0);
    }

    #[test]
    fn test_preview_has_no_side_effects() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:30:00", 100);
        let engine = engine(&fixture);

        let hourly = engine.preview(&request(&[("sender", "alice@example.com")]));
        assert!(matches!(hourly, Decision::DeferHourly { .. }));
        assert_eq!(fixture.count("mail_queue"), 0);
        assert_eq!(fixture.count("email_send_log"), 100);
    }

    #[test]
    fn test_send_log_failure_keeps_allow() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:30:00", 2);
        fixture
            .seed
            .execute_batch(
                "CREATE TRIGGER reject_send BEFORE INSERT ON email_send_log
                 BEGIN SELECT RAISE(ABORT, 'send log is locked'); END;",
            )
            .unwrap();

        let decision = engine(&fixture).evaluate(&request(&[
            ("sender", "alice@example.com"),
            ("recipient", "bob@x.test"),
        ]));

        assert!(matches!(
            decision,
            Decision::Allow {
                hourly_count: 2,
                daily_count: 2,
                ..
            }
        ));
        assert_eq!(decision.action(), PolicyAction::Dunno);
        assert_eq!(decision.action().to_response(), "action=DUNNO\n\n");
        assert_eq!(fixture.count("email_send_log"), 2);
        assert_eq!(fixture.count("mail_queue"), 0);
    }

    #[test]
    fn test_from_config_opens_after_startup_check() {
        let fixture = tenant_fixture();
        let config = Config {
            database_path: fixture.path.to_str().unwrap().to_string(),
            timezone: "UTC".to_string(),
            ..Config::default()
        };

        PolicyStore::check(&config.database_path, &config.store).unwrap();
        let engine = DecisionEngine::from_config(&config).unwrap();
        let decision = engine.evaluate(&request(&[("sender", "alice@example.com")]));
        assert!(matches!(decision, Decision::Allow { .. }));
        assert_eq!(fixture.count("email_send_log"), 1);

        let missing = Config {
            database_path: fixture.dir.path().join("absent.db").to_str().unwrap().to_string(),
            ..Config::default()
        };
        assert!(PolicyStore::check(&missing.database_path, &missing.store).is_err());
        assert!(DecisionEngine::from_config(&missing).is_err());
    }

    #[test]
    fn test_count_failure_fails_open() {
        let fixture = tenant_fixture();
        fixture.add_sends(7, "2024-05-01 14:30:00", 200);
        fixture
            .seed
            .execute_batch("ALTER TABLE email_send_log RENAME TO email_send_log_old;")
            .unwrap();

        let decision = engine(&fixture).evaluate(&request(&[("sender", "alice@example.com")]));
        assert!(matches!(
            decision,
            Decision::Allow {
                hourly_count: 0,
                daily_count: 0,
                ..
            }
        ));
        assert_eq!(decision.action(), PolicyAction::Dunno);
    }
}
