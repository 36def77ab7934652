//! Per-tenant quota usage, read-only.

use crate::counters::Windows;
use crate::engine::DecisionEngine;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TenantUsage {
    pub tenant_id: i64,
    pub domains: Vec<String>,
    pub hourly_count: i64,
    pub hourly_limit: i64,
    pub daily_count: i64,
    pub daily_limit: i64,
    pub pending_queue: i64,
}

impl TenantUsage {
    pub fn over_quota(&self) -> bool {
        self.hourly_count >= self.hourly_limit || self.daily_count >= self.daily_limit
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub generated_at: String,
    pub tenants: Vec<TenantUsage>,
}

impl UsageReport {
    pub fn collect(engine: &DecisionEngine) -> anyhow::Result<Self> {
        let now = engine.clock().now();
        let windows = Windows::at(now);
        let mut tenants = Vec::new();

        for (tenant, domains) in engine.tenants().all_tenants()? {
            tenants.push(TenantUsage {
                tenant_id: tenant.id,
                domains,
                hourly_count: engine.counters().count_since(tenant.id, windows.hourly_since)?,
                hourly_limit: tenant.hourly_limit,
                daily_count: engine.counters().count_since(tenant.id, windows.daily_since)?,
                daily_limit: tenant.daily_limit,
                pending_queue: engine.queue().pending_count(tenant.id)?,
            });
        }

        Ok(Self {
            generated_at: crate::clock::format_timestamp(now),
            tenants,
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Quota usage at {}\n", self.generated_at));
        if self.tenants.is_empty() {
            out.push_str("No tenants with domains found\n");
            return out;
        }

        out.push_str(&format!(
            "{:>8}  {:<32}  {:>11}  {:>11}  {:>7}\n",
            "TENANT", "DOMAINS", "HOURLY", "DAILY", "QUEUED"
        ));
        for usage in &self.tenants {
            out.push_str(&format!(
                "{:>8}  {:<32}  {:>11}  {:>11}  {:>7}{}\n",
                usage.tenant_id,
                truncate_string(&usage.domains.join(","), 32),
                format!("{}/{}", usage.hourly_count, usage.hourly_limit),
                format!("{}/{}", usage.daily_count, usage.daily_limit),
                usage.pending_queue,
                if usage.over_quota() { "  *" } else { "" }
            ));
        }
        out
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::Config;
    use crate::store::test_support::Fixture;
    use chrono::NaiveDate;
    use std::sync::Arc;

    #[test]
    fn test_collect_usage() {
        let fixture = Fixture::new();
        fixture.add_tenant(7, "example.com");
        fixture.add_tenant(8, "other.test");
        fixture.attach_package(8, 1, Some(2), Some(10));
        fixture.add_sends(7, "2024-05-01 14:30:00", 3);
        fixture.add_sends(7, "2024-05-01 01:00:00", 4);
        fixture.add_sends(8, "2024-05-01 14:59:00", 2);

        let now = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        let engine = DecisionEngine::new(
            Arc::new(fixture.open_store()),
            Arc::new(FixedClock(now)),
            &Config::default(),
        );
        engine.queue().enqueue(8, "a@other.test", "b@x.test", "");

        let report = UsageReport::collect(&engine).unwrap();
        assert_eq!(report.tenants.len(), 2);

        let first = &report.tenants[0];
        assert_eq!((first.hourly_count, first.daily_count), (3, 7));
        assert_eq!((first.hourly_limit, first.daily_limit), (100, 500));
        assert!(!first.over_quota());

        let second = &report.tenants[1];
        assert_eq!(second.pending_queue, 1);
        assert!(second.over_quota());

        let text = report.to_text();
        assert!(text.contains("example.com"));
        assert!(text.contains("2/2"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["tenants"][0]["tenant_id"], 7);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a-very-long-domain-list", 10), "a-very-...");
    }
}
