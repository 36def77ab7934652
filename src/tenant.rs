use crate::config::LimitsConfig;
use crate::store::PolicyStore;
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::sync::Arc;

/// A `local@domain` sender split on its single `@`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderAddress<'a> {
    pub local: &'a str,
    pub domain: &'a str,
}

impl<'a> SenderAddress<'a> {
    /// Exactly two non-empty parts, otherwise `None`.
    pub fn parse(sender: &'a str) -> Option<Self> {
        let mut parts = sender.split('@');
        let local = parts.next()?;
        let domain = parts.next()?;
        if parts.next().is_some() || local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self { local, domain })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub hourly_limit: i64,
    pub daily_limit: i64,
}

pub struct TenantResolver {
    store: Arc<PolicyStore>,
    defaults: LimitsConfig,
}

impl TenantResolver {
    pub fn new(store: Arc<PolicyStore>, defaults: LimitsConfig) -> Self {
        Self { store, defaults }
    }

    /// `None` means no tenant owns the sender's domain. Lookup errors are
    /// logged and also yield `None`.
    pub fn resolve(&self, sender: &str) -> Option<Tenant> {
        let address = SenderAddress::parse(sender)?;
        match self.lookup_domain(address.domain) {
            Ok(tenant) => tenant,
            Err(e) => {
                log::warn!("Tenant lookup for domain {} failed, allowing: {e:#}", address.domain);
                None
            }
        }
    }

    fn lookup_domain(&self, domain: &str) -> anyhow::Result<Option<Tenant>> {
        let row: Option<(i64, Option<i64>, Option<i64>)> = self.store.read(|conn| {
            conn.query_row(
                "SELECT d.user_id, p.max_emails_per_hour, p.max_emails_per_day
                 FROM domains d
                 LEFT JOIN user_packages up ON up.user_id = d.user_id
                 LEFT JOIN packages p ON p.id = up.package_id
                 WHERE d.name = ?1
                 LIMIT 1",
                [domain],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;

        Ok(row.map(|(id, hourly, daily)| Tenant {
            id,
            hourly_limit: hourly.unwrap_or(self.defaults.default_hourly),
            daily_limit: daily.unwrap_or(self.defaults.default_daily),
        }))
    }

    /// Every tenant owning at least one domain, with effective limits.
    pub fn all_tenants(&self) -> anyhow::Result<Vec<(Tenant, Vec<String>)>> {
        let rows: Vec<(i64, String, Option<i64>, Option<i64>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.user_id, d.name, p.max_emails_per_hour, p.max_emails_per_day
                 FROM domains d
                 LEFT JOIN user_packages up ON up.user_id = d.user_id
                 LEFT JOIN packages p ON p.id = up.package_id
                 ORDER BY d.user_id, d.name",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut tenants: Vec<(Tenant, Vec<String>)> = Vec::new();
        for (id, domain, hourly, daily) in rows {
            // Rows arrive grouped by tenant.
            if let Some((tenant, domains)) = tenants.last_mut() {
                if tenant.id == id {
                    if !domains.contains(&domain) {
                        domains.push(domain);
                    }
                    continue;
                }
            }
            tenants.push((
                Tenant {
                    id,
                    hourly_limit: hourly.unwrap_or(self.defaults.default_hourly),
                    daily_limit: daily.unwrap_or(self.defaults.default_daily),
                },
                vec![domain],
            ));
        }
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::Fixture;

    fn resolver(fixture: &Fixture) -> TenantResolver {
        TenantResolver::new(Arc::new(fixture.open_store()), LimitsConfig::default())
    }

    #[test]
    fn test_sender_address_parse() {
        assert_eq!(
            SenderAddress::parse("alice@example.com"),
            Some(SenderAddress {
                local: "alice",
                domain: "example.com"
            })
        );
        assert_eq!(SenderAddress::parse(""), None);
        assert_eq!(SenderAddress::parse("not-an-email"), None);
        assert_eq!(SenderAddress::parse("@example.com"), None);
        assert_eq!(SenderAddress::parse("alice@"), None);
        assert_eq!(SenderAddress::parse("a@b@c"), None);
    }

    #[test]
    fn test_resolve_with_default_limits() {
        let fixture = Fixture::new();
        fixture.add_tenant(7, "example.com");

        let tenant = resolver(&fixture).resolve("alice@example.com").unwrap();
        assert_eq!(
            tenant,
            Tenant {
                id: 7,
                hourly_limit: 100,
                daily_limit: 500
            }
        );
    }

    #[test]
    fn test_resolve_with_package_limits_and_partial_package() {
        let fixture = Fixture::new();
        fixture.add_tenant(1, "full.test");
        fixture.attach_package(1, 10, Some(5), Some(50));
        fixture.add_tenant(2, "half.test");
        fixture.attach_package(2, 11, None, Some(80));

        let resolver = resolver(&fixture);
        let full = resolver.resolve("x@full.test").unwrap();
        assert_eq!((full.hourly_limit, full.daily_limit), (5, 50));

        let half = resolver.resolve("x@half.test").unwrap();
        assert_eq!((half.hourly_limit, half.daily_limit), (100, 80));
    }

    #[test]
    fn test_resolve_unknown_and_case_sensitive() {
        let fixture = Fixture::new();
        fixture.add_tenant(7, "example.com");

        let resolver = resolver(&fixture);
        assert_eq!(resolver.resolve("root@nowhere.invalid"), None);
        assert_eq!(resolver.resolve("alice@Example.COM"), None);
        assert_eq!(resolver.resolve("not-an-email"), None);
    }

    #[test]
    fn test_all_tenants_groups_domains() {
        let fixture = Fixture::new();
        fixture.add_tenant(3, "b.test");
        fixture.add_tenant(3, "a.test");
        fixture.add_tenant(4, "c.test");
        fixture.attach_package(4, 1, Some(10), Some(20));

        let tenants = resolver(&fixture).all_tenants().unwrap();
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants[0].0.id, 3);
        assert_eq!(tenants[0].1, vec!["a.test".to_string(), "b.test".to_string()]);
        assert_eq!(tenants[1].0.daily_limit, 20);
    }
}
