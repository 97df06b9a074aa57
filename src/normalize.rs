//! Asset → [`EndpointCandidate`] normalization, ported from
//! `internal/derperer/map.go`'s `addDerpEndpoint` and `derperer/map.go`'s
//! `buildNode`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use trust_dns_resolver::TokioAsyncResolver;
use url::Host;

use crate::assets::Asset;
use crate::error::NormalizeError;
use crate::registry::EndpointCandidate;

/// Resolves hostnames via the system's configured resolver. A single
/// instance is shared across normalization calls; `trust-dns-resolver`'s
/// resolver is internally cheap to clone and safe to share.
pub struct Normalizer {
    resolver: TokioAsyncResolver,
}

impl Normalizer {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }

    #[cfg(test)]
    fn unused_for_ip_literal_tests() -> Self {
        // IP-literal assets never reach the resolver, so tests that only
        // exercise that path can construct a resolver from an empty
        // config without needing a live system config.
        use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::new(), ResolverOpts::default())
                .expect("building a resolver from an empty config cannot fail"),
        }
    }

    pub async fn normalize(&self, asset: &Asset) -> Result<EndpointCandidate, NormalizeError> {
        let port: u16 = asset
            .port
            .parse()
            .map_err(|_| NormalizeError::BadPort(asset.port.clone()))?;

        let host = asset.origin.host().ok_or(NormalizeError::NoHostname)?;

        // `Url::host_str` would return an IPv6 literal bracketed
        // (`"[2001:db8::1]"`), which never re-parses as an `IpAddr`; matching
        // on the parsed `url::Host` instead keeps the literal-vs-DNS branch
        // reachable for both address families.
        let (hostname, ipv4, ipv6, insecure) = match host {
            Host::Ipv4(v4) => (v4.to_string(), Some(v4), None, true),
            Host::Ipv6(v6) => (v6.to_string(), None, Some(v6), true),
            Host::Domain(domain) => {
                let domain = domain.to_string();
                let (v4, v6) = self.resolve(&domain).await?;
                if v4.is_none() && v6.is_none() {
                    return Err(NormalizeError::NoAddress(domain));
                }
                (domain, v4, v6, false)
            }
        };

        Ok(EndpointCandidate {
            name: label(asset),
            host: hostname,
            port,
            ipv4,
            ipv6,
            insecure,
        })
    }

    async fn resolve(&self, host: &str) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), NormalizeError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|err| NormalizeError::Dns {
                host: host.to_string(),
                source: err.into(),
            })?;

        let mut ipv4 = None;
        let mut ipv6 = None;
        for ip in lookup.iter() {
            match ip {
                IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(v4),
                IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(v6),
                _ => {}
            }
        }
        Ok((ipv4, ipv6))
    }
}

/// Composes `{country}-{region}-{city}-{as_organization}-{ip}`, eliding
/// segments that are blank, ported from the Go original's repeated
/// `code += fmt.Sprintf("-%s", ...)` concatenation.
fn label(asset: &Asset) -> String {
    let mut parts = vec![asset.raw_field("country").to_string()];
    for key in ["region", "city", "as_organization"] {
        let value = asset.raw_field(key);
        if !value.is_empty() {
            parts.push(value.to_string());
        }
    }
    parts.push(asset.ip.clone());
    parts.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use url::Url;

    fn asset(fields: &[(&str, &str)], ip: &str, port: &str, origin: &str) -> Asset {
        let mut raw = HashMap::new();
        for (k, v) in fields {
            raw.insert(k.to_string(), v.to_string());
        }
        Asset {
            ip: ip.to_string(),
            port: port.to_string(),
            origin: Url::parse(origin).unwrap(),
            raw,
        }
    }

    #[tokio::test]
    async fn ip_literal_asset_is_marked_insecure_and_self_resolved() {
        let normalizer = Normalizer::unused_for_ip_literal_tests();
        let a = asset(&[], "1.2.3.4", "443", "https://1.2.3.4");
        let candidate = normalizer.normalize(&a).await.unwrap();
        assert!(candidate.insecure);
        assert_eq!(candidate.host, "1.2.3.4");
        assert_eq!(candidate.ipv4, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(candidate.ipv6, None);
    }

    #[tokio::test]
    async fn ipv6_literal_asset_is_marked_insecure_and_self_resolved() {
        let normalizer = Normalizer::unused_for_ip_literal_tests();
        let a = asset(&[], "2001:db8::1", "443", "https://[2001:db8::1]");
        let candidate = normalizer.normalize(&a).await.unwrap();
        assert!(candidate.insecure);
        assert_eq!(candidate.host, "2001:db8::1");
        assert_eq!(candidate.ipv4, None);
        assert_eq!(candidate.ipv6, Some("2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent_via_the_registry_not_the_normalizer() {
        // The Normalizer itself is pure (modulo DNS) and has no dedup
        // state; idempotence on repeated identical assets is a Registry
        // property, exercised in registry::tests.
        let normalizer = Normalizer::unused_for_ip_literal_tests();
        let a = asset(&[], "1.2.3.4", "443", "https://1.2.3.4");
        let first = normalizer.normalize(&a).await.unwrap();
        let second = normalizer.normalize(&a).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn label_composes_country_region_city_org_ip_eliding_blanks() {
        let a = asset(
            &[
                ("country", "US"),
                ("region", "CA"),
                ("city", "SF"),
                ("as_organization", "ACME"),
            ],
            "9.9.9.9",
            "443",
            "https://relay.example",
        );
        assert_eq!(label(&a), "US-CA-SF-ACME-9.9.9.9");
    }

    #[test]
    fn label_elides_blank_segments() {
        let a = asset(&[("country", "US")], "9.9.9.9", "443", "https://relay.example");
        assert_eq!(label(&a), "US-9.9.9.9");
    }

    #[tokio::test]
    async fn bad_port_is_skipped() {
        let normalizer = Normalizer::unused_for_ip_literal_tests();
        let a = asset(&[], "1.2.3.4", "not-a-port", "https://1.2.3.4");
        assert!(matches!(
            normalizer.normalize(&a).await,
            Err(NormalizeError::BadPort(_))
        ));
    }
}
