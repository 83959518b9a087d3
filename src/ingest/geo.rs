use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const UNKNOWN: &str = "Unknown";

/// Address used when the request carries no forwarded-for header.
pub const FALLBACK_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Country and city of the reporting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub city: String,
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
        }
    }
}

/// IP-to-location lookup.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// Resolver that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeoResolver;

impl GeoResolver for NoopGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<GeoLocation> {
        None
    }
}

#[derive(Debug, Clone)]
struct CidrEntry {
    network: IpAddr,
    prefix: u8,
    location: GeoLocation,
}

impl CidrEntry {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Static table of `cidr,country,city` rows. The longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct CidrGeoResolver {
    entries: Vec<CidrEntry>,
}

impl CidrGeoResolver {
    /// Loads a table from a CSV file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading geo table {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing geo table {}", path.display()))
    }

    /// Parses table text. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.splitn(3, ',').map(str::trim);
            let (Some(cidr), Some(country)) = (fields.next(), fields.next()) else {
                bail!("line {}: expected cidr,country[,city]", lineno + 1);
            };
            let city = fields.next().filter(|c| !c.is_empty()).unwrap_or(UNKNOWN);

            let (network, prefix) =
                parse_cidr(cidr).with_context(|| format!("line {}", lineno + 1))?;

            entries.push(CidrEntry {
                network,
                prefix,
                location: GeoLocation {
                    country: country.to_string(),
                    city: city.to_string(),
                },
            });
        }

        // Longest prefix first so the first hit is the most specific.
        entries.sort_by(|a, b| b.prefix.cmp(&a.prefix));

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoResolver for CidrGeoResolver {
    fn resolve(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.entries
            .iter()
            .find(|e| e.contains(ip))
            .map(|e| e.location.clone())
    }
}

fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };
    let network: IpAddr = addr
        .parse()
        .with_context(|| format!("invalid address {addr:?}"))?;
    let max = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().with_context(|| format!("invalid prefix {p:?}"))?,
        None => max,
    };
    if prefix > max {
        bail!("prefix /{prefix} too long for {network}");
    }
    Ok((network, prefix))
}

/// Caller address from the first `X-Forwarded-For` entry, else loopback.
pub fn client_ip(forwarded_for: Option<&str>) -> IpAddr {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(FALLBACK_IP)
}

/// Resolves a caller, substituting `"Unknown"` when nothing matches.
pub fn locate(resolver: &dyn GeoResolver, ip: IpAddr) -> GeoLocation {
    resolver.resolve(ip).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "
# cidr,country,city
10.0.0.0/8, US, Ashburn
10.1.0.0/16, DE, Berlin
2001:db8::/32, NL,
192.0.2.7, FR, Paris
";

    #[test]
    fn test_longest_prefix_wins() {
        let geo = CidrGeoResolver::parse(TABLE).expect("parse");
        assert_eq!(geo.len(), 4);

        let hit = geo.resolve("10.1.2.3".parse().expect("ip")).expect("hit");
        assert_eq!((hit.country.as_str(), hit.city.as_str()), ("DE", "Berlin"));

        let hit = geo.resolve("10.9.9.9".parse().expect("ip")).expect("hit");
        assert_eq!(hit.country, "US");

        let hit = geo.resolve("192.0.2.7".parse().expect("ip")).expect("hit");
        assert_eq!(hit.city, "Paris");

        let hit = geo.resolve("2001:db8::1".parse().expect("ip")).expect("hit");
        assert_eq!((hit.country.as_str(), hit.city.as_str()), ("NL", "Unknown"));

        assert!(geo.resolve("8.8.8.8".parse().expect("ip")).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_rows() {
        assert!(CidrGeoResolver::parse("10.0.0.0/33,US,X").is_err());
        assert!(CidrGeoResolver::parse("nonsense,US").is_err());
        assert!(CidrGeoResolver::parse("10.0.0.0/8").is_err());
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let geo = CidrGeoResolver::parse("0.0.0.0/0,ZZ,Anywhere").expect("parse");
        assert_eq!(geo.resolve("203.0.113.9".parse().expect("ip")).expect("hit").country, "ZZ");
    }

    #[test]
    fn test_client_ip_from_forwarded_for() {
        assert_eq!(client_ip(Some("203.0.113.5, 10.0.0.1")), "203.0.113.5".parse::<IpAddr>().expect("ip"));
        assert_eq!(client_ip(Some("garbage")), FALLBACK_IP);
        assert_eq!(client_ip(None), FALLBACK_IP);
    }

    #[test]
    fn test_locate_degrades_to_unknown() {
        assert_eq!(locate(&NoopGeoResolver, FALLBACK_IP), GeoLocation::default());
    }
}
