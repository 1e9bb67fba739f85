//! Ban records: CIDR address bans and certificate-hash bans.

use crate::proto::mumble::ban_list::BanEntry;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A single ban. Matches a connection when the IP falls inside the CIDR
/// prefix or the certificate hash is equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub id: u32,
    pub address: Option<IpAddr>,
    /// Prefix length in 128-bit space (IPv4 prefixes are v6-mapped).
    pub mask: u8,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub reason: String,
    /// Unix seconds.
    pub start: u64,
    /// 0 means permanent.
    pub duration_s: u32,
    pub created_by: Option<String>,
}

fn to_v6_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn prefix_mask(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else if bits >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - bits as u32)
    }
}

impl Ban {
    pub fn expired(&self, now: u64) -> bool {
        self.duration_s != 0 && now >= self.start.saturating_add(u64::from(self.duration_s))
    }

    pub fn matches_ip(&self, ip: &IpAddr) -> bool {
        match self.address {
            Some(banned) => {
                let mask = prefix_mask(self.mask);
                to_v6_bits(&banned) & mask == to_v6_bits(ip) & mask
            }
            None => false,
        }
    }

    pub fn matches_hash(&self, hash: &str) -> bool {
        self.hash.as_deref() == Some(hash)
    }

    pub fn matches(&self, ip: &IpAddr, hash: Option<&str>) -> bool {
        self.matches_ip(ip) || hash.map(|h| self.matches_hash(h)).unwrap_or(false)
    }

    /// Decodes the client's BanList entry. The address field is the 16-byte
    /// v6 form; IPv4 prefixes sent in 32-bit space are lifted to 128.
    pub fn from_entry(id: u32, entry: &BanEntry) -> Option<Self> {
        let octets: [u8; 16] = entry.address.as_slice().try_into().ok()?;
        let v6 = Ipv6Addr::from(octets);
        let address: IpAddr = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };

        let mut mask = entry.mask.min(128) as u8;
        if matches!(address, IpAddr::V4(_)) && mask <= 32 {
            mask += 96;
        }

        Some(Self {
            id,
            address: Some(address),
            mask,
            name: entry.name.clone(),
            hash: entry.hash.clone(),
            reason: entry.reason.clone().unwrap_or_default(),
            start: unix_now(),
            duration_s: entry.duration.unwrap_or(0),
            created_by: None,
        })
    }

    pub fn to_entry(&self) -> BanEntry {
        let address = match self.address {
            Some(IpAddr::V4(v4)) => v4.to_ipv6_mapped().octets().to_vec(),
            Some(IpAddr::V6(v6)) => v6.octets().to_vec(),
            None => vec![0u8; 16],
        };

        BanEntry {
            address,
            mask: u32::from(self.mask),
            name: self.name.clone(),
            hash: self.hash.clone(),
            reason: Some(self.reason.clone()),
            start: None,
            duration: Some(self.duration_s),
        }
    }
}

/// Checks an incoming connection against a ban list, skipping expired bans.
pub fn find_match<'a>(bans: &'a [Ban], ip: &IpAddr, hash: Option<&str>) -> Option<&'a Ban> {
    let now = unix_now();
    bans.iter().find(|ban| !ban.expired(now) && ban.matches(ip, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn cidr_ban(address: &str, mask: u8) -> Ban {
        Ban {
            id: 1,
            address: Some(ip(address)),
            mask,
            name: None,
            hash: None,
            reason: "test".to_string(),
            start: unix_now(),
            duration_s: 0,
            created_by: None,
        }
    }

    #[test]
    fn exact_v4_match() {
        let ban = cidr_ban("192.168.1.10", 128);
        assert!(ban.matches_ip(&ip("192.168.1.10")));
        assert!(!ban.matches_ip(&ip("192.168.1.11")));
    }

    #[test]
    fn v4_prefix_match() {
        // /24 in v6-mapped space
        let ban = cidr_ban("10.0.0.0", 96 + 24);
        assert!(ban.matches_ip(&ip("10.0.0.77")));
        assert!(!ban.matches_ip(&ip("10.0.1.1")));
    }

    #[test]
    fn v6_prefix_match() {
        let ban = cidr_ban("2001:db8::", 32);
        assert!(ban.matches_ip(&ip("2001:db8::1")));
        assert!(!ban.matches_ip(&ip("2001:db9::1")));
    }

    #[test]
    fn zero_mask_matches_everything() {
        let ban = cidr_ban("0.0.0.0", 0);
        assert!(ban.matches_ip(&ip("8.8.8.8")));
        assert!(ban.matches_ip(&ip("2001:db8::1")));
    }

    #[test]
    fn hash_ban_without_address() {
        let ban = Ban {
            id: 1,
            address: None,
            mask: 0,
            name: None,
            hash: Some("deadbeef".to_string()),
            reason: String::new(),
            start: unix_now(),
            duration_s: 0,
            created_by: None,
        };
        assert!(!ban.matches_ip(&ip("1.2.3.4")));
        assert!(ban.matches(&ip("1.2.3.4"), Some("deadbeef")));
        assert!(!ban.matches(&ip("1.2.3.4"), Some("feedface")));
    }

    #[test]
    fn expiry() {
        let mut ban = cidr_ban("1.2.3.4", 128);
        ban.start = unix_now() - 100;
        ban.duration_s = 50;
        assert!(ban.expired(unix_now()));

        ban.duration_s = 0;
        assert!(!ban.expired(unix_now()));

        assert!(find_match(&[ban.clone()], &ip("1.2.3.4"), None).is_some());
    }

    #[test]
    fn entry_roundtrip_lifts_v4_mask() {
        let ban = cidr_ban("10.1.0.0", 96 + 16);
        let entry = ban.to_entry();
        // the wire form is always 16 bytes
        assert_eq!(entry.address.len(), 16);

        let back = Ban::from_entry(1, &entry).unwrap();
        assert_eq!(back.address, ban.address);
        assert_eq!(back.mask, ban.mask);
    }
}
