//! Peer records and the checks applied before a peer is admitted

use std::net::Ipv6Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PeerError;

/// Autonomous system number
pub type Asn = u32;

/// Prefix of every tunnel interface name
pub const INTERFACE_PREFIX: &str = "dn";

/// Longest interface name accepted by the kernel (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Length of a base64-encoded WireGuard key
const WIREGUARD_KEY_B64_LEN: usize = 44;

/// One peering relationship: a WireGuard tunnel plus a BGP session
///
/// Missing string fields decode as empty and are rejected by [`Validator`].
/// camelCase field names are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub asn: Asn,
    #[serde(default, alias = "wireguardEndpoint")]
    pub wireguard_endpoint: String,
    #[serde(default, alias = "wireguardLinkLocal")]
    pub wireguard_link_local: String,
    #[serde(default, alias = "wireguardPublicKey")]
    pub wireguard_public_key: String,
}

impl PeerRecord {
    pub fn interface_name(&self) -> String {
        interface_name(self.asn)
    }
}

/// Tunnel interface name for an ASN.
///
/// `dn` followed by the decimal ASN without leading zeros. Decimal
/// formatting is injective, so distinct ASNs never share an interface, and
/// the longest possible name (`dn4294967295`) fits the kernel limit.
pub fn interface_name(asn: Asn) -> String {
    format!("{}{}", INTERFACE_PREFIX, asn)
}

/// Inclusive range of ASNs accepted for peering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Asn, Asn)", into = "(Asn, Asn)")]
pub struct AsnRange {
    pub first: Asn,
    pub last: Asn,
}

impl AsnRange {
    /// dn42 private ASN block
    pub const DN42: AsnRange = AsnRange {
        first: 4_242_420_000,
        last: 4_242_429_999,
    };

    pub fn new(first: Asn, last: Asn) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, asn: Asn) -> bool {
        asn >= self.first && asn <= self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }
}

impl From<(Asn, Asn)> for AsnRange {
    fn from((first, last): (Asn, Asn)) -> Self {
        Self { first, last }
    }
}

impl From<AsnRange> for (Asn, Asn) {
    fn from(range: AsnRange) -> Self {
        (range.first, range.last)
    }
}

/// Field-level validation for peers entering the registry
#[derive(Debug, Clone)]
pub struct Validator {
    asn_ranges: Vec<AsnRange>,
}

impl Validator {
    pub fn new(asn_ranges: Vec<AsnRange>) -> Self {
        Self { asn_ranges }
    }

    pub fn asn_ranges(&self) -> &[AsnRange] {
        &self.asn_ranges
    }

    /// Check every field of a peer, reporting the first one that is wrong
    pub fn validate(&self, peer: &PeerRecord) -> Result<(), PeerError> {
        if !self.is_allowed_asn(peer.asn) {
            return Err(PeerError::invalid(
                "asn",
                format!("AS{} is outside the accepted ranges", peer.asn),
            ));
        }
        if !is_valid_endpoint(&peer.wireguard_endpoint) {
            return Err(PeerError::invalid(
                "wireguard_endpoint",
                format!("expected host:port, got {:?}", peer.wireguard_endpoint),
            ));
        }
        if !is_link_local(&peer.wireguard_link_local) {
            return Err(PeerError::invalid(
                "wireguard_link_local",
                format!(
                    "expected an fe80::/10 address, got {:?}",
                    peer.wireguard_link_local
                ),
            ));
        }
        if !is_valid_public_key(&peer.wireguard_public_key) {
            return Err(PeerError::invalid(
                "wireguard_public_key",
                "expected a base64-encoded 32-byte key",
            ));
        }
        Ok(())
    }

    pub fn is_allowed_asn(&self, asn: Asn) -> bool {
        self.asn_ranges.iter().any(|r| r.contains(asn))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(vec![AsnRange::DN42])
    }
}

/// `host:port` with a non-empty host and a non-zero port; IPv6 hosts must
/// be bracketed
pub fn is_valid_endpoint(endpoint: &str) -> bool {
    if endpoint.is_empty() || endpoint.contains(['/', '?', '#', '@']) {
        return false;
    }
    // The URL parser drops tabs and newlines, but the raw value is what
    // ends up in the rendered config
    if endpoint.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return false;
    }
    let Ok(url) = Url::parse(&format!("wg://{}", endpoint)) else {
        return false;
    };
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => !host.is_empty() && port > 0,
        _ => false,
    }
}

/// IPv6 address inside fe80::/10
pub fn is_link_local(addr: &str) -> bool {
    match addr.parse::<Ipv6Addr>() {
        Ok(ip) => (ip.segments()[0] & 0xffc0) == 0xfe80,
        Err(_) => false,
    }
}

/// Standard base64 encoding of exactly 32 bytes
pub fn is_valid_public_key(key: &str) -> bool {
    if key.len() != WIREGUARD_KEY_B64_LEN {
        return false;
    }
    matches!(BASE64.decode(key), Ok(bytes) if bytes.len() == 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    fn peer() -> PeerRecord {
        PeerRecord {
            asn: 4_242_421_234,
            wireguard_endpoint: "peer.example.net:51820".to_string(),
            wireguard_link_local: "fe80::beef".to_string(),
            wireguard_public_key: KEY.to_string(),
        }
    }

    #[test]
    fn test_interface_name() {
        assert_eq!(interface_name(4_242_421_234), "dn4242421234");
        assert_eq!(interface_name(0), "dn0");
        assert!(interface_name(Asn::MAX).len() <= MAX_INTERFACE_NAME_LEN);
    }

    #[test]
    fn test_endpoints_accepted() {
        for ep in [
            "1.2.3.4:51820",
            "example.com:12345",
            "[::1]:51820",
            "[2001:db8::1]:1",
            "a-b.test:65535",
        ] {
            assert!(is_valid_endpoint(ep), "{} should be valid", ep);
        }
    }

    #[test]
    fn test_endpoints_rejected() {
        for ep in [
            "1.2.3.4",
            "::1:51820",
            "[::1]",
            "example.com:0",
            "example.com:65536",
            ":80",
            "",
            "example.com:80/path",
            "user@example.com:80",
        ] {
            assert!(!is_valid_endpoint(ep), "{} should be invalid", ep);
        }
    }

    #[test]
    fn test_endpoints_with_control_characters_rejected() {
        for ep in [
            "h\nPostUp=touch\tpwned\n.example:51820",
            "peer.example.net\r:51820",
            "peer.example.net:518\t20",
            "\npeer.example.net:51820",
            "peer.example.net:51820\n",
            "peer .example.net:51820",
            "peer.example.net:51820\u{0}",
        ] {
            assert!(!is_valid_endpoint(ep), "{:?} should be invalid", ep);
        }

        let mut injected = peer();
        injected.wireguard_endpoint = "h\nPostUp=touch\tpwned\n.example:51820".to_string();
        assert!(matches!(
            Validator::default().validate(&injected),
            Err(PeerError::InvalidInput {
                field: "wireguard_endpoint",
                ..
            })
        ));
    }

    #[test]
    fn test_link_local() {
        assert!(is_link_local("fe80::1"));
        assert!(is_link_local("febf::1"));
        assert!(!is_link_local("::1"));
        assert!(!is_link_local("fec0::1"));
        assert!(!is_link_local("fe7f::1"));
        assert!(!is_link_local("not-an-ip"));
    }

    #[test]
    fn test_public_key() {
        assert!(is_valid_public_key(KEY));
        assert!(!is_valid_public_key("abc123=="));
        assert!(!is_valid_public_key(&format!("{}==", "A".repeat(42))));
        assert!(!is_valid_public_key(&format!("{}!=", "A".repeat(42))));
    }

    #[test]
    fn test_validator_reports_field() {
        let validator = Validator::default();
        assert!(validator.validate(&peer()).is_ok());

        let mut p = peer();
        p.asn = 64512;
        assert!(matches!(
            validator.validate(&p),
            Err(PeerError::InvalidInput { field: "asn", .. })
        ));

        let mut p = peer();
        p.wireguard_public_key = String::new();
        assert!(matches!(
            validator.validate(&p),
            Err(PeerError::InvalidInput {
                field: "wireguard_public_key",
                ..
            })
        ));
    }

    #[test]
    fn test_dn42_range_bounds() {
        let validator = Validator::default();
        assert!(validator.is_allowed_asn(4_242_420_000));
        assert!(validator.is_allowed_asn(4_242_429_999));
        assert!(!validator.is_allowed_asn(424_242_000));
        assert!(!validator.is_allowed_asn(4_242_431_000));
        assert!(!validator.is_allowed_asn(0));
    }

    #[test]
    fn test_peer_json_field_names() {
        let camel: PeerRecord = serde_json::from_str(
            r#"{"asn": 4242421234, "wireguardEndpoint": "peer.example.net:51820",
                "wireguardLinkLocal": "fe80::beef", "wireguardPublicKey": "k"}"#,
        )
        .unwrap();
        assert_eq!(camel.wireguard_endpoint, "peer.example.net:51820");
        assert_eq!(camel.wireguard_public_key, "k");

        let json = serde_json::to_value(&camel).unwrap();
        assert_eq!(json["wireguard_link_local"], "fe80::beef");

        let sparse: PeerRecord = serde_json::from_str(r#"{"asn": 4242421234}"#).unwrap();
        assert!(sparse.wireguard_endpoint.is_empty());
        assert!(Validator::default().validate(&sparse).is_err());
    }

    #[test]
    fn test_asn_range_serde_as_pair() {
        let range: AsnRange = serde_json::from_str("[64512, 65534]").unwrap();
        assert_eq!(range, AsnRange::new(64512, 65534));
        assert_eq!(serde_json::to_string(&range).unwrap(), "[64512,65534]");
    }

    proptest! {
        #[test]
        fn interface_name_is_injective(a: u32, b: u32) {
            prop_assume!(a != b);
            prop_assert_ne!(interface_name(a), interface_name(b));
        }

        #[test]
        fn interface_name_is_a_valid_ifname(asn: u32) {
            let name = interface_name(asn);
            prop_assert!(name.len() <= MAX_INTERFACE_NAME_LEN);
            prop_assert!(name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
            let parsed: u32 = name.strip_prefix(INTERFACE_PREFIX).unwrap().parse().unwrap();
            prop_assert_eq!(parsed, asn);
        }
    }
}
