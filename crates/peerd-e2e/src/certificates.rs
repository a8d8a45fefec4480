//! Runtime-generated PKI for API TLS tests

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

/// PEM-encoded certificate and its private key
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Identity {
    /// Certificate followed by key, the layout `reqwest::Identity::from_pem` expects
    pub fn bundle_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }
}

/// A CA with one server and one client certificate, plus a client
/// certificate from an unrelated CA for rejection tests
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,
    pub server: Identity,
    pub client: Identity,
    pub untrusted_client: Identity,
}

struct Authority {
    cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "peerd tests");
    dn
}

fn authority(common_name: &str) -> Authority {
    let key = KeyPair::generate().expect("Failed to generate CA key");
    let mut params = CertificateParams::default();
    params.distinguished_name = name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let cert = params
        .clone()
        .self_signed(&key)
        .expect("Failed to create CA cert");
    Authority {
        cert_pem: cert.pem(),
        issuer: Issuer::new(params, key),
    }
}

fn leaf(
    ca: &Authority,
    common_name: &str,
    sans: Vec<SanType>,
    usage: ExtendedKeyUsagePurpose,
) -> Identity {
    let key = KeyPair::generate().expect("Failed to generate key");
    let mut params = CertificateParams::default();
    params.distinguished_name = name(common_name);
    params.subject_alt_names = sans;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![usage];

    let cert = params
        .signed_by(&key, &ca.issuer)
        .expect("Failed to sign certificate");
    Identity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

impl TestCertificates {
    pub fn generate() -> Self {
        let ca = authority("peerd test CA");
        let rogue = authority("unrelated CA");

        let server = leaf(
            &ca,
            "localhost",
            vec![
                SanType::DnsName("localhost".try_into().expect("valid DNS name")),
                SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ],
            ExtendedKeyUsagePurpose::ServerAuth,
        );
        let client = leaf(&ca, "registry", vec![], ExtendedKeyUsagePurpose::ClientAuth);
        let untrusted_client = leaf(
            &rogue,
            "intruder",
            vec![],
            ExtendedKeyUsagePurpose::ClientAuth,
        );

        Self {
            ca_cert_pem: ca.cert_pem,
            server,
            client,
            untrusted_client,
        }
    }
}
