//! Self-signed TLS certificate material
//!
//! The control plane serves HTTPS with an ephemeral self-signed ECDSA
//! P-256 certificate generated at boot and held only in memory. Clients
//! are expected to skip chain verification.

use crate::error::{AgentError, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType};
use std::net::{IpAddr, Ipv4Addr};

/// Default certificate lifetime.
pub const DEFAULT_CERT_VALID_DAYS: i64 = 365;

/// DER-encoded certificate and private key.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Generates a fresh self-signed certificate valid for `valid_days`,
/// with SANs for localhost.
pub fn generate_certificate(valid_days: i64) -> Result<TlsMaterial> {
    let mut params = CertificateParams::default();
    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(valid_days);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "lbfeedback");
    params.distinguished_name = dn;
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_string()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    let certificate = Certificate::from_params(params)
        .map_err(|err| AgentError::Config(format!("failed to generate certificate: {err}")))?;
    let cert_der = certificate
        .serialize_der()
        .map_err(|err| AgentError::Config(format!("failed to serialise certificate: {err}")))?;
    let key_der = certificate.serialize_private_key_der();
    Ok(TlsMaterial { cert_der, key_der })
}
