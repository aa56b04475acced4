//! TLS trust decisions.
//!
//! The cache only decides *whether* a server certificate chain is acceptable;
//! the transport owns the mechanism.

use std::fmt;

/// Decides whether a certificate chain that platform verification would
/// reject is accepted anyway.
pub trait TrustPolicy: Send + Sync + fmt::Debug {
    /// `certificate_chain` holds DER-encoded certificates, leaf first. An
    /// empty chain asks whether the policy trusts unconditionally.
    fn should_trust(&self, certificate_chain: &[Vec<u8>]) -> bool;
}

/// Platform verification only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformTrust;

impl TrustPolicy for PlatformTrust {
    fn should_trust(&self, _certificate_chain: &[Vec<u8>]) -> bool {
        false
    }
}

/// Accept every chain. Only for development servers with self-signed certificates.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAnyCertificate;

impl TrustPolicy for TrustAnyCertificate {
    fn should_trust(&self, _certificate_chain: &[Vec<u8>]) -> bool {
        true
    }
}

/// The policy selected by the `trust_any_ssl_certificate` setting.
pub fn policy_for(trust_any_ssl_certificate: bool) -> Box<dyn TrustPolicy> {
    if trust_any_ssl_certificate { Box::new(TrustAnyCertificate) } else { Box::new(PlatformTrust) }
}
