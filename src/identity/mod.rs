pub mod ca;
pub mod certificate;
pub mod manager;

pub use ca::{LocalCertificateAuthority, MembershipService};
pub use certificate::EnrollmentCertificate;
pub use manager::IdentityManager;

use ed25519_dalek::{Signer, SigningKey};
use std::fmt;

/// An enrolled user of one organization, able to sign proposals.
pub struct Identity {
    pub username: String,
    pub organization: String,
    pub certificate: EnrollmentCertificate,
    signing_key: SigningKey,
}

impl Identity {
    pub fn new(
        username: String,
        organization: String,
        certificate: EnrollmentCertificate,
        signing_key: SigningKey,
    ) -> Self {
        Self {
            username,
            organization,
            certificate,
            signing_key,
        }
    }

    pub fn msp_id(&self) -> &str {
        &self.certificate.msp_id
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("organization", &self.organization)
            .field("msp_id", &self.certificate.msp_id)
            .field("serial", &self.certificate.serial)
            .finish()
    }
}
