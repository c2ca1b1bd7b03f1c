use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Enrollment certificate issued by an organization's membership service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCertificate {
    pub serial: String,
    pub subject: String,
    pub organization: String,
    pub msp_id: String,
    pub issuer: String,
    /// Hex-encoded ed25519 public key of the subject.
    pub public_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hex-encoded issuer signature over [`EnrollmentCertificate::tbs_bytes`].
    pub signature: String,
}

impl EnrollmentCertificate {
    pub fn is_valid(&self) -> bool {
        !self.signature.is_empty() && self.expires_at > Utc::now()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// The signed portion of the certificate.
    pub fn tbs_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.serial,
            self.subject,
            self.organization,
            self.msp_id,
            self.issuer,
            self.public_key,
            self.issued_at.timestamp(),
            self.expires_at.timestamp()
        )
        .into_bytes()
    }

    /// Serialized form used as the transaction creator.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(self.encode()))
    }

    /// Checks a signature produced by the certificate's subject.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_ed25519(&self.public_key, message, signature)
    }
}

pub(crate) fn verify_ed25519(public_key_hex: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(sig_array) = <&[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(sig_array)).is_ok()
}
