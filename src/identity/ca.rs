use super::certificate::{EnrollmentCertificate, verify_ed25519};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// An organization's membership authority.
#[async_trait]
pub trait MembershipService: Send + Sync {
    fn organization(&self) -> &str;

    /// Registers a new user and returns its enrollment secret.
    async fn register(&self, username: &str) -> Result<String>;

    /// Exchanges an enrollment secret and a public key for a certificate.
    async fn enroll(
        &self,
        username: &str,
        secret: &str,
        public_key: &[u8],
    ) -> Result<EnrollmentCertificate>;
}

/// In-process ed25519 certificate authority for one organization.
pub struct LocalCertificateAuthority {
    pub ca_id: String,
    organization: String,
    msp_id: String,
    signing_key: SigningKey,
    registered: Arc<RwLock<HashMap<String, String>>>,
    issued: Arc<RwLock<HashMap<String, EnrollmentCertificate>>>,
    enrollments: Arc<AtomicU64>,
}

impl LocalCertificateAuthority {
    pub fn new(organization: impl Into<String>, msp_id: impl Into<String>) -> Self {
        let organization = organization.into();
        let mut csprng = OsRng;
        Self {
            ca_id: format!("ca.{}", organization.to_lowercase()),
            organization,
            msp_id: msp_id.into(),
            signing_key: SigningKey::generate(&mut csprng),
            registered: Arc::new(RwLock::new(HashMap::new())),
            issued: Arc::new(RwLock::new(HashMap::new())),
            enrollments: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bootstraps a user with a known secret, as done for the admin.
    pub async fn add_user(&self, username: &str, secret: &str) {
        self.registered
            .write()
            .await
            .insert(username.to_string(), secret.to_string());
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Checks that a certificate was issued by this authority.
    pub fn verify_certificate(&self, cert: &EnrollmentCertificate) -> bool {
        let Ok(signature) = hex::decode(&cert.signature) else {
            return false;
        };
        cert.issuer == self.ca_id
            && verify_ed25519(&self.public_key(), &cert.tbs_bytes(), &signature)
    }

    pub fn enrollment_count(&self) -> u64 {
        self.enrollments.load(Ordering::Relaxed)
    }

    pub async fn get_certificate(&self, serial: &str) -> Option<EnrollmentCertificate> {
        self.issued.read().await.get(serial).cloned()
    }
}

#[async_trait]
impl MembershipService for LocalCertificateAuthority {
    fn organization(&self) -> &str {
        &self.organization
    }

    async fn register(&self, username: &str) -> Result<String> {
        let mut registered = self.registered.write().await;
        if registered.contains_key(username) {
            return Err(GatewayError::identity(
                username,
                &self.organization,
                "already registered",
            ));
        }
        let mut secret = [0u8; 16];
        OsRng.fill_bytes(&mut secret);
        let secret = hex::encode(secret);
        registered.insert(username.to_string(), secret.clone());
        log::info!("{} registered user {}", self.ca_id, username);
        Ok(secret)
    }

    async fn enroll(
        &self,
        username: &str,
        secret: &str,
        public_key: &[u8],
    ) -> Result<EnrollmentCertificate> {
        self.enrollments.fetch_add(1, Ordering::Relaxed);

        match self.registered.read().await.get(username) {
            Some(expected) if expected == secret => {}
            Some(_) => {
                return Err(GatewayError::identity(
                    username,
                    &self.organization,
                    "invalid enrollment secret",
                ));
            }
            None => {
                return Err(GatewayError::identity(
                    username,
                    &self.organization,
                    "user is not registered",
                ));
            }
        }
        if public_key.len() != 32 {
            return Err(GatewayError::identity(
                username,
                &self.organization,
                "malformed public key",
            ));
        }

        let issued_at = Utc::now();
        let mut cert = EnrollmentCertificate {
            serial: format!("{}-{}", username, issued_at.timestamp_micros()),
            subject: username.to_string(),
            organization: self.organization.clone(),
            msp_id: self.msp_id.clone(),
            issuer: self.ca_id.clone(),
            public_key: hex::encode(public_key),
            issued_at,
            expires_at: issued_at + Duration::days(365),
            signature: String::new(),
        };
        cert.signature = hex::encode(self.signing_key.sign(&cert.tbs_bytes()).to_bytes());

        self.issued
            .write()
            .await
            .insert(cert.serial.clone(), cert.clone());
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[tokio::test]
    async fn enrolls_registered_user() {
        let ca = LocalCertificateAuthority::new("Org1", "Org1MSP");
        ca.add_user("admin", "adminpw").await;
        let signing = key();
        let cert = ca
            .enroll("admin", "adminpw", &signing.verifying_key().to_bytes())
            .await
            .unwrap();

        assert_eq!(cert.subject, "admin");
        assert_eq!(cert.msp_id, "Org1MSP");
        assert!(cert.is_valid());
        assert!(ca.verify_certificate(&cert));
        assert!(ca.get_certificate(&cert.serial).await.is_some());

        let sig = signing.sign(b"proposal").to_bytes();
        assert!(cert.verify(b"proposal", &sig));
        assert!(!cert.verify(b"tampered", &sig));
    }

    #[tokio::test]
    async fn rejects_wrong_secret_and_unknown_user() {
        let ca = LocalCertificateAuthority::new("Org1", "Org1MSP");
        ca.add_user("admin", "adminpw").await;
        let pk = key().verifying_key().to_bytes();

        assert!(ca.enroll("admin", "nope", &pk).await.is_err());
        assert!(ca.enroll("ghost", "x", &pk).await.is_err());
    }

    #[tokio::test]
    async fn register_then_enroll() {
        let ca = LocalCertificateAuthority::new("Org1", "Org1MSP");
        let secret = ca.register("teller").await.unwrap();
        assert!(ca.register("teller").await.is_err());
        let pk = key().verifying_key().to_bytes();
        assert!(ca.enroll("teller", &secret, &pk).await.is_ok());
        assert_eq!(ca.enrollment_count(), 1);
    }
}
