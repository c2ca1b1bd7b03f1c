use super::ca::MembershipService;
use super::Identity;
use crate::error::{GatewayError, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type IdentityKey = (String, String);

/// Enrolls identities against each organization's membership service and
/// keeps at most one per (username, organization) for the process lifetime.
pub struct IdentityManager {
    authorities: HashMap<String, Arc<dyn MembershipService>>,
    secrets: RwLock<HashMap<IdentityKey, String>>,
    cache: RwLock<HashMap<IdentityKey, Arc<Identity>>>,
    enroll_lock: Mutex<()>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self {
            authorities: HashMap::new(),
            secrets: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            enroll_lock: Mutex::new(()),
        }
    }

    pub fn with_authority(mut self, authority: Arc<dyn MembershipService>) -> Self {
        self.authorities
            .insert(authority.organization().to_string(), authority);
        self
    }

    /// Supplies a known enrollment secret, e.g. the bootstrap admin's.
    pub async fn add_credentials(&self, username: &str, organization: &str, secret: &str) {
        self.secrets.write().await.insert(
            (username.to_string(), organization.to_string()),
            secret.to_string(),
        );
    }

    pub async fn get_identity(
        &self,
        username: &str,
        organization: &str,
        register_if_missing: bool,
    ) -> Result<Arc<Identity>> {
        let key = (username.to_string(), organization.to_string());
        if let Some(identity) = self.cache.read().await.get(&key) {
            return Ok(identity.clone());
        }
        if !register_if_missing {
            return Err(GatewayError::identity(
                username,
                organization,
                "no enrolled identity and registration not requested",
            ));
        }

        let _guard = self.enroll_lock.lock().await;
        // Another caller may have enrolled while we waited.
        if let Some(identity) = self.cache.read().await.get(&key) {
            return Ok(identity.clone());
        }

        let identity = Arc::new(self.enroll(username, organization).await?);
        self.cache.write().await.insert(key, identity.clone());
        log::info!(
            "Enrolled {} for {} ({})",
            username,
            organization,
            identity.certificate.serial
        );
        Ok(identity)
    }

    /// Drops the cached identity and enrolls again with the same secret.
    pub async fn reenroll(&self, username: &str, organization: &str) -> Result<Arc<Identity>> {
        let key = (username.to_string(), organization.to_string());
        let _guard = self.enroll_lock.lock().await;
        self.cache.write().await.remove(&key);

        let identity = Arc::new(self.enroll(username, organization).await?);
        self.cache.write().await.insert(key, identity.clone());
        log::info!("Re-enrolled {} for {}", username, organization);
        Ok(identity)
    }

    pub async fn is_cached(&self, username: &str, organization: &str) -> bool {
        self.cache
            .read()
            .await
            .contains_key(&(username.to_string(), organization.to_string()))
    }

    async fn enroll(&self, username: &str, organization: &str) -> Result<Identity> {
        let authority = self.authorities.get(organization).ok_or_else(|| {
            GatewayError::identity(username, organization, "no membership service for organization")
        })?;

        let key = (username.to_string(), organization.to_string());
        let known_secret = self.secrets.read().await.get(&key).cloned();
        let secret = match known_secret {
            Some(secret) => secret,
            None => {
                let secret = authority.register(username).await?;
                self.secrets.write().await.insert(key, secret.clone());
                secret
            }
        };

        let signing_key = SigningKey::generate(&mut OsRng);
        let certificate = authority
            .enroll(username, &secret, &signing_key.verifying_key().to_bytes())
            .await
            .map_err(|e| match e {
                GatewayError::Identity { .. } => e,
                other => GatewayError::identity(username, organization, other.to_string()),
            })?;

        Ok(Identity::new(
            username.to_string(),
            organization.to_string(),
            certificate,
            signing_key,
        ))
    }
}

impl Default for IdentityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EnrollmentCertificate, LocalCertificateAuthority};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthority {
        inner: LocalCertificateAuthority,
        enrolls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MembershipService for CountingAuthority {
        fn organization(&self) -> &str {
            self.inner.organization()
        }

        async fn register(&self, username: &str) -> Result<String> {
            self.inner.register(username).await
        }

        async fn enroll(
            &self,
            username: &str,
            secret: &str,
            public_key: &[u8],
        ) -> Result<EnrollmentCertificate> {
            self.enrolls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::Connection("ca unreachable".into()));
            }
            self.inner.enroll(username, secret, public_key).await
        }
    }

    async fn manager(fail: bool) -> (IdentityManager, Arc<CountingAuthority>) {
        let authority = Arc::new(CountingAuthority {
            inner: LocalCertificateAuthority::new("Org1", "Org1MSP"),
            enrolls: AtomicUsize::new(0),
            fail,
        });
        authority.inner.add_user("admin", "adminpw").await;
        let manager = IdentityManager::new().with_authority(authority.clone());
        manager.add_credentials("admin", "Org1", "adminpw").await;
        (manager, authority)
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let (manager, authority) = manager(false).await;
        let first = manager.get_identity("admin", "Org1", true).await.unwrap();
        let second = manager.get_identity("admin", "Org1", true).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(authority.enrolls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_enroll_once() {
        let (manager, authority) = manager(false).await;
        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_identity("admin", "Org1", true).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(authority.enrolls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_identity_without_registration_fails() {
        let (manager, authority) = manager(false).await;
        let err = manager.get_identity("admin", "Org1", false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Identity);
        assert_eq!(authority.enrolls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_users_are_registered_first() {
        let (manager, _) = manager(false).await;
        let identity = manager.get_identity("teller", "Org1", true).await.unwrap();
        assert_eq!(identity.username, "teller");
        assert_eq!(identity.msp_id(), "Org1MSP");
    }

    #[tokio::test]
    async fn failed_enrollment_is_not_cached_or_retried() {
        let (manager, authority) = manager(true).await;
        let err = manager.get_identity("admin", "Org1", true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Identity);
        assert_eq!(authority.enrolls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_cached("admin", "Org1").await);
    }

    #[tokio::test]
    async fn unknown_organization_fails() {
        let (manager, _) = manager(false).await;
        assert!(manager.get_identity("admin", "Org9", true).await.is_err());
    }

    #[tokio::test]
    async fn reenroll_replaces_cached_identity() {
        let (manager, authority) = manager(false).await;
        let first = manager.get_identity("admin", "Org1", true).await.unwrap();
        let second = manager.reenroll("admin", "Org1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.certificate.public_key, second.certificate.public_key);
        assert_eq!(authority.enrolls.load(Ordering::SeqCst), 2);
    }
}
