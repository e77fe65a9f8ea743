//! User secrets, wrapped with AES-256-GCM under a process master key.
//!
//! Plaintext never touches persistent storage and never crosses the HTTP
//! boundary except through the owner-scoped read endpoints; every access
//! to plaintext writes an audit row first.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::SecretsConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{SecretAction, SecretAuditRow, SecretRow};
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};

/// Current wrap scheme tag. Bumped whenever the envelope layout or cipher
/// changes; rotation rewraps older rows onto it.
pub const WRAP_SCHEME: &str = "aes-256-gcm.v1";

const NONCE_LEN: usize = 12;

/// Who performed a secret access, recorded in the audit trail.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub actor: String,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn user(user_id: Uuid) -> Self {
        Self {
            actor: format!("user:{user_id}"),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn execution(execution_id: Uuid) -> Self {
        Self {
            actor: format!("execution:{execution_id}"),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn system(tag: &str) -> Self {
        Self {
            actor: format!("system:{tag}"),
            ..Self::default()
        }
    }
}

pub struct SecretsService {
    database: Arc<Database>,
    cipher: Aes256Gcm,
    rotation_batch_size: usize,
}

impl SecretsService {
    pub fn new(database: Arc<Database>, config: &SecretsConfig) -> anyhow::Result<Self> {
        let key = hex::decode(config.master_key.expose())
            .map_err(|_| anyhow::anyhow!("secrets.master_key is not valid hex"))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("secrets.master_key must be 32 bytes"))?;

        Ok(Self {
            database,
            cipher,
            rotation_batch_size: config.rotation_batch_size,
        })
    }

    #[instrument(level = "debug", skip(self, value, actor))]
    pub async fn create(
        &self,
        owner_id: Uuid,
        name: &str,
        value: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &Actor,
    ) -> ServiceResult<SecretRow> {
        if name.is_empty() || name.len() > 256 {
            return Err(ServiceError::invalid("secret name must be 1-256 characters"));
        }

        let wrapped = self.wrap(value.as_bytes())?;

        let row = self
            .database
            .pool
            .insert_secret(
                Uuid::new_v4(),
                owner_id,
                name,
                &wrapped,
                WRAP_SCHEME,
                description,
                expires_at,
            )
            .await
            .map_err(|err| {
                if err.is_unique_violation() {
                    ServiceError::conflict(format!("secret {name:?} already exists"))
                } else {
                    err.into()
                }
            })?;

        self.audit(row.id, actor, SecretAction::Create).await?;

        Ok(row)
    }

    #[instrument(level = "debug", skip(self, value, actor))]
    pub async fn update(
        &self,
        owner_id: Uuid,
        id: Uuid,
        value: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &Actor,
    ) -> ServiceResult<SecretRow> {
        let row = self.get_owned(owner_id, id).await?;

        let wrapped = self.wrap(value.as_bytes())?;

        self.database
            .pool
            .update_secret_blob(row.id, &wrapped, WRAP_SCHEME, description, expires_at)
            .await?;

        self.audit(row.id, actor, SecretAction::Update).await?;

        self.get_owned(owner_id, id).await
    }

    #[instrument(level = "debug", skip(self, actor))]
    pub async fn delete(&self, owner_id: Uuid, id: Uuid, actor: &Actor) -> ServiceResult<()> {
        let row = self.get_owned(owner_id, id).await?;

        // The audit row must survive the secret row, so write it first.
        self.audit(row.id, actor, SecretAction::Delete).await?;
        self.database.pool.delete_secret(row.id).await?;

        Ok(())
    }

    /// Metadata only; the wrapped blob stays inside this module.
    pub async fn get_metadata(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<SecretRow> {
        self.get_owned(owner_id, id).await
    }

    pub async fn list(
        &self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> ServiceResult<Vec<SecretRow>> {
        Ok(self.database.pool.list_secrets(owner_id, offset, limit).await?)
    }

    pub async fn audit_log(
        &self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> ServiceResult<Vec<SecretAuditRow>> {
        Ok(self
            .database
            .pool
            .list_secret_audit(owner_id, offset, limit)
            .await?)
    }

    /// Owner-scoped plaintext read (one of the two HTTP paths to
    /// plaintext).
    #[instrument(level = "debug", skip(self, actor))]
    pub async fn reveal(
        &self,
        owner_id: Uuid,
        id: Uuid,
        actor: &Actor,
    ) -> ServiceResult<Zeroizing<String>> {
        let row = self.get_owned(owner_id, id).await?;
        self.plaintext_of(&row, actor).await
    }

    /// The by-name twin of [`reveal`](Self::reveal).
    #[instrument(level = "debug", skip(self, actor))]
    pub async fn reveal_by_name(
        &self,
        owner_id: Uuid,
        name: &str,
        actor: &Actor,
    ) -> ServiceResult<(SecretRow, Zeroizing<String>)> {
        let row = self
            .database
            .pool
            .get_secret_by_name(owner_id, name)
            .await?
            .ok_or_else(|| ServiceError::not_found("secret does not exist"))?;

        let plaintext = self.plaintext_of(&row, actor).await?;

        Ok((row, plaintext))
    }

    /// The sandbox broker: resolves a declared secret name for a running
    /// execution. Undeclared names fail with `forbidden` without touching
    /// the secret.
    #[instrument(level = "debug", skip(self, declared_names, actor))]
    pub async fn brokered_fetch(
        &self,
        owner_id: Uuid,
        name: &str,
        declared_names: &[String],
        actor: &Actor,
    ) -> ServiceResult<Zeroizing<String>> {
        if !declared_names.iter().any(|n| n == name) {
            return Err(ServiceError::forbidden(format!(
                "secret {name:?} is not declared by this function"
            )));
        }

        let row = self
            .database
            .pool
            .get_secret_by_name(owner_id, name)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("secret {name:?} does not exist")))?;

        self.plaintext_of(&row, actor).await
    }

    /// Rewraps one batch of secrets that are not on the current scheme.
    /// Returns how many were rewrapped; zero means rotation is complete.
    #[instrument(level = "info", skip(self, actor))]
    pub async fn rotate_batch(&self, actor: &Actor) -> ServiceResult<usize> {
        let stale = self
            .database
            .pool
            .list_secrets_not_on_scheme(WRAP_SCHEME, self.rotation_batch_size as i64)
            .await?;

        let mut rotated = 0;
        for row in stale {
            let plaintext = match self.unwrap(&row.wrapped_blob, &row.wrap_scheme) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    warn!(secret = %row.id, scheme = %row.wrap_scheme, ?err,
                        "Cannot unwrap secret for rotation, skipping");
                    continue;
                }
            };

            let rewrapped = self.wrap(&plaintext)?;

            self.database
                .pool
                .update_secret_blob(
                    row.id,
                    &rewrapped,
                    WRAP_SCHEME,
                    &row.description,
                    row.expires_at,
                )
                .await?;

            self.audit(row.id, actor, SecretAction::Rotate).await?;
            rotated += 1;
        }

        if rotated > 0 {
            info!(rotated, "Rewrapped secrets onto {WRAP_SCHEME}");
        }

        Ok(rotated)
    }

    async fn get_owned(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<SecretRow> {
        let row = self
            .database
            .pool
            .get_secret(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("secret does not exist"))?;

        if row.owner_id != owner_id {
            // Cross-tenant probes see the same response as a missing row.
            return Err(ServiceError::not_found("secret does not exist"));
        }

        Ok(row)
    }

    async fn plaintext_of(
        &self,
        row: &SecretRow,
        actor: &Actor,
    ) -> ServiceResult<Zeroizing<String>> {
        if let Some(expires_at) = row.expires_at {
            if expires_at < Utc::now() {
                return Err(ServiceError::not_found(format!(
                    "secret {:?} has expired",
                    row.name
                )));
            }
        }

        // Audit is written before the plaintext leaves this module.
        self.audit(row.id, actor, SecretAction::Read).await?;

        let plaintext = self.unwrap(&row.wrapped_blob, &row.wrap_scheme)?;
        let plaintext = String::from_utf8(plaintext.to_vec())
            .map_err(|_| ServiceError::internal("secret plaintext is not valid UTF-8"))?;

        Ok(Zeroizing::new(plaintext))
    }

    async fn audit(&self, secret_id: Uuid, actor: &Actor, action: SecretAction) -> ServiceResult<()> {
        self.database
            .pool
            .insert_secret_audit(
                secret_id,
                &actor.actor,
                action,
                actor.source_ip.as_deref(),
                actor.user_agent.as_deref(),
            )
            .await?;

        Ok(())
    }

    fn wrap(&self, plaintext: &[u8]) -> ServiceResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ServiceError::internal("failed to wrap secret"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(blob)
    }

    fn unwrap(&self, blob: &[u8], scheme: &str) -> ServiceResult<Zeroizing<Vec<u8>>> {
        if scheme != WRAP_SCHEME {
            return Err(ServiceError::internal(format!(
                "unsupported wrap scheme {scheme:?}"
            )));
        }

        if blob.len() < NONCE_LEN {
            return Err(ServiceError::internal("wrapped secret blob is truncated"));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ServiceError::internal("failed to unwrap secret"))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn cipher_only() -> SecretsService {
        // A service with a dead pool is enough to exercise the envelope.
        let pool = sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
            .connect_lazy("postgres://localhost/never_connected")
            .unwrap();

        SecretsService {
            database: Arc::new(Database { pool }),
            cipher: Aes256Gcm::new_from_slice(&[7u8; 32]).unwrap(),
            rotation_batch_size: 10,
        }
    }

    #[tokio::test]
    async fn wrap_unwrap_round_trip() {
        let service = cipher_only();

        let blob = service.wrap(b"hunter2").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"hunter2".as_slice());

        let plaintext = service.unwrap(&blob, WRAP_SCHEME).unwrap();
        assert_eq!(plaintext.as_slice(), b"hunter2");
    }

    #[tokio::test]
    async fn wrapping_is_nonce_randomised() {
        let service = cipher_only();

        let a = service.wrap(b"value").unwrap();
        let b = service.wrap(b"value").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tampered_blob_fails() {
        let service = cipher_only();

        let mut blob = service.wrap(b"value").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;

        assert!(service.unwrap(&blob, WRAP_SCHEME).is_err());
    }

    #[tokio::test]
    async fn unknown_scheme_fails() {
        let service = cipher_only();

        let blob = service.wrap(b"value").unwrap();
        let err = service.unwrap(&blob, "aes-256-gcm.v0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn undeclared_secret_is_forbidden_without_db_access() {
        let service = cipher_only();

        let err = service
            .brokered_fetch(
                Uuid::new_v4(),
                "api_key",
                &["other".to_string()],
                &Actor::execution(Uuid::new_v4()),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Forbidden);
    }
}
