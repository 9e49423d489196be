//! Per-tenant carrier credentials, encrypted at rest.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::CollaboratorError;
use crate::db::credential_repo::{self, CredentialRow};
use crate::db::{now_timestamp, Database};
use crate::model::CarrierCredentials;
use crate::secrets::CredentialCipher;

/// Hands out decrypted portal credentials. The engine never persists the
/// plaintext it receives.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credentials(
        &self,
        tenant_id: &str,
        carrier_code: &str,
    ) -> Result<CarrierCredentials, CollaboratorError>;
}

/// SQLite-backed store; passwords and MFA seeds are AES-256-GCM sealed.
pub struct SqliteCredentialStore {
    db: Database,
    cipher: CredentialCipher,
}

impl SqliteCredentialStore {
    pub fn new(db: Database, cipher: CredentialCipher) -> Self {
        Self { db, cipher }
    }

    pub fn save_credentials(
        &self,
        tenant_id: &str,
        carrier_code: &str,
        credentials: &CarrierCredentials,
    ) -> Result<(), CollaboratorError> {
        let password_enc = self.cipher.encrypt(credentials.password.expose_secret())?;
        let mfa_enc = credentials
            .mfa_code
            .as_ref()
            .map(|mfa| self.cipher.encrypt(mfa.expose_secret()))
            .transpose()?;

        let row = CredentialRow {
            tenant_id: tenant_id.to_string(),
            carrier_code: carrier_code.to_string(),
            username: credentials.username.clone(),
            password_enc,
            mfa_enc,
            updated_at: now_timestamp(),
        };
        self.db.with_conn(|conn| credential_repo::upsert(conn, &row))?;
        log::info!("Stored credentials for {}/{}", tenant_id, carrier_code);
        Ok(())
    }

    pub fn delete_credentials(
        &self,
        tenant_id: &str,
        carrier_code: &str,
    ) -> Result<bool, CollaboratorError> {
        let changed = self
            .db
            .with_conn(|conn| credential_repo::delete(conn, tenant_id, carrier_code))?;
        Ok(changed > 0)
    }

    fn load(&self, tenant_id: &str, carrier_code: &str) -> Result<CarrierCredentials, CollaboratorError> {
        let row = self
            .db
            .with_conn(|conn| credential_repo::find(conn, tenant_id, carrier_code))?
            .ok_or_else(|| CollaboratorError::NotFound {
                what: "carrier credentials",
                id: format!("{}/{}", tenant_id, carrier_code),
            })?;

        let password = SecretString::from(self.cipher.decrypt(&row.password_enc)?);
        let mfa_code = row
            .mfa_enc
            .as_deref()
            .map(|enc| self.cipher.decrypt(enc).map(SecretString::from))
            .transpose()?;

        Ok(CarrierCredentials {
            username: row.username,
            password,
            mfa_code,
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get_credentials(
        &self,
        tenant_id: &str,
        carrier_code: &str,
    ) -> Result<CarrierCredentials, CollaboratorError> {
        self.load(tenant_id, carrier_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn store() -> SqliteCredentialStore {
        SqliteCredentialStore::new(
            Database::open_in_memory().unwrap(),
            CredentialCipher::from_hex_key(KEY).unwrap(),
        )
    }

    fn creds(password: &str) -> CarrierCredentials {
        CarrierCredentials {
            username: "agent007".to_string(),
            password: SecretString::from(password),
            mfa_code: Some(SecretString::from("JBSWY3DPEHPK3PXP")),
        }
    }

    #[tokio::test]
    async fn test_round_trip_decrypts() {
        let store = store();
        store.save_credentials("tenant-1", "acme", &creds("hunter2")).unwrap();

        let loaded = store.get_credentials("tenant-1", "acme").await.unwrap();
        assert_eq!(loaded.username, "agent007");
        assert_eq!(loaded.password.expose_secret(), "hunter2");
        assert_eq!(
            loaded.mfa_code.unwrap().expose_secret(),
            "JBSWY3DPEHPK3PXP"
        );
    }

    #[test]
    fn test_plaintext_never_stored() {
        let store = store();
        store.save_credentials("tenant-1", "acme", &creds("hunter2")).unwrap();

        let row = store
            .db
            .with_conn(|conn| credential_repo::find(conn, "tenant-1", "acme"))
            .unwrap()
            .unwrap();
        assert!(!row.password_enc.contains("hunter2"));
        assert_ne!(row.password_enc, hex_of("hunter2"));
    }

    fn hex_of(s: &str) -> String {
        s.bytes().map(|b| format!("{:02x}", b)).collect()
    }

    #[tokio::test]
    async fn test_missing_credentials_not_found() {
        let store = store();
        let err = store.get_credentials("tenant-1", "globex").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_tenants_are_isolated_and_delete() {
        let store = store();
        store.save_credentials("tenant-1", "acme", &creds("a")).unwrap();
        assert!(store.get_credentials("tenant-2", "acme").await.is_err());

        assert!(store.delete_credentials("tenant-1", "acme").unwrap());
        assert!(!store.delete_credentials("tenant-1", "acme").unwrap());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_to_decrypt() {
        let db = Database::open_in_memory().unwrap();
        let writer = SqliteCredentialStore::new(db.clone(), CredentialCipher::from_hex_key(KEY).unwrap());
        writer.save_credentials("tenant-1", "acme", &creds("pw")).unwrap();

        let other_key = "ff".repeat(32);
        let reader = SqliteCredentialStore::new(db, CredentialCipher::from_hex_key(&other_key).unwrap());
        let err = reader.get_credentials("tenant-1", "acme").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Secret(_)));
    }
}
