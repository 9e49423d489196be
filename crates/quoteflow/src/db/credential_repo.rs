//! Credential repository: encrypted per-tenant carrier logins.
//!
//! Stores ciphertext only; encryption happens in the credential store.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub tenant_id: String,
    pub carrier_code: String,
    pub username: String,
    pub password_enc: String,
    pub mfa_enc: Option<String>,
    pub updated_at: String,
}

impl CredentialRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            tenant_id: row.get("tenant_id")?,
            carrier_code: row.get("carrier_code")?,
            username: row.get("username")?,
            password_enc: row.get("password_enc")?,
            mfa_enc: row.get("mfa_enc")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts or replaces the credentials for a (tenant, carrier) pair.
pub fn upsert(conn: &Connection, row: &CredentialRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO carrier_credentials (tenant_id, carrier_code, username, password_enc, mfa_enc, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(tenant_id, carrier_code) DO UPDATE SET
            username = excluded.username,
            password_enc = excluded.password_enc,
            mfa_enc = excluded.mfa_enc,
            updated_at = excluded.updated_at",
        params![
            row.tenant_id,
            row.carrier_code,
            row.username,
            row.password_enc,
            row.mfa_enc,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find(
    conn: &Connection,
    tenant_id: &str,
    carrier_code: &str,
) -> Result<Option<CredentialRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM carrier_credentials WHERE tenant_id = ?1 AND carrier_code = ?2",
            params![tenant_id, carrier_code],
            CredentialRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn delete(conn: &Connection, tenant_id: &str, carrier_code: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM carrier_credentials WHERE tenant_id = ?1 AND carrier_code = ?2",
        params![tenant_id, carrier_code],
    )?;
    Ok(changed)
}
