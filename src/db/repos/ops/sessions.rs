use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::db::models::AdminSession;
use crate::db::{self, DbPool};
use crate::error::AppError;

/// Session tokens are stored hashed; only the digest is ever persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn row_to_session(row: &Row) -> rusqlite::Result<AdminSession> {
    Ok(AdminSession {
        token_hash: row.get("token_hash")?,
        user_id: row.get("user_id")?,
        role: row.get("role")?,
        expires_at: row.get("expires_at")?,
    })
}

/// Store a session. Normally written by the auth collaborator.
pub fn create(
    pool: &DbPool,
    token: &str,
    user_id: &str,
    role: &str,
    expires_at: &str,
) -> Result<AdminSession, AppError> {
    let token_hash = hash_token(token);
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO admin_sessions (token_hash, user_id, role, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![token_hash, user_id, role, expires_at, db::now()],
    )?;
    conn.query_row(
        "SELECT * FROM admin_sessions WHERE token_hash = ?1",
        params![token_hash],
        row_to_session,
    )
    .map_err(AppError::Database)
}

/// Look up an unexpired session by its raw bearer token.
pub fn find_valid(pool: &DbPool, token: &str) -> Result<Option<AdminSession>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM admin_sessions WHERE token_hash = ?1 AND expires_at > ?2",
        params![hash_token(token), db::now()],
        row_to_session,
    )
    .optional()
    .map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_find_valid_checks_expiry() {
        let pool = init_test_db().unwrap();
        let future = db::since(chrono::Duration::hours(-1));
        create(&pool, "live-token", "u1", "super_admin", &future).unwrap();
        create(&pool, "old-token", "u2", "admin", "2020-01-01T00:00:00.000Z").unwrap();

        let live = find_valid(&pool, "live-token").unwrap().unwrap();
        assert!(live.is_privileged());
        assert!(find_valid(&pool, "old-token").unwrap().is_none());
        assert!(find_valid(&pool, "unknown").unwrap().is_none());
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = hash_token("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
