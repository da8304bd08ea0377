//! SQLite Auth Storage
//! Mission: Persist identities, refresh records and verification tokens

use crate::auth::models::{
    Identity, NewIdentity, RefreshRecord, TokenPurpose, VerificationToken,
};
use crate::auth::store::{AccountEffect, RefreshStore, UserStore, VerificationStore};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Single SQLite database backing all three auth stores
pub struct SqliteAuthStore {
    db_path: String,
}

impl SqliteAuthStore {
    /// Open (creating if needed) the database and initialize the schema
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open auth database at {}", self.db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Initialize database schema
    fn init_db(&self) -> Result<()> {
        let conn = self.connect()?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE NOT NULL COLLATE NOCASE,
                full_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                is_verified INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_login_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS refresh_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                refresh_token TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS verification_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE NOT NULL,
                user_id INTEGER NOT NULL,
                purpose TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_verification_tokens_user ON verification_tokens(user_id)",
            [],
        )?;

        debug!("Auth schema ready at {}", self.db_path);
        Ok(())
    }
}

// Fixed-width UTC timestamps compare correctly as text
fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

const USER_COLUMNS: &str =
    "id, email, full_name, password_hash, is_verified, is_active, created_at, last_login_at";

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let last_login: Option<String> = row.get(7)?;
    Ok(Identity {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        password_hash: row.get(3)?,
        verified: row.get(4)?,
        active: row.get(5)?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
        last_login_at: last_login.as_deref().map(|s| parse_ts(7, s)).transpose()?,
    })
}

fn refresh_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshRecord> {
    Ok(RefreshRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        created_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        expires_at: parse_ts(4, &row.get::<_, String>(4)?)?,
    })
}

fn verification_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationToken> {
    let purpose_str: String = row.get(3)?;
    let purpose = TokenPurpose::parse(&purpose_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown token purpose {purpose_str}").into(),
        )
    })?;
    Ok(VerificationToken {
        id: row.get(0)?,
        token: row.get(1)?,
        user_id: row.get(2)?,
        purpose,
        created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
        expires_at: parse_ts(5, &row.get::<_, String>(5)?)?,
    })
}

impl UserStore for SqliteAuthStore {
    fn find_by_email(&self, email: &str) -> Result<Option<Identity>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
        conn.query_row(&sql, params![email], identity_from_row)
            .optional()
            .context("Failed to look up user by email")
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Identity>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        conn.query_row(&sql, params![id], identity_from_row)
            .optional()
            .context("Failed to look up user by id")
    }

    fn create(&self, identity: &NewIdentity) -> Result<Option<Identity>> {
        let conn = self.connect()?;
        let result = conn.execute(
            "INSERT INTO users (email, full_name, password_hash, is_verified, is_active, created_at)
             VALUES (?1, ?2, ?3, 0, 1, ?4)",
            params![
                identity.email,
                identity.full_name,
                identity.password_hash,
                ts(&identity.created_at),
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!("Insert lost on the unique email constraint");
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to insert user"),
        }

        let id = conn.last_insert_rowid();
        info!(user_id = id, "Created user {}", identity.email);

        Ok(Some(Identity {
            id,
            email: identity.email.clone(),
            full_name: identity.full_name.clone(),
            password_hash: identity.password_hash.clone(),
            verified: false,
            active: true,
            created_at: identity.created_at,
            last_login_at: None,
        }))
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        let conn = self.connect()?;
        let updated = conn
            .execute(
                "UPDATE users SET email = ?2, full_name = ?3, password_hash = ?4,
                    is_verified = ?5, is_active = ?6, last_login_at = ?7
                 WHERE id = ?1",
                params![
                    identity.id,
                    identity.email,
                    identity.full_name,
                    identity.password_hash,
                    identity.verified,
                    identity.active,
                    identity.last_login_at.as_ref().map(ts),
                ],
            )
            .context("Failed to update user")?;

        if updated == 0 {
            bail!("User {} not found", identity.id);
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let rows_affected = conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .context("Failed to delete user")?;

        if rows_affected > 0 {
            info!(user_id = id, "Deleted user");
        }
        Ok(rows_affected > 0)
    }
}

impl RefreshStore for SqliteAuthStore {
    fn insert(
        &self,
        user_id: i64,
        token: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshRecord> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO refresh_tokens (user_id, refresh_token, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, token, ts(&created_at), ts(&expires_at)],
        )
        .context("Failed to insert refresh token")?;

        Ok(RefreshRecord {
            id: conn.last_insert_rowid(),
            user_id,
            token: token.to_string(),
            created_at,
            expires_at,
        })
    }

    fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, user_id, refresh_token, created_at, expires_at
             FROM refresh_tokens WHERE refresh_token = ?1",
            params![token],
            refresh_from_row,
        )
        .optional()
        .context("Failed to look up refresh token")
    }

    fn count_for_owner(&self, user_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM refresh_tokens WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete_by_token(&self, token: &str) -> Result<bool> {
        let conn = self.connect()?;
        let rows_affected = conn
            .execute(
                "DELETE FROM refresh_tokens WHERE refresh_token = ?1",
                params![token],
            )
            .context("Failed to delete refresh token")?;
        Ok(rows_affected > 0)
    }

    fn delete_all_for_owner(&self, user_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM refresh_tokens WHERE user_id = ?1",
            params![user_id],
        )
        .context("Failed to delete refresh tokens")
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM refresh_tokens WHERE expires_at <= ?1",
            params![ts(&now)],
        )
        .context("Failed to purge refresh tokens")
    }
}

impl VerificationStore for SqliteAuthStore {
    fn insert(
        &self,
        user_id: i64,
        token: &str,
        purpose: TokenPurpose,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationToken> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO verification_tokens (token, user_id, purpose, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token,
                user_id,
                purpose.as_str(),
                ts(&created_at),
                ts(&expires_at)
            ],
        )
        .context("Failed to insert verification token")?;

        Ok(VerificationToken {
            id: conn.last_insert_rowid(),
            token: token.to_string(),
            user_id,
            purpose,
            created_at,
            expires_at,
        })
    }

    fn find_by_token(&self, token: &str) -> Result<Option<VerificationToken>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, token, user_id, purpose, created_at, expires_at
             FROM verification_tokens WHERE token = ?1",
            params![token],
            verification_from_row,
        )
        .optional()
        .context("Failed to look up verification token")
    }

    fn count_for_owner(&self, user_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM verification_tokens WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete_all_for_owner(&self, user_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM verification_tokens WHERE user_id = ?1",
            params![user_id],
        )
        .context("Failed to delete verification tokens")
    }

    fn commit_redemption(&self, token: &str, effect: &AccountEffect) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let consumed = tx.execute(
            "DELETE FROM verification_tokens WHERE token = ?1",
            params![token],
        )?;
        if consumed == 0 {
            // Already redeemed by someone else; dropping tx rolls back
            return Ok(false);
        }

        let affected = match effect {
            AccountEffect::MarkVerified { user_id } => tx.execute(
                "UPDATE users SET is_verified = 1 WHERE id = ?1",
                params![user_id],
            )?,
            AccountEffect::DeleteIdentity { user_id } => {
                tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?
            }
            AccountEffect::ReplacePassword {
                user_id,
                password_hash,
            } => {
                let updated = tx.execute(
                    "UPDATE users SET password_hash = ?2 WHERE id = ?1",
                    params![user_id, password_hash],
                )?;
                let revoked = tx.execute(
                    "DELETE FROM refresh_tokens WHERE user_id = ?1",
                    params![user_id],
                )?;
                debug!(user_id, revoked, "Revoked refresh tokens with password update");
                updated
            }
        };

        if affected == 0 {
            bail!("User {} vanished during token redemption", effect.user_id());
        }

        tx.commit().context("Failed to commit token redemption")?;
        Ok(true)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM verification_tokens WHERE expires_at <= ?1",
            params![ts(&now)],
        )
        .context("Failed to purge verification tokens")
    }
}
