// SQLite-backed implementations of the auth storage ports.
//
// Rotation and grant consumption use conditional writes inside a
// transaction; `rows_affected` is the per-key CAS that keeps refresh tokens
// and grants single-use under concurrent handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::core::auth::{
    AuthError, GoogleClaims, GrantStore, Identity, IdentityStore, PendingAuthGrant, Session,
    SessionStore,
};

#[derive(Clone)]
pub struct SqliteAuthStore {
    pool: Pool<Sqlite>,
}

impl SqliteAuthStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                subject TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                picture TEXT,
                google_refresh_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_login TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                refresh_token TEXT NOT NULL UNIQUE,
                issued_at TEXT NOT NULL,
                access_expires_at TEXT NOT NULL,
                refresh_expires_at TEXT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_grants (
                token TEXT PRIMARY KEY,
                state TEXT,
                subject TEXT NOT NULL,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                picture TEXT,
                google_refresh_token TEXT,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: sqlx::Error) -> AuthError {
    AuthError::Storage(e.to_string())
}

fn parse_uuid(raw: String) -> Result<Uuid, AuthError> {
    Uuid::parse_str(&raw).map_err(|e| AuthError::Storage(format!("bad uuid in store: {e}")))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, AuthError> {
    Ok(Session {
        id: parse_uuid(row.get::<String, _>("id"))?,
        subject: row.get("subject"),
        refresh_token: row.get("refresh_token"),
        issued_at: row.get::<DateTime<Utc>, _>("issued_at"),
        access_expires_at: row.get::<DateTime<Utc>, _>("access_expires_at"),
        refresh_expires_at: row.get::<DateTime<Utc>, _>("refresh_expires_at"),
        revoked: row.get("revoked"),
    })
}

#[async_trait]
impl IdentityStore for SqliteAuthStore {
    async fn get(&self, subject: &str) -> Result<Option<Identity>, AuthError> {
        let row = sqlx::query("SELECT * FROM identities WHERE subject = ?")
            .bind(subject)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|row| Identity {
            subject: row.get("subject"),
            email: row.get("email"),
            name: row.get("name"),
            picture: row.get("picture"),
            google_refresh_token: row.get("google_refresh_token"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            last_login: row.get::<Option<DateTime<Utc>>, _>("last_login"),
        }))
    }

    async fn upsert(&self, identity: Identity) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO identities
                (subject, email, name, picture, google_refresh_token, created_at, updated_at, last_login)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(subject) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                picture = excluded.picture,
                google_refresh_token = excluded.google_refresh_token,
                updated_at = excluded.updated_at,
                last_login = excluded.last_login
            "#,
        )
        .bind(&identity.subject)
        .bind(&identity.email)
        .bind(&identity.name)
        .bind(&identity.picture)
        .bind(&identity.google_refresh_token)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .bind(identity.last_login)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteAuthStore {
    async fn insert(&self, session: Session) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, subject, refresh_token, issued_at, access_expires_at, refresh_expires_at, revoked)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.subject)
        .bind(&session.refresh_token)
        .bind(session.issued_at)
        .bind(session.access_expires_at)
        .bind(session.refresh_expires_at)
        .bind(session.revoked)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, AuthError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_refresh(&self, refresh_token: &str) -> Result<Option<Session>, AuthError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE refresh_token = ?")
            .bind(refresh_token)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn rotate(&self, old_refresh: &str, replacement: Session) -> Result<bool, AuthError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Conditional update is the CAS: only an unrevoked row with this
        // exact refresh token can be retired, and only once.
        let retired = sqlx::query(
            "UPDATE sessions SET revoked = 1 WHERE refresh_token = ? AND revoked = 0",
        )
        .bind(old_refresh)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();

        if retired == 0 {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, subject, refresh_token, issued_at, access_expires_at, refresh_expires_at, revoked)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(replacement.id.to_string())
        .bind(&replacement.subject)
        .bind(&replacement.refresh_token)
        .bind(replacement.issued_at)
        .bind(replacement.access_expires_at)
        .bind(replacement.refresh_expires_at)
        .bind(replacement.revoked)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn revoke(&self, id: Uuid) -> Result<(), AuthError> {
        sqlx::query("UPDATE sessions SET revoked = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for SqliteAuthStore {
    async fn stage(&self, grant: PendingAuthGrant) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO auth_grants
                (token, state, subject, email, name, picture, google_refresh_token, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&grant.token)
        .bind(&grant.state)
        .bind(&grant.claims.subject)
        .bind(&grant.claims.email)
        .bind(&grant.claims.name)
        .bind(&grant.claims.picture)
        .bind(&grant.google_refresh_token)
        .bind(grant.expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn consume(&self, token: &str) -> Result<Option<PendingAuthGrant>, AuthError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query("SELECT * FROM auth_grants WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(None);
        };

        // The delete's row count decides the winner when two handlers race
        // on the same token.
        let deleted = sqlx::query("DELETE FROM auth_grants WHERE token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();
        tx.commit().await.map_err(storage_err)?;

        if deleted == 0 {
            return Ok(None);
        }

        Ok(Some(PendingAuthGrant {
            token: row.get("token"),
            state: row.get("state"),
            claims: GoogleClaims {
                subject: row.get("subject"),
                email: row.get("email"),
                name: row.get("name"),
                picture: row.get("picture"),
            },
            google_refresh_token: row.get("google_refresh_token"),
            expires_at: row.get::<DateTime<Utc>, _>("expires_at"),
        }))
    }
}

// =============================================================================
// TESTS
// =============================================================================
