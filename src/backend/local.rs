//! Embedded SQLite backend implementing the same contract as the hosted one.
//!
//! Used for development and tests. Error messages match the hosted auth
//! service for the cases the pages care about.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{
    migrate::Migrator,
    prelude::FromRow,
    query::Query,
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    },
    Sqlite, SqlitePool,
};
use uuid::Uuid;

use super::{
    AuthService, BackendError, DataStore, Filter, SignUp, SignUpOutcome, Table,
    INVALID_CREDENTIALS,
};
use crate::{
    config::LocalConfig,
    structs::{AuthSession, AuthUser, Role, UserMetadata},
    utils::{hash_password, normalize_email, verify_password},
};

pub static MIGRATOR: Migrator = sqlx::migrate!();

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, FromRow)]
struct AuthUserRecord {
    id: String,
    email: String,
    pwd_hash: String,
    user_metadata: String,
    email_confirmed_at: Option<String>,
}

impl AuthUserRecord {
    fn to_user(&self) -> Result<AuthUser, BackendError> {
        let user_metadata: UserMetadata = serde_json::from_str(&self.user_metadata)?;
        Ok(AuthUser {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            user_metadata,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    pool: SqlitePool,
    autoconfirm: bool,
    session_ttl_secs: i64,
}

impl LocalBackend {
    /// Opens (or creates) the database and runs pending migrations.
    pub async fn connect(config: &LocalConfig) -> Result<Self, BackendError> {
        let in_memory = config.database_url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // Every in-memory connection is its own database, so keep exactly one.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_opts.connect_with(opts).await?;

        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
        log::info!("Local backend ready at {}", config.database_url);

        Ok(LocalBackend {
            pool,
            autoconfirm: config.autoconfirm,
            session_ttl_secs: config.session_ttl_secs,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_user(&self, id: &str) -> Result<AuthUser, BackendError> {
        let record = sqlx::query_as::<_, AuthUserRecord>(
            "SELECT id, email, pwd_hash, user_metadata, email_confirmed_at FROM auth_users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BackendError::auth(404, "User not found"))?;
        record.to_user()
    }

    async fn issue_session(&self, user: AuthUser) -> Result<AuthSession, BackendError> {
        let access_token = Uuid::new_v4().simple().to_string();
        let refresh_token = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now().timestamp() + self.session_ttl_secs;

        sqlx::query(
            "INSERT INTO auth_sessions (access_token, refresh_token, user_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&access_token)
        .bind(&refresh_token)
        .bind(&user.id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(AuthSession {
            access_token,
            refresh_token,
            expires_at,
            user,
        })
    }

    /// User id behind a live access token.
    async fn authorize(&self, access_token: &str) -> Result<String, BackendError> {
        sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM auth_sessions WHERE access_token = ? AND expires_at > ?",
        )
        .bind(access_token)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BackendError::Unauthorized)
    }
}

#[async_trait]
impl AuthService for LocalBackend {
    async fn sign_up(&self, request: SignUp) -> Result<SignUpOutcome, BackendError> {
        let email = normalize_email(&request.email);
        if !email.contains('@') {
            return Err(BackendError::auth(
                400,
                "Unable to validate email address: invalid format",
            ));
        }
        if request.password.len() < MIN_PASSWORD_LEN {
            return Err(BackendError::auth(
                422,
                format!("Password should be at least {} characters.", MIN_PASSWORD_LEN),
            ));
        }

        let existing = sqlx::query_scalar::<_, String>("SELECT id FROM auth_users WHERE email = ?")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(already_registered());
        }

        let pwd_hash = hash_password(&request.password).map_err(|e| {
            log::error!("Failed to hash password: {}", e);
            BackendError::PasswordHash(e.to_string())
        })?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let confirmed_at = self.autoconfirm.then(|| now.clone());
        let confirmation_token =
            (!self.autoconfirm).then(|| Uuid::new_v4().simple().to_string());
        let metadata = serde_json::to_string(&request.metadata)?;
        let role = match request.metadata.role.as_deref() {
            Some(raw) => Role::parse(raw).unwrap_or_else(|| {
                log::warn!("Unknown role {:?} for {}, filing as tenant", raw, email);
                Role::Tenant
            }),
            None => Role::Tenant,
        };

        // The account, its public profile and its role row land together.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO auth_users (id, email, pwd_hash, user_metadata, email_confirmed_at, confirmation_token, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&email)
        .bind(&pwd_hash)
        .bind(&metadata)
        .bind(&confirmed_at)
        .bind(&confirmation_token)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(registration_error)?;
        sqlx::query("INSERT INTO users (id, role, full_name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(role.as_str())
            .bind(&request.metadata.full_name)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        match role {
            Role::Landlord => {
                sqlx::query("INSERT INTO landlords (user_id) VALUES (?)")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            Role::Tenant => {
                sqlx::query("INSERT INTO tenants (user_id) VALUES (?)")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        if let Some(token) = &confirmation_token {
            // No mailer here: the link goes to the log.
            log::info!(
                "Confirmation link for {}: {}?token_hash={}&type=signup",
                email,
                request.redirect_to,
                token
            );
        }

        Ok(SignUpOutcome {
            user: AuthUser {
                id,
                email: Some(email),
                user_metadata: request.metadata,
            },
            confirmation_required: confirmation_token.is_some(),
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let record = sqlx::query_as::<_, AuthUserRecord>(
            "SELECT id, email, pwd_hash, user_metadata, email_confirmed_at FROM auth_users WHERE email = ?",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record.filter(|r| verify_password(password, &r.pwd_hash)) else {
            return Err(BackendError::auth(400, INVALID_CREDENTIALS));
        };
        if record.email_confirmed_at.is_none() {
            return Err(BackendError::auth(400, "Email not confirmed"));
        }

        let session = self.issue_session(record.to_user()?).await?;
        log::debug!("Issued session for {}", session.user.id);
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE access_token = ?")
            .bind(access_token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            log::debug!("Sign-out for an unknown session");
        }
        Ok(())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        // Refresh tokens are single use.
        let user_id = sqlx::query_scalar::<_, String>(
            "DELETE FROM auth_sessions WHERE refresh_token = ? RETURNING user_id",
        )
        .bind(refresh_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BackendError::auth(400, "Invalid Refresh Token: Refresh Token Not Found")
        })?;

        let user = self.load_user(&user_id).await?;
        self.issue_session(user).await
    }

    async fn verify_signup(&self, token_hash: &str) -> Result<AuthSession, BackendError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "UPDATE auth_users SET email_confirmed_at = ?, confirmation_token = NULL WHERE confirmation_token = ? RETURNING id",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BackendError::auth(403, "Email link is invalid or has expired"))?;

        let user = self.load_user(&user_id).await?;
        self.issue_session(user).await
    }
}

fn already_registered() -> BackendError {
    BackendError::auth(422, "User already registered")
}

/// A concurrent sign-up can win the race past the existence check; its
/// unique email then surfaces here.
fn registration_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db)
            if db.is_unique_violation() && db.message().contains("auth_users.email") =>
        {
            already_registered()
        }
        other => BackendError::Database(other),
    }
}

fn store_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db) => BackendError::store(
            db.code().map(|c| c.into_owned()).unwrap_or_default(),
            db.message().to_string(),
        ),
        other => BackendError::Database(other),
    }
}

fn unknown_column(table: Table, column: &str) -> BackendError {
    BackendError::store(
        "PGRST204",
        format!(
            "Could not find the '{}' column of '{}' in the schema cache",
            column, table
        ),
    )
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl DataStore for LocalBackend {
    async fn insert(
        &self,
        access_token: &str,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<(), BackendError> {
        self.authorize(access_token).await?;

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let Value::Object(fields) = row else {
                return Err(BackendError::store("PGRST102", "Row must be a JSON object"));
            };
            if let Some(column) = fields.keys().find(|c| !table.has_column(c)) {
                return Err(unknown_column(table, column));
            }

            let columns: Vec<String> = fields.keys().map(|c| format!("\"{}\"", c)).collect();
            let placeholders = vec!["?"; fields.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for value in fields.values() {
                query = bind_json(query, value);
            }
            query.execute(&mut *tx).await.map_err(store_error)?;
        }
        tx.commit().await?;

        log::info!("Inserted {} row(s) into {}", rows.len(), table);
        Ok(())
    }

    async fn select(
        &self,
        access_token: &str,
        table: Table,
        filter: &Filter,
    ) -> Result<Vec<Value>, BackendError> {
        self.authorize(access_token).await?;

        if let Some((column, _)) = filter.conditions.iter().find(|(c, _)| !table.has_column(c)) {
            return Err(unknown_column(table, column));
        }

        let projection = table
            .columns()
            .iter()
            .map(|c| format!("'{}', \"{}\"", c, c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT json_object({}) FROM {}", projection, table);
        if !filter.conditions.is_empty() {
            let clauses = filter
                .conditions
                .iter()
                .map(|(c, _)| format!("\"{}\" = ?", c))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&clauses);
        }

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for (_, value) in &filter.conditions {
            query = query.bind(value.clone());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(store_error)?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(BackendError::from))
            .collect()
    }
}
