//! Contracts for the hosted backend: an auth service and a row store.
//!
//! Handlers never talk to a concrete backend. They go through [`Backend`],
//! which wraps the two trait objects and publishes [`AuthEvent`]s for every
//! auth state transition.

pub mod local;
pub mod supabase;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

use crate::structs::{AuthSession, AuthUser, UserMetadata};

/// Message the auth service returns for a wrong email/password pair.
pub const INVALID_CREDENTIALS: &str = "Invalid login credentials";

/// How long the result of a refresh is handed to other requests that present
/// the same (now spent) refresh token.
pub const REFRESH_REUSE_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Rejected by the auth service. `message` is the service's own text.
    #[error("Auth error ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Rejected by the row store (constraint violation, unknown column, ...).
    #[error("Store error ({code}): {message}")]
    Store { code: String, message: String },

    #[error("Missing or expired access token")]
    Unauthorized,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BackendError {
    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        BackendError::Auth {
            status,
            message: message.into(),
        }
    }

    pub fn store(code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Store {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Message safe to show to the user verbatim. Only errors coming from the
    /// service itself carry one; everything else is unexpected.
    pub fn user_message(&self) -> Option<&str> {
        match self {
            BackendError::Auth { message, .. } | BackendError::Store { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

/// Tables of the relational schema and their columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Landlords,
    Tenants,
    Properties,
    Leases,
    Bills,
    Payments,
    Invites,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Landlords => "landlords",
            Table::Tenants => "tenants",
            Table::Properties => "properties",
            Table::Leases => "leases",
            Table::Bills => "bills",
            Table::Payments => "payments",
            Table::Invites => "invites",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Users => &["id", "role", "full_name", "invited_by", "created_at"],
            Table::Landlords => &["user_id", "bank_account"],
            Table::Tenants => &["user_id", "landlord_id", "address", "payment_method"],
            Table::Properties => &[
                "id",
                "address",
                "city",
                "landlord_id",
                "num_units",
                "created_at",
            ],
            Table::Leases => &[
                "id",
                "property_id",
                "tenant_id",
                "start_date",
                "end_date",
                "monthly_rent",
                "payment_day",
            ],
            Table::Bills => &[
                "id",
                "property_id",
                "type",
                "amount",
                "due_date",
                "status",
                "paid_at",
            ],
            Table::Payments => &[
                "id",
                "bill_id",
                "lease_id",
                "payer_id",
                "receiver_id",
                "amount",
                "method",
                "status",
                "payment_date",
            ],
            Table::Invites => &[
                "id",
                "email",
                "role",
                "token",
                "inviter_id",
                "status",
                "created_at",
            ],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conjunction of `column = value` conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<(String, String)>,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::default().and_eq(column, value)
    }

    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }
}

/// Sign-up request sent to the auth service.
#[derive(Debug, Clone)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub metadata: UserMetadata,
    pub redirect_to: String,
}

#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: AuthUser,
    /// True when the account must be confirmed by email before signing in.
    pub confirmation_required: bool,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_up(&self, request: SignUp) -> Result<SignUpOutcome, BackendError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError>;

    async fn verify_signup(&self, token_hash: &str) -> Result<AuthSession, BackendError>;
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn insert(
        &self,
        access_token: &str,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<(), BackendError>;

    async fn select(
        &self,
        access_token: &str,
        table: Table,
        filter: &Filter,
    ) -> Result<Vec<Value>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedUp,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthEventKind::SignedUp => "SIGNED_UP",
            AuthEventKind::SignedIn => "SIGNED_IN",
            AuthEventKind::SignedOut => "SIGNED_OUT",
            AuthEventKind::TokenRefreshed => "TOKEN_REFRESHED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub user_id: String,
    pub at: i64,
}

/// Process-wide stream of auth state changes.
#[derive(Clone)]
pub struct AuthEvents {
    sender: broadcast::Sender<AuthEvent>,
}

impl AuthEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        AuthEvents { sender }
    }

    pub fn publish(&self, kind: AuthEventKind, user_id: &str) {
        let event = AuthEvent {
            kind,
            user_id: user_id.to_owned(),
            at: chrono::Utc::now().timestamp(),
        };
        // No receivers is fine: nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Runs `callback` for every event until the returned handle is
    /// unsubscribed or dropped. Must be called inside a tokio runtime.
    pub fn subscribe<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(AuthEvent) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Auth listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

impl Default for AuthEvents {
    fn default() -> Self {
        AuthEvents::new(64)
    }
}

/// Handle returned by [`AuthEvents::subscribe`].
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Auth service and row store behind one handle shared by all handlers.
#[derive(Clone)]
pub struct Backend {
    auth: Arc<dyn AuthService>,
    store: Arc<dyn DataStore>,
    events: AuthEvents,
    /// Spent refresh token -> (session it produced, unix time of the refresh).
    recent_refreshes: Arc<Mutex<HashMap<String, (AuthSession, i64)>>>,
}

impl Backend {
    pub fn new(auth: Arc<dyn AuthService>, store: Arc<dyn DataStore>) -> Self {
        Backend {
            auth,
            store,
            events: AuthEvents::default(),
            recent_refreshes: Arc::default(),
        }
    }

    pub fn events(&self) -> &AuthEvents {
        &self.events
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub async fn sign_up(&self, request: SignUp) -> Result<SignUpOutcome, BackendError> {
        let email = request.email.clone();
        let outcome = self.auth.sign_up(request).await.map_err(|e| {
            log::error!("Sign-up failed for {}: {}", email, e);
            e
        })?;
        log::info!(
            "User {} signed up (confirmation required: {})",
            outcome.user.id,
            outcome.confirmation_required
        );
        self.events
            .publish(AuthEventKind::SignedUp, &outcome.user.id);
        Ok(outcome)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let session = self
            .auth
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| {
                log::warn!("Sign-in failed for {}: {}", email, e);
                e
            })?;
        self.events
            .publish(AuthEventKind::SignedIn, &session.user.id);
        Ok(session)
    }

    pub async fn sign_out(&self, session: &AuthSession) -> Result<(), BackendError> {
        self.auth.sign_out(&session.access_token).await.map_err(|e| {
            log::error!("Sign-out failed for {}: {}", session.user.id, e);
            e
        })?;
        self.events
            .publish(AuthEventKind::SignedOut, &session.user.id);
        Ok(())
    }

    /// Exchanges the session's refresh token for a new session.
    ///
    /// Refresh tokens are single use. Requests that race on the same cookie
    /// present the same token, so refreshes are serialized and a token spent
    /// less than [`REFRESH_REUSE_SECS`] ago yields the session it produced.
    pub async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, BackendError> {
        let mut recent = self.recent_refreshes.lock().await;
        let now = chrono::Utc::now().timestamp();
        recent.retain(|_, (_, refreshed_at)| now - *refreshed_at < REFRESH_REUSE_SECS);
        if let Some((refreshed, _)) = recent.get(&session.refresh_token) {
            log::debug!("Reusing recent refresh for {}", session.user.id);
            return Ok(refreshed.clone());
        }

        let refreshed = self
            .auth
            .refresh_session(&session.refresh_token)
            .await
            .map_err(|e| {
                log::warn!("Token refresh failed for {}: {}", session.user.id, e);
                e
            })?;
        recent.insert(session.refresh_token.clone(), (refreshed.clone(), now));
        drop(recent);

        self.events
            .publish(AuthEventKind::TokenRefreshed, &refreshed.user.id);
        Ok(refreshed)
    }

    pub async fn verify_signup(&self, token_hash: &str) -> Result<AuthSession, BackendError> {
        let session = self.auth.verify_signup(token_hash).await.map_err(|e| {
            log::warn!("Signup confirmation failed: {}", e);
            e
        })?;
        self.events
            .publish(AuthEventKind::SignedIn, &session.user.id);
        Ok(session)
    }
}
