//! Hosted backend: Supabase auth (GoTrue) and row store (PostgREST) over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AuthService, BackendError, DataStore, Filter, SignUp, SignUpOutcome, Table};
use crate::{
    config::SupabaseConfig,
    structs::{AuthSession, AuthUser},
};

#[derive(Debug, Clone)]
pub struct SupabaseBackend {
    client: Client,
    url: String,
    anon_key: String,
}

/// Body of a successful token grant or verification.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self.expires_at.unwrap_or_else(|| {
            chrono::Utc::now().timestamp() + self.expires_in.unwrap_or(3600)
        });
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Sign-up answers with a bare user when confirmation is pending, or with a
/// full session when the project auto-confirms.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

/// Pulls the human-readable message out of a GoTrue or PostgREST error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["msg", "error_description", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// PostgREST query string for an equality filter.
fn filter_query(filter: &Filter) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    query.extend(
        filter
            .conditions
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value))),
    );
    query
}

impl SupabaseBackend {
    pub fn new(config: &SupabaseConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(SupabaseBackend {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.url, path)
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    /// Attaches the project key, plus the user's token when there is one.
    fn request(&self, builder: RequestBuilder, access_token: Option<&str>) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token.unwrap_or(&self.anon_key))
    }

    async fn auth_error(response: Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| status.to_string());
        BackendError::auth(status.as_u16(), message)
    }

    async fn store_error(response: Response) -> BackendError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return BackendError::Unauthorized;
        }
        let body = response.text().await.unwrap_or_default();
        let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        let code = value
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.as_u16().to_string());
        let message = error_message(&body).unwrap_or_else(|| status.to_string());
        BackendError::store(code, message)
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<AuthSession, BackendError> {
        let response = self
            .request(self.client.post(self.auth_url("token")), None)
            .query(&[("grant_type", grant_type)])
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::auth_error(response).await);
        }
        Ok(response.json::<TokenResponse>().await?.into_session())
    }
}

#[async_trait]
impl AuthService for SupabaseBackend {
    async fn sign_up(&self, request: SignUp) -> Result<SignUpOutcome, BackendError> {
        let response = self
            .request(self.client.post(self.auth_url("signup")), None)
            .query(&[("redirect_to", request.redirect_to.as_str())])
            .json(&json!({
                "email": request.email,
                "password": request.password,
                "data": request.metadata,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::auth_error(response).await);
        }

        Ok(match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session(token) => SignUpOutcome {
                user: token.user,
                confirmation_required: false,
            },
            SignUpResponse::User(user) => SignUpOutcome {
                user,
                confirmation_required: true,
            },
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        self.token_grant("password", json!({ "email": email, "password": password }))
            .await
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let response = self
            .request(self.client.post(self.auth_url("logout")), Some(access_token))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // The session is already gone on the server side.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                log::debug!("Sign-out for an already invalid session");
                Ok(())
            }
            _ => Err(Self::auth_error(response).await),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        self.token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }

    async fn verify_signup(&self, token_hash: &str) -> Result<AuthSession, BackendError> {
        let response = self
            .request(self.client.post(self.auth_url("verify")), None)
            .json(&json!({ "type": "signup", "token_hash": token_hash }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::auth_error(response).await);
        }
        Ok(response.json::<TokenResponse>().await?.into_session())
    }
}

#[async_trait]
impl DataStore for SupabaseBackend {
    async fn insert(
        &self,
        access_token: &str,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<(), BackendError> {
        let count = rows.len();
        let response = self
            .request(self.client.post(self.rest_url(table)), Some(access_token))
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::store_error(response).await);
        }
        log::info!("Inserted {} row(s) into {}", count, table);
        Ok(())
    }

    async fn select(
        &self,
        access_token: &str,
        table: Table,
        filter: &Filter,
    ) -> Result<Vec<Value>, BackendError> {
        let response = self
            .request(self.client.get(self.rest_url(table)), Some(access_token))
            .query(&filter_query(filter))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::store_error(response).await);
        }
        Ok(response.json::<Vec<Value>>().await?)
    }
}
