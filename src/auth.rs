//! Auth state for the whole app.
//!
//! Pages never inspect cookies or tokens themselves. They ask for an
//! [`AuthContext`] (optional user) or a [`RequireUser`] (protected page), and
//! redirects go through [`home_route`] and [`AppError::LoginRequired`].

use std::{future::Future, pin::Pin};

use actix_identity::{Identity, IdentityExt};
use actix_session::{Session, SessionExt};
use actix_web::{dev::Payload, web::Data, FromRequest, HttpMessage, HttpRequest, HttpResponse};
use chrono::Utc;

use crate::{
    backend::Backend,
    errors::AppError,
    structs::{AuthSession, AuthUser, Role},
    AppState,
};

const SESSION_KEY: &str = "auth_session";

pub const LOGIN_ROUTE: &str = "/login";
pub const LANDLORD_HOME: &str = "/dashboard-landlord";
pub const TENANT_HOME: &str = "/dashboard-tenant";

/// Dashboard for a role. Unknown or missing roles land on the tenant one.
pub fn home_route(role: Option<Role>) -> &'static str {
    match role {
        Some(Role::Landlord) => LANDLORD_HOME,
        Some(Role::Tenant) | None => TENANT_HOME,
    }
}

pub fn redirect(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .append_header(("Location", location))
        .finish()
}

/// Picks the session to keep when two writes race: the one that expires
/// later. Sessions of different users never merge; the incoming one wins.
pub fn newer(current: Option<AuthSession>, incoming: AuthSession) -> AuthSession {
    match current {
        Some(current)
            if current.user.id == incoming.user.id && current.expires_at > incoming.expires_at =>
        {
            current
        }
        _ => incoming,
    }
}

fn store(session: &Session, incoming: AuthSession) -> Result<AuthSession, AppError> {
    let current = session.get::<AuthSession>(SESSION_KEY)?;
    let winner = newer(current, incoming);
    session.insert(SESSION_KEY, &winner)?;
    Ok(winner)
}

/// Marks the request's client as signed in with `auth`.
pub fn establish(
    req: &HttpRequest,
    session: &Session,
    auth: AuthSession,
) -> Result<AuthSession, AppError> {
    Identity::login(&req.extensions(), auth.user.id.clone())?;
    store(session, auth)
}

/// Forgets the signed-in client. Other session data (flash notices) stays.
pub fn clear(identity: Option<Identity>, session: &Session) {
    if let Some(identity) = identity {
        identity.logout();
    }
    session.remove(SESSION_KEY);
}

/// Returns a usable session: the stored one while its access token is valid,
/// otherwise the result of a single refresh. `None` means signed out.
pub async fn resolve(backend: &Backend, stored: AuthSession, now: i64) -> Option<AuthSession> {
    if !stored.is_expired(now) {
        return Some(stored);
    }
    backend.refresh(&stored).await.ok()
}

/// Current auth state of the request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    session: Option<AuthSession>,
}

impl AuthContext {
    pub fn session(&self) -> Option<&AuthSession> {
        self.session.as_ref()
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.session.as_ref().map(|s| &s.user)
    }

    /// Dashboard of the signed-in user.
    pub fn home(&self) -> Option<&'static str> {
        self.user().map(|user| home_route(user.role()))
    }

    async fn extract(req: HttpRequest) -> Result<Self, AppError> {
        let state = req
            .app_data::<Data<AppState>>()
            .cloned()
            .ok_or(AppError::InternalServerError)?;
        let session = req.get_session();

        let Ok(identity) = req.get_identity() else {
            return Ok(AuthContext::default());
        };
        let user_id = identity.id()?;

        let stored = match session.get::<AuthSession>(SESSION_KEY)? {
            Some(stored) if stored.user.id == user_id => stored,
            _ => {
                log::warn!("Identity {} has no matching auth session", user_id);
                clear(Some(identity), &session);
                return Ok(AuthContext::default());
            }
        };

        let previous_token = stored.access_token.clone();
        match resolve(&state.backend, stored, Utc::now().timestamp()).await {
            Some(current) if current.access_token == previous_token => Ok(AuthContext {
                session: Some(current),
            }),
            Some(refreshed) => Ok(AuthContext {
                session: Some(store(&session, refreshed)?),
            }),
            None => {
                log::info!("Session of {} could not be refreshed, signing out", user_id);
                clear(Some(identity), &session);
                Ok(AuthContext::default())
            }
        }
    }
}

impl FromRequest for AuthContext {
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        Box::pin(Self::extract(req.clone()))
    }
}

/// Extractor for protected pages: rejects anonymous requests with a redirect
/// to the login page before the handler runs.
#[derive(Debug, Clone)]
pub struct RequireUser(pub AuthSession);

impl RequireUser {
    pub fn user(&self) -> &AuthUser {
        &self.0.user
    }
}

impl FromRequest for RequireUser {
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            AuthContext::extract(req)
                .await?
                .session
                .map(RequireUser)
                .ok_or(AppError::LoginRequired)
        })
    }
}
