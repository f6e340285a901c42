#[macro_use]
extern crate lazy_static;

use std::sync::Arc;

use actix_identity::{config::LogoutBehaviour, IdentityMiddleware};
use actix_session::{storage::CookieSessionStore, SessionMiddleware};
use actix_web::cookie::Key;
use tera::Tera;

pub mod auth;
pub mod backend;
pub mod config;
pub mod db;
pub mod errors;
pub mod notice;
pub mod routes;
pub mod structs;
pub mod utils;

use backend::{local::LocalBackend, supabase::SupabaseBackend, Backend, BackendError};
use config::{AppConfig, BackendConfig};

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub config: Arc<AppConfig>,
}

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = match Tera::new("templates/**/*") {
            Ok(t) => t,
            Err(e) => {
                log::error!("Parsing error(s): {}", e);
                ::std::process::exit(1);
            }
        };
        tera.autoescape_on(vec![".html"]);
        tera
    };
}

/// Connects the configured backend. Local mode serves auth and rows from
/// the same SQLite pool.
pub async fn connect_backend(config: &BackendConfig) -> Result<Backend, BackendError> {
    match config {
        BackendConfig::Supabase(supabase) => {
            log::info!("Using Supabase backend at {}", supabase.url);
            let remote = Arc::new(SupabaseBackend::new(supabase)?);
            Ok(Backend::new(remote.clone(), remote))
        }
        BackendConfig::Local(local) => {
            log::info!("Using local backend at {}", local.database_url);
            let local = Arc::new(LocalBackend::connect(local).await?);
            Ok(Backend::new(local.clone(), local))
        }
    }
}

/// Logging out only drops the identity keys so a flash notice set in the
/// same request reaches the next page.
pub fn identity_middleware() -> IdentityMiddleware {
    IdentityMiddleware::builder()
        .logout_behaviour(LogoutBehaviour::DeleteIdentityKeys)
        .build()
}

pub fn session_middleware(key: Key, cookie_secure: bool) -> SessionMiddleware<CookieSessionStore> {
    SessionMiddleware::builder(CookieSessionStore::default(), key)
        .cookie_secure(cookie_secure)
        .build()
}
