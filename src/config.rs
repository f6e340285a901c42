use std::env;

use crate::errors::AppError;

/// Minimum length of `SESSION_KEY`; the cookie key derives signing and
/// encryption keys from it.
pub const MIN_SESSION_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Public origin of the site, used to build email confirmation links.
    pub site_url: String,
    pub session_key: String,
    pub cookie_secure: bool,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Supabase(SupabaseConfig),
    Local(LocalConfig),
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub database_url: String,
    /// Skip email confirmation and allow sign-in right after sign-up.
    pub autoconfirm: bool,
    pub session_ttl_secs: i64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            database_url: "sqlite://vivo.db".to_string(),
            autoconfirm: false,
            session_ttl_secs: 3600,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let session_key = lookup("SESSION_KEY")
            .ok_or_else(|| AppError::ConfigError("SESSION_KEY is not set".into()))?;
        if session_key.len() < MIN_SESSION_KEY_LEN {
            return Err(AppError::ConfigError(format!(
                "SESSION_KEY must be at least {} bytes",
                MIN_SESSION_KEY_LEN
            )));
        }

        let backend = match lookup("BACKEND").as_deref().unwrap_or("supabase") {
            "supabase" => BackendConfig::Supabase(SupabaseConfig {
                url: lookup("SUPABASE_URL")
                    .ok_or_else(|| AppError::ConfigError("SUPABASE_URL is not set".into()))?
                    .trim_end_matches('/')
                    .to_string(),
                anon_key: lookup("SUPABASE_ANON_KEY").ok_or_else(|| {
                    AppError::ConfigError("SUPABASE_ANON_KEY is not set".into())
                })?,
                request_timeout_secs: parse_or(&lookup, "SUPABASE_TIMEOUT_SECS", 30)?,
            }),
            "local" => {
                let defaults = LocalConfig::default();
                BackendConfig::Local(LocalConfig {
                    database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
                    autoconfirm: parse_or(&lookup, "LOCAL_AUTOCONFIRM", defaults.autoconfirm)?,
                    session_ttl_secs: parse_or(
                        &lookup,
                        "SESSION_TTL_SECS",
                        defaults.session_ttl_secs,
                    )?,
                })
            }
            other => {
                return Err(AppError::ConfigError(format!(
                    "BACKEND must be `supabase` or `local`, got `{}`",
                    other
                )))
            }
        };

        Ok(AppConfig {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "PORT", 8080)?,
            site_url: lookup("SITE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            session_key,
            cookie_secure: parse_or(&lookup, "COOKIE_SECURE", true)?,
            backend,
        })
    }

    /// Where email confirmation links send the user back to.
    pub fn confirm_url(&self) -> String {
        format!("{}/auth/confirm", self.site_url)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigError(format!("{} has an invalid value: {}", key, raw))),
    }
}
