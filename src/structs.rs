use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// The two account kinds a user can register as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Landlord,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tenant => "tenant",
            Role::Landlord => "landlord",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "tenant" => Some(Role::Tenant),
            "landlord" => Some(Role::Landlord),
            _ => None,
        }
    }
}

/// Metadata attached to an account at sign-up.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// User object as returned by the auth service.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl AuthUser {
    /// Role from metadata; `None` when absent or not one of the known roles.
    pub fn role(&self) -> Option<Role> {
        self.user_metadata.role.as_deref().and_then(Role::parse)
    }

    /// Name shown in greetings: full name, falling back to the email.
    pub fn display_name(&self) -> String {
        self.user_metadata
            .full_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.email.clone())
            .unwrap_or_default()
    }
}

/// An authenticated session. `expires_at` is a unix timestamp in seconds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub user: AuthUser,
}

impl AuthSession {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    pub id: String,
    pub role: String,
    pub full_name: Option<String>,
    pub invited_by: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Landlord {
    pub user_id: String,
    pub bank_account: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Tenant {
    pub user_id: String,
    pub landlord_id: Option<String>,
    pub address: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Property {
    pub id: String,
    pub address: String,
    pub city: String,
    pub landlord_id: Option<String>,
    pub num_units: Option<i64>,
    pub created_at: Option<String>,
}

impl Property {
    /// Creation date as `dd/mm/yyyy`. Accepts RFC 3339 and SQLite's
    /// `YYYY-MM-DD HH:MM:SS` timestamps.
    pub fn created_on(&self) -> Option<String> {
        let raw = self.created_at.as_deref()?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.format("%d/%m/%Y").to_string());
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ts| ts.format("%d/%m/%Y").to_string())
    }
}

/// Row inserted by the add-property flow.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NewProperty {
    pub landlord_id: String,
    pub address: String,
    pub city: String,
    pub num_units: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub property_id: Option<String>,
    pub tenant_id: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub monthly_rent: f64,
    pub payment_day: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Bill {
    pub id: String,
    pub property_id: Option<String>,
    #[serde(rename = "type")]
    pub bill_type: String,
    pub amount: f64,
    pub due_date: String,
    pub status: Option<String>,
    pub paid_at: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Payment {
    pub id: String,
    pub bill_id: Option<String>,
    pub lease_id: Option<String>,
    pub payer_id: Option<String>,
    pub receiver_id: Option<String>,
    pub amount: f64,
    pub method: String,
    pub status: Option<String>,
    pub payment_date: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Invite {
    pub id: String,
    pub email: String,
    pub role: String,
    pub token: String,
    pub inviter_id: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}
