//! Flash notifications shown at the top of the next rendered page.

use actix_session::Session;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{BackendError, INVALID_CREDENTIALS},
    errors::AppError,
};

const FLASH_KEY: &str = "notice";

/// User-facing strings (Hebrew UI).
pub mod messages {
    pub const ERROR: &str = "שגיאה";
    pub const UNEXPECTED_ERROR: &str = "אירעה שגיאה לא צפויה";
    pub const FIELDS_REQUIRED: &str = "יש למלא את כל השדות";

    pub const SELECT_ROLE: &str = "אנא בחר תפקיד";
    pub const REGISTER_FAILED: &str = "שגיאה בהרשמה";
    pub const REGISTER_OK: &str = "ההרשמה בוצעה בהצלחה!";
    pub const REGISTER_CONFIRM_EMAIL: &str =
        "נשלח אליך מייל אישור. אנא לחץ על הקישור במייל כדי להפעיל את החשבון";
    pub const REGISTER_READY: &str = "החשבון נוצר, אפשר להתחבר";

    pub const LOGIN_FAILED: &str = "שגיאה בהתחברות";
    pub const INVALID_CREDENTIALS: &str = "כתובת אימייל או סיסמה שגויים";
    pub const LOGIN_OK: &str = "התחברת בהצלחה!";
    pub const LOGIN_REDIRECT: &str = "מועבר לדשבורד...";

    pub const PROPERTY_REQUIRED: &str = "יש למלא כתובת ועיר";
    pub const PROPERTY_FAILED: &str = "אירעה שגיאה בהוספת הנכס";
    pub const PROPERTY_OK: &str = "הנכס נוסף בהצלחה!";
    pub const PROPERTY_OK_DETAIL: &str = "הנכס החדש שלך נוסף למערכת";

    pub const SIGN_OUT_FAILED: &str = "אירעה שגיאה בהתנתקות";
    pub const SIGN_OUT_OK: &str = "התנתקת בהצלחה";
    pub const SIGN_OUT_OK_DETAIL: &str = "להתראות!";

    pub const CONFIRM_FAILED: &str = "שגיאה באימות החשבון";
    pub const CONFIRM_OK: &str = "החשבון אומת בהצלחה";
    pub const CONFIRM_OK_DETAIL: &str = "ברוכים הבאים!";
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Default,
    Destructive,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub variant: Variant,
}

impl Notice {
    pub fn success(title: &str, description: &str) -> Self {
        Notice {
            title: title.to_string(),
            description: description.to_string(),
            variant: Variant::Default,
        }
    }

    pub fn error(title: &str, description: &str) -> Self {
        Notice {
            title: title.to_string(),
            description: description.to_string(),
            variant: Variant::Destructive,
        }
    }
}

/// The service's own message when it has one, the generic text otherwise.
pub fn service_message(err: &BackendError) -> &str {
    err.user_message().unwrap_or(messages::UNEXPECTED_ERROR)
}

/// Like [`service_message`], with the wrong-credentials message localized.
pub fn login_message(err: &BackendError) -> &str {
    match err.user_message() {
        Some(INVALID_CREDENTIALS) => messages::INVALID_CREDENTIALS,
        _ => service_message(err),
    }
}

/// Stores a notice for the next page render.
pub fn flash(session: &Session, notice: Notice) -> Result<(), AppError> {
    session.insert(FLASH_KEY, notice)?;
    Ok(())
}

/// Removes and returns the pending notice, if any.
pub fn take(session: &Session) -> Option<Notice> {
    match session.remove_as::<Notice>(FLASH_KEY)? {
        Ok(notice) => Some(notice),
        Err(raw) => {
            log::warn!("Dropping unreadable notice: {}", raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_credentials_are_localized() {
        let err = BackendError::auth(400, INVALID_CREDENTIALS);
        assert_eq!(login_message(&err), messages::INVALID_CREDENTIALS);
    }

    #[test]
    fn other_service_messages_pass_through() {
        let err = BackendError::auth(400, "Email not confirmed");
        assert_eq!(login_message(&err), "Email not confirmed");
        assert_eq!(service_message(&err), "Email not confirmed");
    }

    #[test]
    fn unexpected_failures_get_generic_text() {
        let err = BackendError::Transport("dns error".into());
        assert_eq!(login_message(&err), messages::UNEXPECTED_ERROR);
        assert_eq!(service_message(&err), messages::UNEXPECTED_ERROR);
    }
}
