use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(provided: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(provided.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            log::error!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

/// Parses the unit count typed into the add-property form.
///
/// Reads a leading integer (surrounding whitespace and trailing garbage are
/// ignored). Anything that does not start with a number becomes 1, and the
/// result is never below 1.
pub fn parse_num_units(raw: &str) -> i64 {
    let trimmed = raw.trim();
    let digits_end = trimmed
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..digits_end].parse::<i64>().unwrap_or(1).max(1)
}

/// Lowercased, trimmed email used as the account key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
