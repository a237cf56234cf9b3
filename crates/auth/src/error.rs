//! Fehlertypen fuer raunen-auth

use thiserror::Error;

/// Result-Alias fuer Auth-Operationen
pub type AuthResult<T> = Result<T, AuthError>;

/// Fehler der Zugangskontrolle
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Ungueltiges Passwortformat: {0}")]
    PasswortFormat(String),

    #[error("Ungueltige Adresse: {0}")]
    Adresse(String),
}
