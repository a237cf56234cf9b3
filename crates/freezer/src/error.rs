//! Fehlertypen fuer raunen-freezer

use thiserror::Error;

/// Result-Alias fuer Persistenz-Operationen
pub type FreezerResult<T> = Result<T, FreezerError>;

/// Fehler der Persistenz-Engine
#[derive(Debug, Error)]
pub enum FreezerError {
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(#[from] serde_json::Error),
}
