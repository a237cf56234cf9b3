//! Fehlertypen fuer Raunen
//!
//! Zentraler Fehler-Enum der die Fehlerzustaende des Servers abdeckt.
//! Untermodule definieren eigene Fehler und konvertieren via `#[from]`.

use thiserror::Error;

/// Globaler Result-Alias fuer Raunen
pub type Result<T> = std::result::Result<T, RaunenError>;

/// Alle moeglichen Fehler im Raunen-System
#[derive(Debug, Error)]
pub enum RaunenError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    #[error("Protokollverletzung: {0}")]
    Protokollverletzung(String),

    // --- Authentifizierung & Autorisierung ---
    #[error("Authentifizierung fehlgeschlagen: {0}")]
    Authentifizierung(String),

    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    // --- Ressourcen ---
    #[error("Kanal nicht gefunden: {0}")]
    KanalNichtGefunden(u32),

    #[error("Benutzer nicht gefunden: {0}")]
    BenutzerNichtGefunden(u32),

    #[error("Session nicht gefunden: {0}")]
    SessionNichtGefunden(u32),

    #[error("Server voll: maximale Clientanzahl erreicht")]
    ServerVoll,

    // --- Krypto ---
    #[error("Kryptografiefehler: {0}")]
    Krypto(String),

    // --- Persistenz ---
    #[error("Persistenzfehler: {0}")]
    Persistenz(String),

    // --- Integritaet ---
    #[error("Integritaetsverletzung: {0}")]
    Integritaet(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RaunenError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler die Session beendet, aber nicht
    /// den Server (Recovery-Grenze: die Steuerschleife stirbt nie an
    /// Session-Fehlern)
    pub fn ist_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protokollverletzung(_) | Self::UngueltigeNachricht(_) | Self::Integritaet(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = RaunenError::Authentifizierung("Falsches Passwort".into());
        assert_eq!(
            e.to_string(),
            "Authentifizierung fehlgeschlagen: Falsches Passwort"
        );
    }

    #[test]
    fn session_fatal_erkennung() {
        assert!(RaunenError::Protokollverletzung("test".into()).ist_session_fatal());
        assert!(RaunenError::Integritaet("Cache".into()).ist_session_fatal());
        assert!(!RaunenError::ServerVoll.ist_session_fatal());
    }
}
