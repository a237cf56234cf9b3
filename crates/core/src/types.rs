//! Gemeinsame Identifikationstypen fuer Raunen
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen. Im Gegensatz zu
//! UUID-basierten Systemen sind alle IDs kleine Ganzzahlen: Session-IDs
//! stammen aus einem wiederverwendenden Pool, Kanal- und Benutzer-IDs aus
//! monoton steigenden Zaehlern.

use serde::{Deserialize, Serialize};

/// Eindeutige ID einer Client-Verbindung (aus dem Session-Pool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Gibt den inneren Wert zurueck
    pub fn wert(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Eindeutige Kanal-ID
///
/// Die ID 0 ist fuer den Root-Kanal reserviert. Kanal-IDs werden nie
/// wiederverwendet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Der Root-Kanal (unveraenderlich, kann nicht entfernt werden)
    pub const ROOT: ChannelId = ChannelId(0);

    /// Gibt den inneren Wert zurueck
    pub fn wert(&self) -> u32 {
        self.0
    }

    /// Prueft ob dies der Root-Kanal ist
    pub fn ist_root(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Eindeutige ID eines registrierten Benutzers
///
/// Die ID 0 ist fuer den SuperUser reserviert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl UserId {
    /// Der SuperUser (alle Berechtigungen implizit)
    pub const SUPERUSER: UserId = UserId(0);

    /// Gibt den inneren Wert zurueck
    pub fn wert(&self) -> u32 {
        self.0
    }

    /// Prueft ob dies der SuperUser ist
    pub fn ist_superuser(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Verbindungszustand
// ---------------------------------------------------------------------------

/// Lebenszyklus einer Client-Session
///
/// ```text
/// Verbunden -> VersionGesendet -> VersionEmpfangen -> Authentifiziert -> Bereit
///                                                                          |
///                                                          Tot <-----------+
/// ```
///
/// Broadcasts erreichen eine Session erst ab `Authentifiziert`; erst in
/// `Bereit` nimmt sie am Sprachverkehr teil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientZustand {
    /// TCP/TLS-Verbindung steht, noch nichts ausgetauscht
    Verbunden,
    /// Server hat seine Version-Nachricht gesendet
    VersionGesendet,
    /// Client hat seine Version-Nachricht gesendet
    VersionEmpfangen,
    /// Authentifizierung erfolgreich, Sync laeuft
    Authentifiziert,
    /// Vollstaendig synchronisiert, nimmt am Betrieb teil
    Bereit,
    /// Verbindung wird abgebaut
    Tot,
}
