//! Registrierung bei der oeffentlichen Server-Liste
//!
//! Der Timer der Steuerschleife stoesst die Registrierung periodisch an;
//! der Versatz pro Instanz verteilt die Last ueber die Flotte. Das
//! eigentliche Einreichen bei der Server-Liste ist ein Platzhalter:
//! ohne konfigurierten `RegisterName` wird still uebersprungen.

use std::time::Duration;

use crate::config::Konfiguration;

/// Periode des Registrierungs-Timers: eine Stunde plus ein
/// instanzabhaengiger Versatz von bis zu zehn Minuten
pub fn registrierungs_periode(server_id: i64) -> Duration {
    let versatz = (server_id.unsigned_abs() * 60) % 600;
    Duration::from_secs(3600 + versatz)
}

/// Verzoegerung der ersten Registrierung nach dem Start
pub fn erste_registrierung_nach(server_id: i64) -> Duration {
    Duration::from_secs(60 + server_id.unsigned_abs() * 10)
}

/// Meldet den Server bei der oeffentlichen Liste (Platzhalter)
pub fn oeffentlich_registrieren(konfiguration: &Konfiguration, server_id: i64) {
    let name = konfiguration.zeichenkette("RegisterName");
    if name.is_empty() {
        tracing::debug!(
            server_id,
            "Keine oeffentliche Registrierung konfiguriert, uebersprungen"
        );
        return;
    }

    tracing::info!(
        server_id,
        name = %name,
        "Registrierung bei der oeffentlichen Server-Liste (Platzhalter)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periode_mit_versatz() {
        assert_eq!(registrierungs_periode(0), Duration::from_secs(3600));
        assert_eq!(registrierungs_periode(1), Duration::from_secs(3660));
        // Versatz wickelt bei zehn Minuten um
        assert_eq!(registrierungs_periode(10), Duration::from_secs(3600));
        assert_eq!(registrierungs_periode(3), Duration::from_secs(3780));
    }

    #[test]
    fn erste_registrierung_versetzt() {
        assert_eq!(erste_registrierung_nach(0), Duration::from_secs(60));
        assert_eq!(erste_registrierung_nach(5), Duration::from_secs(110));
    }
}
