//! Bans mit CIDR-Praefix und Ablaufzeit
//!
//! Ein Ban trifft eine Adresse wenn das Praefix sie abdeckt und der Ban
//! noch nicht abgelaufen ist. IPv4-Adressen werden vor dem Vergleich auf
//! ihre IPv6-Abbildung normalisiert, damit ein v4-Ban auch die
//! v4-in-v6-Form der Adresse trifft.

use std::net::IpAddr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Ein Eintrag der Ban-Liste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    /// Gebannte Adresse (Netz-Anteil)
    pub adresse: IpAddr,
    /// Praefix-Laenge in Bits, bezogen auf die 128-Bit-Form
    pub praefix_bits: u32,
    /// Anzeigename des Gebannten
    pub name: String,
    /// Zertifikats-Digest des Gebannten (hex)
    pub zert_digest: String,
    /// Grund des Bans
    pub grund: String,
    /// Beginn als Unix-Timestamp (Sekunden)
    pub beginn: i64,
    /// Dauer in Sekunden, 0 = permanent
    pub dauer_sek: u32,
}

impl Ban {
    /// Erstellt einen permanenten Ban auf eine einzelne Adresse
    pub fn fuer_adresse(adresse: IpAddr, grund: impl Into<String>) -> Self {
        Self {
            adresse,
            praefix_bits: 128,
            name: String::new(),
            zert_digest: String::new(),
            grund: grund.into(),
            beginn: Utc::now().timestamp(),
            dauer_sek: 0,
        }
    }

    /// Prueft ob der Ban zum Zeitpunkt `jetzt` abgelaufen ist
    pub fn ist_abgelaufen(&self, jetzt: i64) -> bool {
        self.dauer_sek > 0 && jetzt >= self.beginn + self.dauer_sek as i64
    }

    /// Prueft ob das Praefix die Adresse abdeckt
    pub fn trifft(&self, adresse: &IpAddr) -> bool {
        let eigene = als_128bit(&self.adresse);
        let andere = als_128bit(adresse);

        let bits = self.praefix_bits.min(128);
        if bits == 0 {
            return true;
        }
        let maske = if bits == 128 {
            u128::MAX
        } else {
            u128::MAX << (128 - bits)
        };
        (eigene & maske) == (andere & maske)
    }

    /// Trifft der Ban die Adresse aktuell? (Praefix + nicht abgelaufen)
    pub fn gilt_fuer(&self, adresse: &IpAddr, jetzt: i64) -> bool {
        self.trifft(adresse) && !self.ist_abgelaufen(jetzt)
    }
}

/// Normalisiert eine Adresse auf ihre 128-Bit-Darstellung
///
/// IPv4 wird als v4-in-v6 (`::ffff:a.b.c.d`) abgebildet; die
/// Praefix-Laenge eines v4-Bans bezieht sich damit auf `96 + v4-Bits`.
fn als_128bit(adresse: &IpAddr) -> u128 {
    match adresse {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// Prueft eine Adresse gegen eine Ban-Liste
pub fn ist_gebannt(bans: &[Ban], adresse: &IpAddr, jetzt: i64) -> bool {
    bans.iter().any(|ban| ban.gilt_fuer(adresse, jetzt))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
