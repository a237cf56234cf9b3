//! Server-Konfiguration
//!
//! Zwei Ebenen:
//! - Die Bootstrap-Konfiguration wird beim Start aus einer TOML-Datei
//!   geladen (Bind-Adresse, Port, Datenverzeichnis, Logging). Alle Felder
//!   haben sinnvolle Standardwerte, sodass der Server ohne
//!   Konfigurationsdatei lauffaehig ist.
//! - Die dynamische `Konfiguration` ist ein typisierter
//!   Schluessel/Wert-Speicher, den die Steuerschleife zur Laufzeit
//!   aendert und der mit eingefroren wird.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bootstrap-Konfiguration (TOML)
// ---------------------------------------------------------------------------

/// Vollstaendige Bootstrap-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// Daten- und TLS-Einstellungen
    pub daten: DatenEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Instanz-ID; fliesst in den Versatz des Registrierungs-Timers ein
    pub id: i64,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self { id: 1 }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// Bind-Adresse fuer TCP/TLS und UDP
    pub bind_adresse: String,
    /// Port fuer Control (TCP/TLS) und Voice (UDP)
    pub port: u16,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 64738,
        }
    }
}

/// Daten- und TLS-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatenEinstellungen {
    /// Datenverzeichnis (Abbilder, Operationslog, Blobs, Zertifikate)
    pub verzeichnis: String,
    /// TLS-Zertifikat-Pfad (leer = selbstsigniertes Zertifikat erzeugen)
    pub tls_zertifikat: Option<String>,
    /// TLS-Schluessel-Pfad
    pub tls_schluessel: Option<String>,
}

impl Default for DatenEinstellungen {
    fn default() -> Self {
        Self {
            verzeichnis: "daten".into(),
            tls_zertifikat: None,
            tls_schluessel: None,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamische Konfiguration
// ---------------------------------------------------------------------------

/// Standardwerte der dynamischen Schluessel
fn standardwert(schluessel: &str) -> &'static str {
    match schluessel {
        "Address" => "",
        "Port" => "0",
        "MaxUsers" => "1000",
        "MaxBandwidth" => "72000",
        "MaxTextMessageLength" => "5000",
        "MaxImageMessageLength" => "131072",
        "WelcomeText" => "Willkommen auf diesem Raunen-Server.",
        "AllowHTML" => "true",
        "SuperUserPassword" => "",
        "RegisterName" => "",
        _ => "",
    }
}

/// Typisierter Schluessel/Wert-Speicher der Laufzeit-Konfiguration
///
/// Gehoert exklusiv der Steuerschleife; Aenderungen laufen als
/// Konfigurations-Ereignisse durch deren Queue und werden eingefroren.
#[derive(Debug, Clone, Default)]
pub struct Konfiguration {
    werte: HashMap<String, String>,
}

impl Konfiguration {
    /// Erstellt eine leere Konfiguration (alles Standardwerte)
    pub fn neu() -> Self {
        Self {
            werte: HashMap::new(),
        }
    }

    /// Uebernimmt eingefrorene Werte
    pub fn aus_map(werte: HashMap<String, String>) -> Self {
        Self { werte }
    }

    /// Setzt einen Wert
    pub fn setzen(&mut self, schluessel: impl Into<String>, wert: impl Into<String>) {
        self.werte.insert(schluessel.into(), wert.into());
    }

    /// String-Wert mit Standardwert-Fallback
    pub fn zeichenkette(&self, schluessel: &str) -> String {
        self.werte
            .get(schluessel)
            .cloned()
            .unwrap_or_else(|| standardwert(schluessel).to_string())
    }

    /// Ganzzahl-Wert; nicht parsebare Werte fallen auf den Standard zurueck
    pub fn ganzzahl(&self, schluessel: &str) -> i64 {
        self.zeichenkette(schluessel)
            .parse()
            .unwrap_or_else(|_| standardwert(schluessel).parse().unwrap_or(0))
    }

    /// u32-Wert
    pub fn u32_wert(&self, schluessel: &str) -> u32 {
        self.ganzzahl(schluessel).clamp(0, u32::MAX as i64) as u32
    }

    /// Bool-Wert ("true"/"1" sind wahr)
    pub fn bool_wert(&self, schluessel: &str) -> bool {
        matches!(self.zeichenkette(schluessel).as_str(), "true" | "1")
    }

    /// Alle explizit gesetzten Werte (fuer das Abbild)
    pub fn alle(&self) -> &HashMap<String, String> {
        &self.werte
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
