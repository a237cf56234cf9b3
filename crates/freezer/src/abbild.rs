//! Eingefrorene Datentypen und das Voll-Abbild
//!
//! Die DTOs sind bewusst flach gehalten: Kanaele liegen als Liste mit
//! Eltern-IDs vor, nicht als Baum. Der Server stellt die Arena beim
//! Laden wieder her.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use raunen_acl::{AclEintrag, Gruppe};
use raunen_auth::Ban;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Eingefrorene registrierte Identitaet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GefrorenerBenutzer {
    pub id: u32,
    pub name: String,
    /// SHA-1-Digest des Zertifikats (hex)
    pub zert_digest: String,
    pub email: String,
    /// Blob-Digest der Textur
    pub textur_blob: Option<String>,
    /// Blob-Digest des Kommentars
    pub kommentar_blob: Option<String>,
    /// Zuletzt besuchter Kanal
    pub letzter_kanal: u32,
    /// Unix-Timestamp der letzten Sitzung
    pub zuletzt_gesehen: i64,
}

/// Eingefrorener Kanal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GefrorenerKanal {
    pub id: u32,
    pub name: String,
    /// `None` nur fuer den Root-Kanal
    pub eltern: Option<u32>,
    /// Symmetrische Verknuepfungen zu anderen Kanaelen
    pub verknuepfungen: Vec<u32>,
    pub acl: Vec<AclEintrag>,
    pub gruppen: Vec<Gruppe>,
    pub acl_erben: bool,
    pub position: i32,
    /// Blob-Digest der Kanalbeschreibung
    pub beschreibung_blob: Option<String>,
}

// ---------------------------------------------------------------------------
// Operationen
// ---------------------------------------------------------------------------

/// Eine einzelne protokollierte Mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    KanalAnlegen { kanal: GefrorenerKanal },
    KanalAktualisieren { kanal: GefrorenerKanal },
    KanalEntfernen { kanal_id: u32 },
    BenutzerAnlegen { benutzer: GefrorenerBenutzer },
    BenutzerAktualisieren { benutzer: GefrorenerBenutzer },
    BenutzerEntfernen { benutzer_id: u32 },
    BanListeSetzen { bans: Vec<Ban> },
    KonfigSetzen { schluessel: String, wert: String },
}

// ---------------------------------------------------------------------------
// Abbild
// ---------------------------------------------------------------------------

/// Vollstaendiges, konsistentes Abbild des Serverzustands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Abbild {
    pub benutzer: Vec<GefrorenerBenutzer>,
    pub kanaele: Vec<GefrorenerKanal>,
    pub bans: Vec<Ban>,
    pub konfiguration: HashMap<String, String>,
    /// Kanal-IDs werden nicht wiederverwendet
    pub naechste_kanal_id: u32,
    pub naechste_benutzer_id: u32,
}

impl Abbild {
    /// Spielt eine protokollierte Operation auf das Abbild ab
    ///
    /// Die Wiederherstellung beim Start faltet so das Protokoll ueber das
    /// juengste Abbild, bevor der Server seine Arena daraus aufbaut.
    pub fn anwenden(&mut self, op: Operation) {
        match op {
            Operation::KanalAnlegen { kanal } => {
                if kanal.id >= self.naechste_kanal_id {
                    self.naechste_kanal_id = kanal.id + 1;
                }
                self.kanaele.retain(|k| k.id != kanal.id);
                self.kanaele.push(kanal);
            }
            Operation::KanalAktualisieren { kanal } => {
                self.kanaele.retain(|k| k.id != kanal.id);
                self.kanaele.push(kanal);
            }
            Operation::KanalEntfernen { kanal_id } => {
                self.kanaele.retain(|k| k.id != kanal_id);
                // Verwaiste Verknuepfungen und Kinder mitraeumen
                for kanal in self.kanaele.iter_mut() {
                    kanal.verknuepfungen.retain(|&id| id != kanal_id);
                }
            }
            Operation::BenutzerAnlegen { benutzer } => {
                if benutzer.id >= self.naechste_benutzer_id {
                    self.naechste_benutzer_id = benutzer.id + 1;
                }
                self.benutzer.retain(|b| b.id != benutzer.id);
                self.benutzer.push(benutzer);
            }
            Operation::BenutzerAktualisieren { benutzer } => {
                self.benutzer.retain(|b| b.id != benutzer.id);
                self.benutzer.push(benutzer);
            }
            Operation::BenutzerEntfernen { benutzer_id } => {
                self.benutzer.retain(|b| b.id != benutzer_id);
            }
            Operation::BanListeSetzen { bans } => {
                self.bans = bans;
            }
            Operation::KonfigSetzen { schluessel, wert } => {
                self.konfiguration.insert(schluessel, wert);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
