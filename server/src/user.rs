//! Registrierte Benutzer
//!
//! Eine registrierte Identitaet ist ueber ID, Zertifikats-Digest und
//! Namen auffindbar; die Indizes dazu haelt der Server. Registrierung
//! setzt einen nicht-leeren Zertifikats-Digest voraus.

use raunen_core::{ChannelId, UserId};
use raunen_freezer::GefrorenerBenutzer;

/// Eine registrierte Identitaet
#[derive(Debug, Clone, PartialEq)]
pub struct Benutzer {
    pub id: UserId,
    pub name: String,
    /// SHA-1-Digest des Zertifikats (hex); leer nur fuer den SuperUser
    pub zert_digest: String,
    pub email: String,
    /// Blob-Digest der Textur
    pub textur_blob: Option<String>,
    /// Blob-Digest des Kommentars
    pub kommentar_blob: Option<String>,
    /// Zuletzt besuchter Kanal
    pub letzter_kanal: ChannelId,
    /// Unix-Timestamp der letzten Sitzung
    pub zuletzt_gesehen: i64,
}

impl Benutzer {
    /// Erstellt eine frische Identitaet
    pub fn neu(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            zert_digest: String::new(),
            email: String::new(),
            textur_blob: None,
            kommentar_blob: None,
            letzter_kanal: ChannelId::ROOT,
            zuletzt_gesehen: 0,
        }
    }

    /// Hat der Benutzer eine Textur?
    pub fn hat_textur(&self) -> bool {
        self.textur_blob.is_some()
    }

    /// Hat der Benutzer einen Kommentar?
    pub fn hat_kommentar(&self) -> bool {
        self.kommentar_blob.is_some()
    }

    /// Friert die Identitaet ein
    pub fn einfrieren(&self) -> GefrorenerBenutzer {
        GefrorenerBenutzer {
            id: self.id.wert(),
            name: self.name.clone(),
            zert_digest: self.zert_digest.clone(),
            email: self.email.clone(),
            textur_blob: self.textur_blob.clone(),
            kommentar_blob: self.kommentar_blob.clone(),
            letzter_kanal: self.letzter_kanal.wert(),
            zuletzt_gesehen: self.zuletzt_gesehen,
        }
    }

    /// Stellt eine Identitaet aus dem Abbild wieder her
    pub fn auftauen(gefroren: GefrorenerBenutzer) -> Self {
        Self {
            id: UserId(gefroren.id),
            name: gefroren.name,
            zert_digest: gefroren.zert_digest,
            email: gefroren.email,
            textur_blob: gefroren.textur_blob,
            kommentar_blob: gefroren.kommentar_blob,
            letzter_kanal: ChannelId(gefroren.letzter_kanal),
            zuletzt_gesehen: gefroren.zuletzt_gesehen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn einfrieren_und_auftauen() {
        let mut benutzer = Benutzer::neu(UserId(3), "alice");
        benutzer.zert_digest = "abcd".into();
        benutzer.textur_blob = Some("ff".repeat(20));
        benutzer.letzter_kanal = ChannelId(2);

        let zurueck = Benutzer::auftauen(benutzer.einfrieren());
        assert_eq!(zurueck, benutzer);
    }

    #[test]
    fn frische_identitaet() {
        let benutzer = Benutzer::neu(UserId(1), "bob");
        assert!(!benutzer.hat_textur());
        assert!(!benutzer.hat_kommentar());
        assert_eq!(benutzer.letzter_kanal, ChannelId::ROOT);
    }
}
