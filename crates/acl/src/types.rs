//! ACL-Eintraege und benannte Gruppen
//!
//! Beide Typen haengen an einem Kanal und werden mit ihm eingefroren
//! (serde). Die Auswertung erfolgt im `resolver`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use raunen_core::UserId;

/// Ein einzelner ACL-Eintrag eines Kanals
///
/// Ein Eintrag adressiert entweder einen registrierten Benutzer
/// (`benutzer_id`) oder eine Gruppe ueber ihren Namen. Gruppen-Namen
/// verstehen die Praefixe `!` (negieren), `~` (im ACL-Kanal statt im
/// Zielkanal auswerten), `#` (Access-Token) und `$` (Zertifikats-Digest)
/// sowie die eingebauten Gruppen `all`, `auth`, `in`, `out` und `none`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEintrag {
    /// Adressierter Benutzer; `None` wenn der Eintrag eine Gruppe meint
    pub benutzer_id: Option<UserId>,
    /// Adressierte Gruppe (leer wenn `benutzer_id` gesetzt)
    pub gruppe: String,
    /// Gilt der Eintrag im Kanal selbst?
    pub hier: bool,
    /// Gilt der Eintrag in Unterkanaelen?
    pub unterkanaele: bool,
    /// Additiv gewaehrte Bits
    pub erlauben: u32,
    /// Entzogene Bits (gewinnen gegen `erlauben` desselben Eintrags)
    pub verweigern: u32,
}

impl AclEintrag {
    /// Eintrag fuer eine Gruppe
    pub fn fuer_gruppe(gruppe: impl Into<String>, erlauben: u32, verweigern: u32) -> Self {
        Self {
            benutzer_id: None,
            gruppe: gruppe.into(),
            hier: true,
            unterkanaele: true,
            erlauben,
            verweigern,
        }
    }

    /// Eintrag fuer einen einzelnen Benutzer
    pub fn fuer_benutzer(benutzer_id: UserId, erlauben: u32, verweigern: u32) -> Self {
        Self {
            benutzer_id: Some(benutzer_id),
            gruppe: String::new(),
            hier: true,
            unterkanaele: true,
            erlauben,
            verweigern,
        }
    }
}

/// Benannte Gruppe eines Kanals
///
/// Mitgliedschaft vererbt sich entlang des Kanalbaums: `erben` zieht die
/// Mitglieder der gleichnamigen Gruppe des Elternkanals heran, `vererbbar`
/// erlaubt Unterkanaelen das Erben. Temporaere Mitglieder gelten nur im
/// definierenden Kanal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gruppe {
    pub name: String,
    /// Mitglieder der gleichnamigen Elterngruppe uebernehmen
    pub erben: bool,
    /// Duerfen Unterkanaele diese Gruppe erben?
    pub vererbbar: bool,
    /// Explizit aufgenommene Benutzer
    pub hinzu: BTreeSet<u32>,
    /// Explizit ausgeschlossene Benutzer (gewinnt gegen alles)
    pub entfernt: BTreeSet<u32>,
    /// Temporaere Mitglieder, nicht vererbt und nicht eingefroren
    #[serde(skip)]
    pub temporaer: BTreeSet<u32>,
}

impl Gruppe {
    /// Erstellt eine leere Gruppe mit Standard-Vererbung
    pub fn neu(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            erben: true,
            vererbbar: true,
            hinzu: BTreeSet::new(),
            entfernt: BTreeSet::new(),
            temporaer: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eintrag_konstruktoren() {
        let g = AclEintrag::fuer_gruppe("admin", 0xff, 0);
        assert!(g.benutzer_id.is_none());
        assert_eq!(g.gruppe, "admin");
        assert!(g.hier && g.unterkanaele);

        let b = AclEintrag::fuer_benutzer(UserId(5), 0, 0x4);
        assert_eq!(b.benutzer_id, Some(UserId(5)));
        assert!(b.gruppe.is_empty());
    }

    #[test]
    fn temporaere_mitglieder_nicht_eingefroren() {
        let mut gruppe = Gruppe::neu("gaeste");
        gruppe.hinzu.insert(1);
        gruppe.temporaer.insert(2);

        let json = serde_json::to_string(&gruppe).unwrap();
        let zurueck: Gruppe = serde_json::from_str(&json).unwrap();
        assert!(zurueck.hinzu.contains(&1));
        assert!(zurueck.temporaer.is_empty());
    }
}
