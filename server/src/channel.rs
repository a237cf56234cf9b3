//! Kanal-Knoten der Arena
//!
//! Die Eltern-Relation bildet einen gewurzelten Baum; Eltern, Kinder,
//! Verknuepfungen und Mitglieder liegen als ID-Mengen im Knoten, die
//! Arena selbst gehoert exklusiv der Steuerschleife. Baum-Operationen
//! (anlegen, entfernen, verlinken) laufen als `Server`-Methoden unter
//! deren exklusivem Schreibzugriff.

use std::collections::{BTreeSet, HashMap};

use raunen_acl::{AclEintrag, Gruppe};
use raunen_core::{ChannelId, SessionId};
use raunen_freezer::GefrorenerKanal;

/// Ein Kanal im Baum
#[derive(Debug, Clone)]
pub struct Kanal {
    pub id: ChannelId,
    pub name: String,
    /// `None` nur fuer den Root-Kanal
    pub eltern: Option<ChannelId>,
    /// Geordnete Menge der Unterkanaele
    pub kinder: BTreeSet<ChannelId>,
    /// Symmetrische Verknuepfungen (A in B.links <=> B in A.links)
    pub verknuepfungen: BTreeSet<ChannelId>,
    /// Sessions die sich aktuell im Kanal befinden
    pub mitglieder: BTreeSet<SessionId>,
    pub acl: Vec<AclEintrag>,
    pub gruppen: HashMap<String, Gruppe>,
    /// Erbt dieser Kanal die ACLs seiner Eltern?
    pub acl_erben: bool,
    /// Temporaere Kanaele verschwinden beim Leeren und werden nicht
    /// eingefroren
    pub temporaer: bool,
    pub position: i32,
    /// Blob-Digest der Kanalbeschreibung
    pub beschreibung_blob: Option<String>,
}

impl Kanal {
    /// Erstellt einen leeren Kanal
    pub fn neu(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            eltern: None,
            kinder: BTreeSet::new(),
            verknuepfungen: BTreeSet::new(),
            mitglieder: BTreeSet::new(),
            acl: Vec::new(),
            gruppen: HashMap::new(),
            acl_erben: true,
            temporaer: false,
            position: 0,
            beschreibung_blob: None,
        }
    }

    /// Friert den Kanal ein (ohne Mitglieder, die sind fluechtig)
    pub fn einfrieren(&self) -> GefrorenerKanal {
        GefrorenerKanal {
            id: self.id.wert(),
            name: self.name.clone(),
            eltern: self.eltern.map(|e| e.wert()),
            verknuepfungen: self.verknuepfungen.iter().map(|v| v.wert()).collect(),
            acl: self.acl.clone(),
            gruppen: {
                let mut gruppen: Vec<Gruppe> = self.gruppen.values().cloned().collect();
                gruppen.sort_by(|a, b| a.name.cmp(&b.name));
                gruppen
            },
            acl_erben: self.acl_erben,
            position: self.position,
            beschreibung_blob: self.beschreibung_blob.clone(),
        }
    }

    /// Stellt einen Kanal aus dem Abbild wieder her
    ///
    /// Kinder-Mengen setzt der Server nach dem Laden aller Kanaele aus
    /// den Eltern-IDs zusammen.
    pub fn auftauen(gefroren: GefrorenerKanal) -> Self {
        Self {
            id: ChannelId(gefroren.id),
            name: gefroren.name,
            eltern: gefroren.eltern.map(ChannelId),
            kinder: BTreeSet::new(),
            verknuepfungen: gefroren.verknuepfungen.into_iter().map(ChannelId).collect(),
            mitglieder: BTreeSet::new(),
            acl: gefroren.acl,
            gruppen: gefroren
                .gruppen
                .into_iter()
                .map(|g| (g.name.clone(), g))
                .collect(),
            acl_erben: gefroren.acl_erben,
            temporaer: false,
            position: gefroren.position,
            beschreibung_blob: gefroren.beschreibung_blob,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn einfrieren_und_auftauen() {
        let mut kanal = Kanal::neu(ChannelId(4), "Lounge");
        kanal.eltern = Some(ChannelId::ROOT);
        kanal.verknuepfungen.insert(ChannelId(7));
        kanal.position = -2;
        kanal.gruppen.insert("admin".into(), Gruppe::neu("admin"));
        // Mitglieder sind fluechtig und ueberleben das Einfrieren nicht
        kanal.mitglieder.insert(SessionId(9));

        let zurueck = Kanal::auftauen(kanal.einfrieren());
        assert_eq!(zurueck.id, kanal.id);
        assert_eq!(zurueck.name, "Lounge");
        assert_eq!(zurueck.eltern, Some(ChannelId::ROOT));
        assert!(zurueck.verknuepfungen.contains(&ChannelId(7)));
        assert!(zurueck.gruppen.contains_key("admin"));
        assert!(zurueck.mitglieder.is_empty());
    }
}
