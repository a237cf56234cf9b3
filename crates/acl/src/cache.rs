//! Berechtigungs-Cache
//!
//! Memoisiert die vom Resolver berechneten Masken pro (Session, Kanal).
//! Jeder Eintrag traegt das Praesenz-Bit `Berechtigung::CACHED`; ein Lesen
//! ohne vorherige Befuellung liefert 0 und laesst sich damit vom Aufrufer
//! als Integritaetsverletzung erkennen.
//!
//! Die Invalidierung ist bewusst grob: jede ACL-relevante Mutation
//! (Kanalbaum, ACLs, Gruppen, Tokens, Benutzer-Entfernung) leert den
//! gesamten Cache.

use std::collections::HashMap;

use raunen_core::{ChannelId, SessionId};

use crate::permission::Berechtigung;

/// Cache der effektiven Berechtigungs-Masken
#[derive(Debug, Default)]
pub struct PermissionCache {
    eintraege: HashMap<(SessionId, ChannelId), u32>,
}

impl PermissionCache {
    /// Erstellt einen leeren Cache
    pub fn neu() -> Self {
        Self {
            eintraege: HashMap::new(),
        }
    }

    /// Legt eine berechnete Maske ab (setzt das Praesenz-Bit)
    pub fn setzen(&mut self, session: SessionId, kanal: ChannelId, maske: u32) {
        self.eintraege
            .insert((session, kanal), maske | Berechtigung::CACHED);
    }

    /// Liest die Maske inklusive Praesenz-Bit; 0 wenn nicht vorhanden
    pub fn lesen(&self, session: SessionId, kanal: ChannelId) -> u32 {
        self.eintraege
            .get(&(session, kanal))
            .copied()
            .unwrap_or(0)
    }

    /// Leert den gesamten Cache (grobe Invalidierung)
    pub fn leeren(&mut self) {
        if !self.eintraege.is_empty() {
            tracing::trace!(eintraege = self.eintraege.len(), "Berechtigungs-Cache geleert");
        }
        self.eintraege.clear();
    }

    /// Anzahl der gecachten Eintraege
    pub fn len(&self) -> usize {
        self.eintraege.len()
    }

    /// Ist der Cache leer?
    pub fn is_empty(&self) -> bool {
        self.eintraege.is_empty()
    }
}
