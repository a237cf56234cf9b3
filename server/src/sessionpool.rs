//! Session-ID-Pool
//!
//! Vergibt eindeutige 32-Bit-Session-IDs und nimmt sie beim
//! Verbindungsende wieder zurueck. Zurueckgegebene IDs werden vor neuen
//! IDs wiederverwendet; die ID 0 wird nie vergeben.

use raunen_core::SessionId;

/// Pool wiederverwendbarer Session-IDs
#[derive(Debug)]
pub struct SessionPool {
    naechste: u32,
    frei: Vec<u32>,
}

impl SessionPool {
    /// Erstellt einen leeren Pool
    pub fn neu() -> Self {
        Self {
            naechste: 1,
            frei: Vec::new(),
        }
    }

    /// Holt eine freie Session-ID
    pub fn holen(&mut self) -> SessionId {
        if let Some(id) = self.frei.pop() {
            return SessionId(id);
        }
        let id = self.naechste;
        self.naechste += 1;
        SessionId(id)
    }

    /// Gibt eine Session-ID zur Wiederverwendung zurueck
    pub fn zurueckgeben(&mut self, id: SessionId) {
        debug_assert!(id.wert() != 0 && id.wert() < self.naechste);
        self.frei.push(id.wert());
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::neu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_beginnen_bei_eins() {
        let mut pool = SessionPool::neu();
        assert_eq!(pool.holen(), SessionId(1));
        assert_eq!(pool.holen(), SessionId(2));
    }

    #[test]
    fn zurueckgegebene_ids_werden_wiederverwendet() {
        let mut pool = SessionPool::neu();
        let a = pool.holen();
        let b = pool.holen();
        pool.zurueckgeben(a);

        assert_eq!(pool.holen(), a);
        assert_ne!(pool.holen(), b, "b ist noch vergeben");
    }

    #[test]
    fn eindeutig_solange_vergeben() {
        let mut pool = SessionPool::neu();
        let ids: Vec<SessionId> = (0..100).map(|_| pool.holen()).collect();
        let mut sortiert: Vec<u32> = ids.iter().map(|s| s.wert()).collect();
        sortiert.sort_unstable();
        sortiert.dedup();
        assert_eq!(sortiert.len(), 100);
    }
}
