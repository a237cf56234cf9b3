//! raunen-freezer – Persistenz-Engine
//!
//! Append-only Operationslog plus periodische Voll-Abbilder:
//! - Jede Mutation wird als eine JSON-Zeile an das Protokoll angehaengt
//! - Nach N Operationen schreibt der Server ein vollstaendiges Abbild
//!   (Benutzer, Kanaele, Bans, Konfiguration) und beginnt ein frisches
//!   Protokoll
//! - Beim Start wird das juengste Abbild geladen und das Protokoll
//!   darueber abgespielt
//!
//! Das Crate definiert eigene eingefrorene DTOs; der Server konvertiert
//! an der Grenze.

pub mod abbild;
pub mod error;
pub mod log;

// Bequeme Re-Exporte
pub use abbild::{Abbild, GefrorenerBenutzer, GefrorenerKanal, Operation};
pub use error::{FreezerError, FreezerResult};
pub use log::{abbild_lesen, abbild_schreiben, protokoll_lesen, wiederherstellen, Protokoll};
