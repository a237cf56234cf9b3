//! raunen-acl – Zugriffskontrolle fuer den Kanalbaum
//!
//! Dieses Crate implementiert:
//! - Die Berechtigungs-Bitmaske (`permission`)
//! - ACL-Eintraege und benannte Gruppen mit Vererbung (`types`)
//! - Den Resolver, der eine Eltern-Kette von der Wurzel zum Zielkanal
//!   auswertet (`resolver`)
//! - Den groben Berechtigungs-Cache mit Praesenz-Bit (`cache`)
//!
//! Der Resolver arbeitet auf einer vom Aufrufer zusammengestellten Kette
//! von Kanal-Sichten und bleibt damit frei von der Kanal-Arena des Servers.

pub mod cache;
pub mod permission;
pub mod resolver;
pub mod types;

// Bequeme Re-Exporte
pub use cache::PermissionCache;
pub use permission::Berechtigung;
pub use resolver::{berechtigungen, ist_gruppen_mitglied, Anfrager, KettenGlied};
pub use types::{AclEintrag, Gruppe};
