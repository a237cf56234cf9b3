//! raunen-auth – Zugangskontrolle
//!
//! Dieses Crate implementiert:
//! - Das SuperUser-Passwortformat `sha1$<hex-salt>$<hex-digest>`
//!   mit konstanter Vergleichszeit (`password`)
//! - Bans mit CIDR-Praefix und Ablaufzeit (`ban`)

pub mod ban;
pub mod error;
pub mod password;

// Bequeme Re-Exporte
pub use ban::{ist_gebannt, Ban};
pub use error::{AuthError, AuthResult};
pub use password::{passwort_digest_erzeugen, passwort_pruefen};
