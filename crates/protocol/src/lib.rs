//! raunen-protocol – Wire-Protokoll fuer Control- und Voice-Kanal
//!
//! Dieses Crate implementiert:
//! - Typsichere Control-Nachrichten mit Kind-Diskriminator (`control`)
//! - Frame-Codec fuer den TCP/TLS-Control-Kanal (`wire`)
//! - Binaere Datagram-Formate fuer den Voice-Kanal (`voice`)
//! - OCB2-AES128 Strom-Kryptografie fuer Voice-Frames (`crypto`)

pub mod control;
pub mod crypto;
pub mod voice;
pub mod wire;

// Bequeme Re-Exporte
pub use control::ControlMessage;
pub use crypto::CryptState;
pub use wire::{FrameCodec, WireFrame};
