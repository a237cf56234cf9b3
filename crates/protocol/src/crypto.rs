//! Voice-Frame-Kryptografie (OCB2-AES128)
//!
//! Jede Session besitzt einen `CryptState` mit rohem 16-Byte-Schluessel und
//! zwei 16-Byte-Nonces (Senden/Empfangen). Jedes Datagram traegt einen
//! 4-Byte-Kopf: 1 Byte laufende Nonce plus 3 Byte Authentifizierungs-Tag,
//! das Chiffrat ist damit genau 4 Bytes laenger als der Klartext.
//!
//! Die Empfangsseite toleriert verlorene und verspaetete Datagramme in
//! einem Fenster von 30 Paketen und erkennt Wiederholungen ueber eine
//! 256-Eintraege-Historie. Laesst sich die Nonce nicht mehr rekonstruieren,
//! fordert der Aufrufer einen Resync an (CryptSetup-Nachricht).
//!
//! Schluessel und Nonces werden genau einmal nach der Authentifizierung
//! via `CryptSetup` uebertragen.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// AES-Blockgroesse, zugleich Schluessel- und Nonce-Groesse
pub const BLOCK_GROESSE: usize = 16;

/// Zusaetzliche Bytes pro Datagram (1 Byte Nonce + 3 Byte Tag)
pub const KOPF_GROESSE: usize = 4;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

/// Fehler beim Entschluesseln eines Voice-Frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KryptoFehler {
    #[error("Datagram zu kurz: {0} Bytes")]
    ZuKurz(usize),

    #[error("Zielpuffer hat falsche Groesse")]
    PufferGroesse,

    #[error("Nonce ausserhalb des Toleranzfensters")]
    NonceVerloren,

    #[error("Wiederholtes Datagram (Replay)")]
    Wiederholung,

    #[error("Authentifizierungs-Tag ungueltig")]
    TagUngueltig,
}

// ---------------------------------------------------------------------------
// CryptState
// ---------------------------------------------------------------------------

/// Kryptografischer Zustand einer Voice-Verbindung
///
/// Sende- und Empfangsrichtung teilen sich den Schluessel, verwenden aber
/// getrennte Nonces. Die Statistikzaehler speisen die Ping-Antworten und
/// UserStats.
pub struct CryptState {
    /// Roher AES-128-Schluessel
    pub raw_key: [u8; BLOCK_GROESSE],
    /// Nonce der Senderichtung (Server -> Client)
    pub encrypt_iv: [u8; BLOCK_GROESSE],
    /// Nonce der Empfangsrichtung (Client -> Server)
    pub decrypt_iv: [u8; BLOCK_GROESSE],

    /// Replay-Historie: zweites Nonce-Byte je erstem Nonce-Byte
    decrypt_history: [u8; 256],

    cipher: Aes128,

    // Statistik der Empfangsrichtung
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

impl CryptState {
    /// Erstellt einen Zustand mit Null-Schluessel und Null-Nonces
    ///
    /// Vor der Verwendung muss `generate_key` oder `set_key` gerufen werden.
    pub fn new() -> Self {
        let raw_key = [0u8; BLOCK_GROESSE];
        Self {
            raw_key,
            encrypt_iv: [0u8; BLOCK_GROESSE],
            decrypt_iv: [0u8; BLOCK_GROESSE],
            decrypt_history: [0u8; 256],
            cipher: Aes128::new(GenericArray::from_slice(&raw_key)),
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
        }
    }

    /// Wuerfelt Schluessel und beide Nonces neu
    ///
    /// Ein Versagen des System-RNG bricht den Prozess ab; mit einem
    /// vorhersagbaren Schluessel darf der Server nicht weiterlaufen.
    pub fn generate_key(&mut self) {
        let mut rng = rand::rngs::OsRng;
        rng.fill_bytes(&mut self.raw_key);
        rng.fill_bytes(&mut self.encrypt_iv);
        rng.fill_bytes(&mut self.decrypt_iv);
        self.cipher = Aes128::new(GenericArray::from_slice(&self.raw_key));
        self.decrypt_history = [0u8; 256];
    }

    /// Setzt Schluessel und Nonces explizit (Gegenstelle/Tests)
    pub fn set_key(
        &mut self,
        key: [u8; BLOCK_GROESSE],
        encrypt_iv: [u8; BLOCK_GROESSE],
        decrypt_iv: [u8; BLOCK_GROESSE],
    ) {
        self.raw_key = key;
        self.encrypt_iv = encrypt_iv;
        self.decrypt_iv = decrypt_iv;
        self.cipher = Aes128::new(GenericArray::from_slice(&self.raw_key));
        self.decrypt_history = [0u8; 256];
    }

    /// Uebernimmt eine neue Empfangs-Nonce (Resync-Antwort des Clients)
    pub fn set_decrypt_iv(&mut self, iv: [u8; BLOCK_GROESSE]) {
        self.decrypt_iv = iv;
        self.resync += 1;
    }

    /// Verschluesselt `quelle` nach `ziel`
    ///
    /// `ziel` muss genau `quelle.len() + 4` Bytes fassen. Die Sende-Nonce
    /// wird vor jedem Frame inkrementiert.
    pub fn encrypt(&mut self, ziel: &mut [u8], quelle: &[u8]) {
        debug_assert_eq!(ziel.len(), quelle.len() + KOPF_GROESSE);

        // Sende-Nonce als 128-Bit-Zaehler erhoehen
        for byte in self.encrypt_iv.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte > 0 {
                break;
            }
        }

        let mut tag = [0u8; BLOCK_GROESSE];
        let iv = self.encrypt_iv;
        self.ocb_encrypt(quelle, &mut ziel[KOPF_GROESSE..], &iv, &mut tag);

        ziel[0] = self.encrypt_iv[0];
        ziel[1..KOPF_GROESSE].copy_from_slice(&tag[0..3]);
    }

    /// Entschluesselt `quelle` nach `ziel`
    ///
    /// `ziel` muss genau `quelle.len() - 4` Bytes fassen. Rekonstruiert die
    /// Empfangs-Nonce aus dem ersten Byte; verspaetete Datagramme in einem
    /// Fenster von 30 Paketen werden akzeptiert, Wiederholungen abgelehnt.
    pub fn decrypt(&mut self, ziel: &mut [u8], quelle: &[u8]) -> Result<(), KryptoFehler> {
        if quelle.len() < KOPF_GROESSE {
            return Err(KryptoFehler::ZuKurz(quelle.len()));
        }
        if ziel.len() != quelle.len() - KOPF_GROESSE {
            return Err(KryptoFehler::PufferGroesse);
        }

        let gesicherte_iv = self.decrypt_iv;
        let iv_byte = quelle[0];
        let mut wiederherstellen = false;
        let mut verspaetet = 0u32;
        let mut verloren = 0i32;

        if self.decrypt_iv[0].wrapping_add(1) == iv_byte {
            // Erwartete Reihenfolge
            if iv_byte > self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] {
                // Das erste Byte ist uebergelaufen: Uebertrag weiterreichen
                self.decrypt_iv[0] = iv_byte;
                for byte in self.decrypt_iv.iter_mut().skip(1) {
                    *byte = byte.wrapping_add(1);
                    if *byte > 0 {
                        break;
                    }
                }
            } else {
                return Err(KryptoFehler::NonceVerloren);
            }
        } else {
            // Ausser der Reihe oder Wiederholung
            let mut diff = iv_byte as i32 - self.decrypt_iv[0] as i32;
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if iv_byte < self.decrypt_iv[0] && diff > -30 && diff < 0 {
                // Verspaetet, ohne Ueberlauf
                verspaetet = 1;
                verloren = -1;
                self.decrypt_iv[0] = iv_byte;
                wiederherstellen = true;
            } else if iv_byte > self.decrypt_iv[0] && diff > -30 && diff < 0 {
                // Verspaetet aus der vorherigen 256er-Runde: Uebertrag zurueck
                verspaetet = 1;
                verloren = -1;
                self.decrypt_iv[0] = iv_byte;
                for byte in self.decrypt_iv.iter_mut().skip(1) {
                    *byte = byte.wrapping_sub(1);
                    if *byte != 0xff {
                        break;
                    }
                }
                wiederherstellen = true;
            } else if iv_byte > self.decrypt_iv[0] && diff > 0 {
                // Einige Pakete verloren, sonst in Ordnung
                verloren = iv_byte as i32 - self.decrypt_iv[0] as i32 - 1;
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] && diff > 0 {
                // Pakete verloren und dabei uebergelaufen
                verloren = 256 - self.decrypt_iv[0] as i32 + iv_byte as i32 - 1;
                self.decrypt_iv[0] = iv_byte;
                for byte in self.decrypt_iv.iter_mut().skip(1) {
                    *byte = byte.wrapping_add(1);
                    if *byte > 0 {
                        break;
                    }
                }
            } else {
                self.decrypt_iv = gesicherte_iv;
                return Err(KryptoFehler::NonceVerloren);
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = gesicherte_iv;
                return Err(KryptoFehler::Wiederholung);
            }
        }

        let mut tag = [0u8; BLOCK_GROESSE];
        let iv = self.decrypt_iv;
        self.ocb_decrypt(&quelle[KOPF_GROESSE..], ziel, &iv, &mut tag);

        if tag[0..3] != quelle[1..KOPF_GROESSE] {
            self.decrypt_iv = gesicherte_iv;
            return Err(KryptoFehler::TagUngueltig);
        }
        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if wiederherstellen {
            self.decrypt_iv = gesicherte_iv;
        }

        self.good += 1;
        self.late += verspaetet;
        // Ein verspaetet eingetroffenes Datagram hebt einen zuvor
        // gezaehlten Verlust wieder auf
        if verloren > 0 {
            self.lost += verloren as u32;
        } else if verloren < 0 {
            self.lost = self.lost.saturating_sub((-verloren) as u32);
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // OCB2-Kern
    // -----------------------------------------------------------------------

    fn block_encrypt(&self, block: &mut [u8; BLOCK_GROESSE]) {
        let ga = GenericArray::from_mut_slice(block);
        self.cipher.encrypt_block(ga);
    }

    fn block_decrypt(&self, block: &mut [u8; BLOCK_GROESSE]) {
        let ga = GenericArray::from_mut_slice(block);
        self.cipher.decrypt_block(ga);
    }

    fn ocb_encrypt(
        &self,
        klar: &[u8],
        chiffrat: &mut [u8],
        nonce: &[u8; BLOCK_GROESSE],
        tag: &mut [u8; BLOCK_GROESSE],
    ) {
        let mut delta = *nonce;
        self.block_encrypt(&mut delta);

        let mut pruefsumme = [0u8; BLOCK_GROESSE];
        let mut tmp = [0u8; BLOCK_GROESSE];

        let mut offset = 0usize;
        let mut rest = klar.len();

        while rest > BLOCK_GROESSE {
            zeiten_zwei(&mut delta);
            xor_in(&mut tmp, &delta, &klar[offset..offset + BLOCK_GROESSE]);
            self.block_encrypt(&mut tmp);
            xor_in(
                &mut chiffrat[offset..offset + BLOCK_GROESSE],
                &delta,
                &tmp,
            );
            xor_auf(&mut pruefsumme, &klar[offset..offset + BLOCK_GROESSE]);
            offset += BLOCK_GROESSE;
            rest -= BLOCK_GROESSE;
        }

        // Letzter (moeglicherweise unvollstaendiger) Block
        zeiten_zwei(&mut delta);
        tmp = [0u8; BLOCK_GROESSE];
        let bits = (rest * 8) as u32;
        tmp[BLOCK_GROESSE - 2] = ((bits >> 8) & 0xff) as u8;
        tmp[BLOCK_GROESSE - 1] = (bits & 0xff) as u8;
        xor_auf(&mut tmp, &delta);

        let mut pad = tmp;
        self.block_encrypt(&mut pad);

        tmp = [0u8; BLOCK_GROESSE];
        tmp[..rest].copy_from_slice(&klar[offset..offset + rest]);
        tmp[rest..].copy_from_slice(&pad[rest..]);
        xor_auf(&mut pruefsumme, &tmp);
        xor_auf(&mut tmp, &pad);
        chiffrat[offset..offset + rest].copy_from_slice(&tmp[..rest]);

        zeiten_drei(&mut delta);
        let mut t = [0u8; BLOCK_GROESSE];
        xor_in(&mut t, &delta, &pruefsumme);
        self.block_encrypt(&mut t);
        *tag = t;
    }

    fn ocb_decrypt(
        &self,
        chiffrat: &[u8],
        klar: &mut [u8],
        nonce: &[u8; BLOCK_GROESSE],
        tag: &mut [u8; BLOCK_GROESSE],
    ) {
        let mut delta = *nonce;
        self.block_encrypt(&mut delta);

        let mut pruefsumme = [0u8; BLOCK_GROESSE];
        let mut tmp = [0u8; BLOCK_GROESSE];

        let mut offset = 0usize;
        let mut rest = chiffrat.len();

        while rest > BLOCK_GROESSE {
            zeiten_zwei(&mut delta);
            xor_in(&mut tmp, &delta, &chiffrat[offset..offset + BLOCK_GROESSE]);
            self.block_decrypt(&mut tmp);
            xor_in(&mut klar[offset..offset + BLOCK_GROESSE], &delta, &tmp);
            xor_auf(&mut pruefsumme, &klar[offset..offset + BLOCK_GROESSE]);
            offset += BLOCK_GROESSE;
            rest -= BLOCK_GROESSE;
        }

        zeiten_zwei(&mut delta);
        tmp = [0u8; BLOCK_GROESSE];
        let bits = (rest * 8) as u32;
        tmp[BLOCK_GROESSE - 2] = ((bits >> 8) & 0xff) as u8;
        tmp[BLOCK_GROESSE - 1] = (bits & 0xff) as u8;
        xor_auf(&mut tmp, &delta);

        let mut pad = tmp;
        self.block_encrypt(&mut pad);

        tmp = [0u8; BLOCK_GROESSE];
        tmp[..rest].copy_from_slice(&chiffrat[offset..offset + rest]);
        xor_auf(&mut tmp, &pad);
        xor_auf(&mut pruefsumme, &tmp);
        klar[offset..offset + rest].copy_from_slice(&tmp[..rest]);

        zeiten_drei(&mut delta);
        let mut t = [0u8; BLOCK_GROESSE];
        xor_in(&mut t, &delta, &pruefsumme);
        self.block_encrypt(&mut t);
        *tag = t;
    }
}

impl Default for CryptState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Schluesselmaterial nicht ins Log
        f.debug_struct("CryptState")
            .field("good", &self.good)
            .field("late", &self.late)
            .field("lost", &self.lost)
            .field("resync", &self.resync)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GF(2^128)-Hilfsfunktionen
// ---------------------------------------------------------------------------

/// Multiplikation mit 2 in GF(2^128) (Polynom x^128 + x^7 + x^2 + x + 1)
fn zeiten_zwei(block: &mut [u8; BLOCK_GROESSE]) {
    let uebertrag = (block[0] >> 7) & 0x1;
    for i in 0..BLOCK_GROESSE - 1 {
        block[i] = (block[i] << 1) | ((block[i + 1] >> 7) & 0x1);
    }
    block[BLOCK_GROESSE - 1] = (block[BLOCK_GROESSE - 1] << 1) ^ (uebertrag * 135);
}

/// Multiplikation mit 3 in GF(2^128): times3(x) = times2(x) ^ x
fn zeiten_drei(block: &mut [u8; BLOCK_GROESSE]) {
    let uebertrag = (block[0] >> 7) & 0x1;
    for i in 0..BLOCK_GROESSE - 1 {
        block[i] ^= (block[i] << 1) | ((block[i + 1] >> 7) & 0x1);
    }
    block[BLOCK_GROESSE - 1] ^= (block[BLOCK_GROESSE - 1] << 1) ^ (uebertrag * 135);
}

/// `ziel = a ^ b`
fn xor_in(ziel: &mut [u8], a: &[u8], b: &[u8]) {
    for i in 0..ziel.len() {
        ziel[i] = a[i] ^ b[i];
    }
}

/// `ziel ^= quelle`
fn xor_auf(ziel: &mut [u8], quelle: &[u8]) {
    for i in 0..ziel.len().min(quelle.len()) {
        ziel[i] ^= quelle[i];
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
