//! SuperUser-Passwortformat
//!
//! Gespeichert wird `sha1$<hex-salt>$<hex-digest>` mit
//! `digest = sha1(salt_bytes || passwort_utf8)`. Beim Setzen werden
//! 24 zufaellige Salt-Bytes erzeugt; der Digest-Vergleich beim Pruefen
//! laeuft in konstanter Zeit.

use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::error::{AuthError, AuthResult};

/// Laenge des Salts in Bytes
const SALT_LAENGE: usize = 24;

/// Erzeugt einen Eintrag im Format `sha1$<hex-salt>$<hex-digest>`
///
/// Ein Versagen des System-RNG bricht den Prozess ab; mit einem
/// vorhersagbaren Salt darf kein Passwort gespeichert werden.
pub fn passwort_digest_erzeugen(passwort: &str) -> String {
    let mut salt = [0u8; SALT_LAENGE];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(passwort.as_bytes());
    let digest = hasher.finalize();

    format!("sha1${}${}", hex_kodieren(&salt), hex_kodieren(&digest))
}

/// Prueft ein Passwort gegen einen gespeicherten Eintrag
///
/// Gibt `Ok(false)` bei falschem Passwort zurueck und `Err` nur bei einem
/// nicht parsebaren Eintrag.
pub fn passwort_pruefen(passwort: &str, eintrag: &str) -> AuthResult<bool> {
    let teile: Vec<&str> = eintrag.split('$').collect();
    if teile.len() != 3 {
        return Err(AuthError::PasswortFormat(
            "erwartet <algo>$<salt>$<digest>".into(),
        ));
    }
    if teile[0] != "sha1" {
        return Err(AuthError::PasswortFormat(format!(
            "unbekannter Algorithmus '{}'",
            teile[0]
        )));
    }
    if teile[2].is_empty() {
        return Ok(false);
    }

    let mut hasher = Sha1::new();
    if !teile[1].is_empty() {
        let salt = hex_dekodieren(teile[1])
            .ok_or_else(|| AuthError::PasswortFormat("Salt ist kein Hex".into()))?;
        hasher.update(&salt);
    }
    hasher.update(passwort.as_bytes());
    let digest = hasher.finalize();

    let erwartet = hex_dekodieren(teile[2])
        .ok_or_else(|| AuthError::PasswortFormat("Digest ist kein Hex".into()))?;

    // Konstante Vergleichszeit auf dem Digest
    Ok(digest.as_slice().ct_eq(erwartet.as_slice()).into())
}

// ---------------------------------------------------------------------------
// Hex-Hilfen
// ---------------------------------------------------------------------------

/// Kodiert Bytes als Hex-Kleinbuchstaben
pub fn hex_kodieren(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Dekodiert einen Hex-String; `None` bei ungerader Laenge oder
/// ungueltigen Zeichen
pub fn hex_dekodieren(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erzeugen_und_pruefen() {
        let eintrag = passwort_digest_erzeugen("streng_geheim");
        assert!(eintrag.starts_with("sha1$"));
        assert_eq!(eintrag.split('$').count(), 3);

        assert!(passwort_pruefen("streng_geheim", &eintrag).unwrap());
        assert!(!passwort_pruefen("falsch", &eintrag).unwrap());
    }

    #[test]
    fn salt_hat_24_bytes() {
        let eintrag = passwort_digest_erzeugen("x");
        let salt_hex = eintrag.split('$').nth(1).unwrap();
        assert_eq!(salt_hex.len(), 48);
    }

    #[test]
    fn gleiche_passwoerter_verschiedene_eintraege() {
        let a = passwort_digest_erzeugen("gleich");
        let b = passwort_digest_erzeugen("gleich");
        assert_ne!(a, b, "Salt muss die Eintraege unterscheiden");
    }

    #[test]
    fn ungueltiges_format_ist_fehler() {
        assert!(passwort_pruefen("x", "kein_dollar").is_err());
        assert!(passwort_pruefen("x", "md5$aa$bb").is_err());
        assert!(passwort_pruefen("x", "sha1$zz$zz").is_err());
    }

    #[test]
    fn leerer_digest_lehnt_ab() {
        assert!(!passwort_pruefen("x", "sha1$aabb$").unwrap());
    }

    #[test]
    fn bekannter_digest() {
        // sha1("passwort") ohne Salt, unabhaengig vorberechnet
        let digest = {
            let mut h = Sha1::new();
            h.update(b"passwort");
            hex_kodieren(&h.finalize())
        };
        let eintrag = format!("sha1$${digest}");
        assert!(passwort_pruefen("passwort", &eintrag).unwrap());
        assert!(!passwort_pruefen("Passwort", &eintrag).unwrap());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0xff, 0x10, 0xab];
        let hex = hex_kodieren(&bytes);
        assert_eq!(hex, "00ff10ab");
        assert_eq!(hex_dekodieren(&hex).unwrap(), bytes);
        assert!(hex_dekodieren("abc").is_none());
        assert!(hex_dekodieren("zz").is_none());
    }
}
