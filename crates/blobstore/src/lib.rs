//! raunen-blobstore – Inhalts-adressierter Blob-Speicher
//!
//! Blobs (Texturen, Kommentare, Kanalbeschreibungen) werden unter ihrem
//! SHA-1-Digest abgelegt: `<wurzel>/<aa>/<restlicher-digest>`. Schreiben
//! erfolgt atomar ueber eine Temporaerdatei plus Umbenennen; ein bereits
//! vorhandener Blob wird nicht erneut geschrieben.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Result-Alias fuer Blob-Operationen
pub type BlobResult<T> = Result<T, BlobError>;

/// Fehler des Blob-Speichers
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob nicht gefunden: {0}")]
    NichtGefunden(String),

    #[error("Ungueltiger Digest: {0}")]
    UngueltigerDigest(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

/// Inhalts-adressierter Speicher auf der Festplatte
#[derive(Debug, Clone)]
pub struct BlobSpeicher {
    wurzel: PathBuf,
}

impl BlobSpeicher {
    /// Erstellt einen Speicher unter dem angegebenen Wurzelverzeichnis
    pub fn neu(wurzel: impl Into<PathBuf>) -> Self {
        Self {
            wurzel: wurzel.into(),
        }
    }

    /// Berechnet den SHA-1-Digest (hex) eines Inhalts
    pub fn digest(inhalt: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(inhalt);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Legt einen Blob ab und gibt seinen Digest zurueck
    pub fn ablegen(&self, inhalt: &[u8]) -> BlobResult<String> {
        let digest = Self::digest(inhalt);
        let ziel = self.pfad_fuer(&digest)?;

        if ziel.exists() {
            return Ok(digest);
        }

        if let Some(eltern) = ziel.parent() {
            std::fs::create_dir_all(eltern)?;
        }

        let temporaer = ziel.with_extension("neu");
        std::fs::write(&temporaer, inhalt)?;
        std::fs::rename(&temporaer, &ziel)?;

        tracing::debug!(digest = %digest, bytes = inhalt.len(), "Blob abgelegt");
        Ok(digest)
    }

    /// Laedt einen Blob anhand seines Digests
    pub fn holen(&self, digest: &str) -> BlobResult<Vec<u8>> {
        let pfad = self.pfad_fuer(digest)?;
        match std::fs::read(&pfad) {
            Ok(inhalt) => Ok(inhalt),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NichtGefunden(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Prueft ob ein Blob vorhanden ist
    pub fn vorhanden(&self, digest: &str) -> bool {
        self.pfad_fuer(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Zwei-Ebenen-Pfad: `<wurzel>/<aa>/<rest>`
    fn pfad_fuer(&self, digest: &str) -> BlobResult<PathBuf> {
        if digest.len() != 40 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BlobError::UngueltigerDigest(digest.to_string()));
        }
        Ok(self.wurzel.join(&digest[0..2]).join(&digest[2..]))
    }

    /// Wurzelverzeichnis des Speichers
    pub fn wurzel(&self) -> &Path {
        &self.wurzel
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ablegen_und_holen() {
        let verzeichnis = tempfile::tempdir().unwrap();
        let speicher = BlobSpeicher::neu(verzeichnis.path());

        let digest = speicher.ablegen(b"ein bild").unwrap();
        assert_eq!(digest.len(), 40);
        assert!(speicher.vorhanden(&digest));

        let inhalt = speicher.holen(&digest).unwrap();
        assert_eq!(inhalt, b"ein bild");
    }

    #[test]
    fn gleicher_inhalt_gleicher_digest() {
        let verzeichnis = tempfile::tempdir().unwrap();
        let speicher = BlobSpeicher::neu(verzeichnis.path());

        let a = speicher.ablegen(b"inhalt").unwrap();
        let b = speicher.ablegen(b"inhalt").unwrap();
        assert_eq!(a, b);

        let c = speicher.ablegen(b"anderer inhalt").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn fehlender_blob() {
        let verzeichnis = tempfile::tempdir().unwrap();
        let speicher = BlobSpeicher::neu(verzeichnis.path());

        let digest = BlobSpeicher::digest(b"nie abgelegt");
        assert!(!speicher.vorhanden(&digest));
        assert!(matches!(
            speicher.holen(&digest),
            Err(BlobError::NichtGefunden(_))
        ));
    }

    #[test]
    fn ungueltiger_digest_wird_abgelehnt() {
        let verzeichnis = tempfile::tempdir().unwrap();
        let speicher = BlobSpeicher::neu(verzeichnis.path());

        assert!(matches!(
            speicher.holen("zu_kurz"),
            Err(BlobError::UngueltigerDigest(_))
        ));
        assert!(matches!(
            speicher.holen("../../etc/passwd/../../../../aaaaaaaa"),
            Err(BlobError::UngueltigerDigest(_))
        ));
    }

    #[test]
    fn zwei_ebenen_ablage() {
        let verzeichnis = tempfile::tempdir().unwrap();
        let speicher = BlobSpeicher::neu(verzeichnis.path());

        let digest = speicher.ablegen(b"fan-out").unwrap();
        let erwartet = verzeichnis
            .path()
            .join(&digest[0..2])
            .join(&digest[2..]);
        assert!(erwartet.is_file());
    }
}
