//! TLS-Aufbau fuer den Control-Kanal
//!
//! Laedt Zertifikat und Schluessel aus konfigurierten Pfaden oder erzeugt
//! beim ersten Start ein selbstsigniertes Paar im Datenverzeichnis.
//! Client-Zertifikate werden angefordert, aber nicht verifiziert: der
//! Server verwendet nur den SHA-1-Digest des Blatt-Zertifikats als
//! Identitaetsmerkmal.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls_pemfile::{certs, private_key};
use sha1::{Digest, Sha1};
use tokio_rustls::TlsAcceptor;

/// Dateiname des erzeugten Zertifikats im Datenverzeichnis
const ZERTIFIKAT_DATEI: &str = "zertifikat.pem";
/// Dateiname des erzeugten Schluessels im Datenverzeichnis
const SCHLUESSEL_DATEI: &str = "schluessel.pem";

/// Baut den TLS-Acceptor fuer den Control-Kanal
pub fn acceptor_bauen(
    daten_verzeichnis: &Path,
    zertifikat_pfad: Option<&str>,
    schluessel_pfad: Option<&str>,
) -> anyhow::Result<TlsAcceptor> {
    let (zertifikat_pem, schluessel_pem) = match (zertifikat_pfad, schluessel_pfad) {
        (Some(zertifikat), Some(schluessel)) => (
            std::fs::read_to_string(zertifikat)
                .with_context(|| format!("Zertifikat '{zertifikat}' nicht lesbar"))?,
            std::fs::read_to_string(schluessel)
                .with_context(|| format!("Schluessel '{schluessel}' nicht lesbar"))?,
        ),
        _ => zertifikat_laden_oder_erzeugen(daten_verzeichnis)?,
    };

    let kette = zertifikate_parsen(&zertifikat_pem)?;
    let schluessel = schluessel_parsen(&schluessel_pem)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AlleClientZertifikate))
        .with_single_cert(kette, schluessel)
        .map_err(|e| anyhow::anyhow!("TLS-Konfiguration ungueltig: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Laedt das selbstsignierte Paar aus dem Datenverzeichnis oder erzeugt
/// es beim ersten Start
fn zertifikat_laden_oder_erzeugen(verzeichnis: &Path) -> anyhow::Result<(String, String)> {
    let zertifikat_pfad = verzeichnis.join(ZERTIFIKAT_DATEI);
    let schluessel_pfad = verzeichnis.join(SCHLUESSEL_DATEI);

    if zertifikat_pfad.is_file() && schluessel_pfad.is_file() {
        return Ok((
            std::fs::read_to_string(&zertifikat_pfad)?,
            std::fs::read_to_string(&schluessel_pfad)?,
        ));
    }

    tracing::warn!("Kein TLS-Zertifikat konfiguriert, erzeuge ein selbstsigniertes");

    let mut params = rcgen::CertificateParams::new(vec!["raunen".to_string()])
        .map_err(|e| anyhow::anyhow!("Zertifikat-Parameter ungueltig: {e}"))?;
    let mut name = rcgen::DistinguishedName::new();
    name.push(rcgen::DnType::CommonName, "raunen");
    params.distinguished_name = name;

    let schluessel_paar = rcgen::KeyPair::generate()
        .map_err(|e| anyhow::anyhow!("Schluessel-Erzeugung fehlgeschlagen: {e}"))?;
    let zertifikat = params
        .self_signed(&schluessel_paar)
        .map_err(|e| anyhow::anyhow!("Selbstsignierung fehlgeschlagen: {e}"))?;

    let zertifikat_pem = zertifikat.pem();
    let schluessel_pem = schluessel_paar.serialize_pem();

    std::fs::create_dir_all(verzeichnis)?;
    std::fs::write(&zertifikat_pfad, &zertifikat_pem)?;
    std::fs::write(&schluessel_pfad, &schluessel_pem)?;
    tracing::info!(pfad = %zertifikat_pfad.display(), "Selbstsigniertes Zertifikat abgelegt");

    Ok((zertifikat_pem, schluessel_pem))
}

fn zertifikate_parsen(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    let kette = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Zertifikat-Parsing fehlgeschlagen: {e}"))?;
    if kette.is_empty() {
        anyhow::bail!("PEM enthaelt kein Zertifikat");
    }
    Ok(kette)
}

fn schluessel_parsen(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| anyhow::anyhow!("Schluessel-Parsing fehlgeschlagen: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("PEM enthaelt keinen privaten Schluessel"))
}

/// Berechnet den SHA-1-Digest (hex) eines DER-kodierten Zertifikats
pub fn zertifikat_digest(der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(der);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Client-Zertifikat-Pruefer
// ---------------------------------------------------------------------------

/// Akzeptiert jedes Client-Zertifikat
///
/// Der Server verlangt keine Zertifikatskette zu einer CA; die
/// Identitaet haengt allein am Digest des Blatt-Zertifikats, den die
/// Authentifizierung gegen das Benutzerregister prueft.
#[derive(Debug)]
struct AlleClientZertifikate;

impl ClientCertVerifier for AlleClientZertifikate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn install_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn selbstsigniertes_zertifikat_wird_erzeugt_und_wiederverwendet() {
        install_crypto_provider();
        let verzeichnis = tempfile::tempdir().unwrap();

        let (zertifikat, schluessel) =
            zertifikat_laden_oder_erzeugen(verzeichnis.path()).unwrap();
        assert!(zertifikat.contains("BEGIN CERTIFICATE"));
        assert!(schluessel.contains("PRIVATE KEY"));

        // Zweiter Aufruf liest dasselbe Paar statt neu zu wuerfeln
        let (zertifikat2, _) = zertifikat_laden_oder_erzeugen(verzeichnis.path()).unwrap();
        assert_eq!(zertifikat, zertifikat2);
    }

    #[test]
    fn acceptor_aus_erzeugtem_zertifikat() {
        install_crypto_provider();
        let verzeichnis = tempfile::tempdir().unwrap();
        let acceptor = acceptor_bauen(verzeichnis.path(), None, None);
        assert!(acceptor.is_ok());
    }

    #[test]
    fn digest_ist_sha1_hex() {
        let digest = zertifikat_digest(b"beliebige DER-Bytes");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

        // Deterministisch
        assert_eq!(digest, zertifikat_digest(b"beliebige DER-Bytes"));
        assert_ne!(digest, zertifikat_digest(b"andere Bytes"));
    }
}
