//! Voice-Protokoll (UDP)
//!
//! Definiert die binaeren Datagram-Formate fuer den Voice-Kanal.
//! Der Server leitet die Codec-Nutzdaten unveraendert weiter (SFU-Stil).
//!
//! ## Datagram-Format (verschluesselt)
//!
//! ```text
//! +--------+-----------+-----------+----...----+
//! | IV (1) | Tag (3)   | Chiffrat              |
//! +--------+-----------+-----------+----...----+
//! ```
//!
//! Der Klartext beginnt mit einem 1-Byte-Kopf: obere 3 Bits = Typ,
//! untere 5 Bits = Ziel-Selektor (0 = aktueller Kanal, 1-30 = Fluester-Ziel).
//!
//! ## Probe-Datagram
//!
//! Genau 12 Bytes, umgeht die Verschluesselung:
//! `[Kennung:u32 BE][Nonce:u64 BE]`. Die Antwort ist 24 Bytes:
//! `[Version:u32][Nonce:u64][Benutzer:u32][MaxBenutzer:u32][MaxBandbreite:u32]`,
//! alles big-endian und unverschluesselt.

use std::io;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Maximale Groesse eines Voice-Datagrams
pub const UDP_PAKET_GROESSE: usize = 1024;

/// Laenge eines Probe-Datagrams
pub const PROBE_LAENGE: usize = 12;

/// Gepackte Protokollversion in der Probe-Antwort: 1.2.2
pub const PROTOKOLL_VERSION: u32 = (1 << 16) | (2 << 8) | 2;

// ---------------------------------------------------------------------------
// Paket-Typen
// ---------------------------------------------------------------------------

/// Typ eines Voice-Datagrams (obere 3 Bits des Klartext-Kopfes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PaketTyp {
    /// CELT-Alpha-Bitstream
    CeltAlpha = 0,
    /// UDP-Ping (wird verschluesselt zurueckgesendet)
    Ping = 1,
    /// Speex
    Speex = 2,
    /// CELT-Beta-Bitstream
    CeltBeta = 3,
    /// Opus
    Opus = 4,
}

impl PaketTyp {
    /// Konvertiert die oberen 3 Bits in einen `PaketTyp`
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::CeltAlpha),
            1 => Some(Self::Ping),
            2 => Some(Self::Speex),
            3 => Some(Self::CeltBeta),
            4 => Some(Self::Opus),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SprachKopf
// ---------------------------------------------------------------------------

/// Der 1-Byte-Kopf eines entschluesselten Voice-Frames
///
/// Direkte Bit-Arbeit, kein serde (Hot Path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SprachKopf {
    /// Art des Frames
    pub typ: PaketTyp,
    /// Ziel-Selektor: 0 = aktueller Kanal, 1-30 = Fluester-Ziel
    pub ziel: u8,
}

impl SprachKopf {
    /// Dekodiert den Kopf aus dem ersten Klartext-Byte
    pub fn decode(byte: u8) -> Option<Self> {
        let typ = PaketTyp::from_bits(byte >> 5)?;
        Some(Self {
            typ,
            ziel: byte & 0x1f,
        })
    }

    /// Kodiert den Kopf in ein Byte
    pub fn encode(&self) -> u8 {
        ((self.typ as u8) << 5) | (self.ziel & 0x1f)
    }
}

// ---------------------------------------------------------------------------
// Probe-Datagram
// ---------------------------------------------------------------------------

/// 12-Byte-Anfrage eines Clients vor dem Verbindungsaufbau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAnfrage {
    /// Anfrage-Kennung (vom Client gewaehlt)
    pub kennung: u32,
    /// Client-Nonce, wird in der Antwort gespiegelt
    pub nonce: u64,
}

impl ProbeAnfrage {
    /// Dekodiert eine Probe-Anfrage; `None` wenn die Laenge nicht passt
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != PROBE_LAENGE {
            return None;
        }
        Some(Self {
            kennung: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            nonce: u64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
        })
    }

    /// Kodiert die Anfrage (fuer Tests und Werkzeuge)
    pub fn encode(&self) -> [u8; PROBE_LAENGE] {
        let mut buf = [0u8; PROBE_LAENGE];
        buf[0..4].copy_from_slice(&self.kennung.to_be_bytes());
        buf[4..12].copy_from_slice(&self.nonce.to_be_bytes());
        buf
    }
}

/// 24-Byte-Antwort des Servers auf eine Probe-Anfrage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAntwort {
    pub version: u32,
    /// Gespiegelte Client-Nonce
    pub nonce: u64,
    /// Aktuell verbundene Benutzer
    pub benutzer: u32,
    pub max_benutzer: u32,
    pub max_bandbreite: u32,
}

impl ProbeAntwort {
    /// Groesse der Antwort in Bytes
    pub const SIZE: usize = 24;

    /// Kodiert die Antwort (big-endian, unverschluesselt)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..12].copy_from_slice(&self.nonce.to_be_bytes());
        buf[12..16].copy_from_slice(&self.benutzer.to_be_bytes());
        buf[16..20].copy_from_slice(&self.max_benutzer.to_be_bytes());
        buf[20..24].copy_from_slice(&self.max_bandbreite.to_be_bytes());
        buf
    }

    /// Dekodiert eine Antwort aus einem Byte-Slice
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Probe-Antwort zu kurz: {} Bytes", buf.len()),
            ));
        }
        Ok(Self {
            version: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            nonce: u64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            benutzer: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            max_benutzer: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            max_bandbreite: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprach_kopf_encode_decode() {
        let kopf = SprachKopf {
            typ: PaketTyp::Opus,
            ziel: 0,
        };
        let byte = kopf.encode();
        assert_eq!(byte >> 5, 4);
        assert_eq!(byte & 0x1f, 0);
        assert_eq!(SprachKopf::decode(byte), Some(kopf));
    }

    #[test]
    fn sprach_kopf_fluester_ziel() {
        let kopf = SprachKopf {
            typ: PaketTyp::CeltAlpha,
            ziel: 30,
        };
        let dekodiert = SprachKopf::decode(kopf.encode()).unwrap();
        assert_eq!(dekodiert.ziel, 30);
        assert_eq!(dekodiert.typ, PaketTyp::CeltAlpha);
    }

    #[test]
    fn sprach_kopf_unbekannter_typ() {
        // Typ-Bits 5-7 sind nicht vergeben
        assert!(SprachKopf::decode(0b1110_0000).is_none());
        assert!(SprachKopf::decode(0b1010_0001).is_none());
    }

    #[test]
    fn probe_anfrage_nur_bei_exakter_laenge() {
        let anfrage = ProbeAnfrage {
            kennung: 0,
            nonce: 0xDEAD_BEEF_CAFE_F00D,
        };
        let bytes = anfrage.encode();
        assert_eq!(ProbeAnfrage::decode(&bytes), Some(anfrage));

        // 11 oder 13 Bytes sind keine Probe
        assert!(ProbeAnfrage::decode(&bytes[..11]).is_none());
        let mut lang = bytes.to_vec();
        lang.push(0);
        assert!(ProbeAnfrage::decode(&lang).is_none());
    }

    #[test]
    fn probe_antwort_round_trip() {
        let antwort = ProbeAntwort {
            version: PROTOKOLL_VERSION,
            nonce: 42,
            benutzer: 3,
            max_benutzer: 100,
            max_bandbreite: 72000,
        };
        let bytes = antwort.encode();
        assert_eq!(bytes.len(), ProbeAntwort::SIZE);

        let dekodiert = ProbeAntwort::decode(&bytes).unwrap();
        assert_eq!(dekodiert, antwort);
    }

    #[test]
    fn probe_antwort_spiegelt_nonce() {
        let anfrage = ProbeAnfrage {
            kennung: 1,
            nonce: 0x0123_4567_89AB_CDEF,
        };
        let antwort = ProbeAntwort {
            version: PROTOKOLL_VERSION,
            nonce: anfrage.nonce,
            benutzer: 0,
            max_benutzer: 10,
            max_bandbreite: 72000,
        };
        let bytes = antwort.encode();
        // Nonce liegt bei Offset 4-11, big-endian
        assert_eq!(&bytes[4..12], &anfrage.nonce.to_be_bytes());
    }

    #[test]
    fn protokoll_version_ist_1_2_2() {
        assert_eq!(PROTOKOLL_VERSION >> 16, 1);
        assert_eq!((PROTOKOLL_VERSION >> 8) & 0xff, 2);
        assert_eq!(PROTOKOLL_VERSION & 0xff, 2);
    }
}
