//! Wire-Format fuer den TCP/TLS-Control-Kanal
//!
//! Frame-basiertes Protokoll: Kind(u16 big-endian) + Laenge(u32 big-endian)
//! + Payload.
//!
//! ## Frame-Format
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+----...----+
//! | Kind (u16 BE)   | Laenge (u32 BE)                   | Payload   |
//! +--------+--------+--------+--------+--------+--------+----...----+
//! ```
//!
//! Die Laenge gibt die Anzahl der Payload-Bytes an (ohne den 6-Byte-Header).
//! Maximale Frame-Groesse ist konfigurierbar (Standard: 8 MB, Texturen
//! koennen gross sein).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::control::ControlMessage;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (8 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Groesse des Frame-Headers in Bytes (Kind + Laenge)
pub const HEADER_SIZE: usize = 6;

// ---------------------------------------------------------------------------
// WireFrame
// ---------------------------------------------------------------------------

/// Ein roher Frame vom Draht: Kind-Diskriminator plus Payload-Bytes
///
/// Die typisierte Dekodierung erfolgt separat via
/// `ControlMessage::decode_payload`, damit unbekannte Kinds verworfen
/// werden koennen ohne den Stream zu beenden.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub kind: u16,
    pub payload: Bytes,
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer den Control-Kanal
///
/// Implementiert `Decoder` (liefert `WireFrame`) und
/// `Encoder<ControlMessage>` fuer die Integration mit
/// `tokio_util::codec::{FramedRead, FramedWrite}`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximale erlaubte Frame-Groesse in Bytes
    max_frame_size: usize,
}

impl FrameCodec {
    /// Erstellt einen neuen `FrameCodec` mit Standard-Limits
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Erstellt einen `FrameCodec` mit benutzerdefinierter maximaler Groesse
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Decoder-Implementierung
// ---------------------------------------------------------------------------

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Warte auf den vollstaendigen Header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Kind und Laenge lesen ohne den Buffer zu veraendern
        let kind = u16::from_be_bytes([src[0], src[1]]);
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if length > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame zu gross: {} Bytes (Maximum: {} Bytes)",
                    length, self.max_frame_size
                ),
            ));
        }

        // Pruefen ob der vollstaendige Frame bereits im Buffer ist
        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(WireFrame { kind, payload }))
    }
}

// ---------------------------------------------------------------------------
// Encoder-Implementierung
// ---------------------------------------------------------------------------

impl Encoder<ControlMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;

        if payload.len() > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Nachricht zu gross: {} Bytes (Maximum: {} Bytes)",
                    payload.len(),
                    self.max_frame_size
                ),
            ));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u16(item.kind());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{kind, Ping};

    fn test_ping(timestamp: u64) -> ControlMessage {
        ControlMessage::Ping(Ping {
            timestamp: Some(timestamp),
            ..Default::default()
        })
    }

    #[test]
    fn frame_codec_encode_decode_round_trip() {
        let mut codec = FrameCodec::new();
        let original = test_ping(999888777);

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();

        // Header pruefen: Kind + Laenge
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), kind::PING);
        let payload_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        assert_eq!(buf.len(), HEADER_SIZE + payload_len);

        let frame = codec
            .decode(&mut buf)
            .unwrap()
            .expect("Muss einen Frame enthalten");
        assert_eq!(frame.kind, kind::PING);

        let nachricht = ControlMessage::decode_payload(frame.kind, &frame.payload)
            .unwrap()
            .unwrap();
        assert_eq!(nachricht, original);
    }

    #[test]
    fn frame_codec_unvollstaendiger_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(test_ping(1), &mut buf).unwrap();

        // Nur die Haelfte der Bytes behalten
        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);

        let result = codec.decode(&mut partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn frame_codec_zu_wenig_bytes_fuer_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x03, 0x00][..]);
        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn frame_codec_ablehnung_zu_grosser_frame() {
        let mut codec = FrameCodec::with_max_size(100);

        let mut buf = BytesMut::new();
        buf.put_u16(kind::PING);
        buf.put_u32(200); // 200 Bytes Payload angekuendigt
        buf.put_slice(&[b'x'; 200]);

        let result = codec.decode(&mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn frame_codec_ablehnung_beim_encode_zu_grosse_nachricht() {
        let mut codec = FrameCodec::with_max_size(4);
        let mut buf = BytesMut::new();
        let result = codec.encode(test_ping(1), &mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn frame_codec_mehrere_nachrichten_im_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        for i in 0..3u64 {
            codec.encode(test_ping(i), &mut buf).unwrap();
        }

        for i in 0..3u64 {
            let frame = codec.decode(&mut buf).unwrap().expect("Frame erwartet");
            let nachricht = ControlMessage::decode_payload(frame.kind, &frame.payload)
                .unwrap()
                .unwrap();
            assert_eq!(nachricht, test_ping(i));
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn unbekanntes_kind_bleibt_als_frame_lesbar() {
        // Ein Frame mit unbekanntem Kind darf den Stream nicht beenden
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(17); // ContextAction: bekanntes, aber unbehandeltes Kind
        buf.put_u32(2);
        buf.put_slice(b"{}");

        let frame = codec.decode(&mut buf).unwrap().expect("Frame erwartet");
        assert_eq!(frame.kind, 17);
        assert!(ControlMessage::decode_payload(frame.kind, &frame.payload)
            .unwrap()
            .is_none());
    }
}
