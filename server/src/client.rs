//! Client-Session
//!
//! Jede akzeptierte Verbindung bekommt eine `Client`-Struktur, deren
//! veraenderliche Felder exklusiv der Steuerschleife gehoeren, und drei
//! Fibers mit disjunktem Zustand:
//!
//! - **Leser**: liest Frames vom Stream und reiht dekodierte Nachrichten
//!   in die Ereignis-Queue des Servers ein
//! - **Schreiber**: entleert die unbegrenzte Sende-Queue der Session und
//!   schreibt Frames sequentiell (FIFO-Garantie pro Empfaenger)
//! - **Datagram-Fiber**: erhaelt vom Empfangs-Task entschluesselte
//!   Frames, beantwortet UDP-Pings und reicht Sprach-Frames an die
//!   Sprach-Queue des Servers weiter
//!
//! Fibers kommunizieren ausschliesslich ueber Queues. Das Beenden laeuft
//! ueber einen watch-Kanal plus Schliessen der Sende-Queue; jede Fiber
//! beendet sich innerhalb eines ausstehenden IO.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use raunen_core::{ChannelId, ClientZustand, SessionId};
use raunen_protocol::control::{ControlMessage, PaketStatistik, VoiceTargetZiel};
use raunen_protocol::crypto::CryptState;
use raunen_protocol::voice::{PaketTyp, SprachKopf};
use raunen_protocol::wire::FrameCodec;

use crate::server::{ServerEreignis, SprachPaket};
use crate::udp::{DatagrammEingang, HostEintrag, ResyncAnforderung, UdpNachricht, UdpZiel};

/// Groesse der Datagram-Queue pro Session (Frames)
const DATAGRAMM_QUEUE_GROESSE: usize = 64;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Zustand einer Client-Session
///
/// Alle Felder werden nur von der Steuerschleife geschrieben; die
/// dokumentierten Ausnahmen (`crypt`, `udp_adresse`) teilen sich
/// Steuerschleife und Datagram-Transport ueber kurze Sperren.
pub struct Client {
    pub session: SessionId,
    pub tcp_adresse: SocketAddr,
    /// Vom Empfangs-Task beim ersten Datagram-Roundtrip gesetzt
    pub udp_adresse: Arc<Mutex<Option<SocketAddr>>>,
    /// SHA-1-Digest des Client-Zertifikats (hex)
    pub zert_digest: Option<String>,
    /// Registrierte Identitaet nach erfolgreicher Authentifizierung
    pub benutzer: Option<raunen_core::UserId>,
    pub benutzername: String,
    pub kanal: ChannelId,
    pub zustand: ClientZustand,
    /// Gepackte Protokollversion des Clients
    pub version: u32,
    /// Vom Client beworbene CELT-Bitstream-Versionen
    pub codecs: Vec<i32>,
    pub tokens: Vec<String>,

    // Fluechtige Flags
    pub stumm: bool,
    pub taub: bool,
    pub unterdrueckt: bool,
    pub selbst_stumm: bool,
    pub selbst_taub: bool,
    pub prioritaets_sprecher: bool,
    pub nimmt_auf: bool,

    // Plugin-Daten
    pub plugin_kontext: Vec<u8>,
    pub plugin_identitaet: String,

    /// Fluester-Ziele 1-30
    pub sprachziele: HashMap<u8, Vec<VoiceTargetZiel>>,

    /// Vom Client im Ping gemeldete Statistik seiner Empfangsrichtung
    pub ping_statistik: PaketStatistik,
    /// Unix-Timestamp des letzten Krypto-Resync
    pub letzter_resync: i64,
    pub verbunden_seit: i64,
    /// Von der Steuerschleife gezaehlte Control-Nachrichten
    pub tcp_pakete: u32,
    /// Weitergeleitete Sprach-Frames
    pub udp_pakete: u32,

    /// Geteilter Voice-Krypto-Zustand (Steuerschleife + Datagram-Transport)
    pub crypt: Arc<Mutex<CryptState>>,

    sender: mpsc::UnboundedSender<ControlMessage>,
    datagramm_tx: mpsc::Sender<DatagrammEingang>,
    resync: Arc<ResyncAnforderung>,
    beenden: watch::Sender<bool>,
}

/// Alles was eine frische Session zum Start braucht
pub struct ClientAufbau {
    pub session: SessionId,
    pub strom: TlsStream<TcpStream>,
    pub adresse: SocketAddr,
    pub zert_digest: Option<String>,
    pub ereignis_tx: mpsc::Sender<ServerEreignis>,
    pub sprach_tx: mpsc::Sender<SprachPaket>,
    pub udpsend_tx: mpsc::Sender<UdpNachricht>,
}

impl Client {
    /// Erstellt die Session und startet ihre drei Fibers
    pub fn starten(aufbau: ClientAufbau) -> Self {
        let (sender, sende_rx) = mpsc::unbounded_channel();
        let (datagramm_tx, datagramm_rx) = mpsc::channel(DATAGRAMM_QUEUE_GROESSE);
        let (beenden, _) = watch::channel(false);
        let crypt = Arc::new(Mutex::new(CryptState::new()));
        let resync = Arc::new(ResyncAnforderung::neu(sender.clone()));

        let (lese_haelfte, schreib_haelfte) = tokio::io::split(aufbau.strom);

        // Leser-Fiber
        let session = aufbau.session;
        let ereignis_tx = aufbau.ereignis_tx.clone();
        let mut beenden_rx = beenden.subscribe();
        tokio::spawn(async move {
            let mut leser = FramedRead::new(lese_haelfte, FrameCodec::new());
            loop {
                tokio::select! {
                    geaendert = beenden_rx.changed() => {
                        if geaendert.is_err() || *beenden_rx.borrow() {
                            break;
                        }
                    }
                    frame = leser.next() => {
                        let grund = match frame {
                            Some(Ok(frame)) => {
                                match ControlMessage::decode_payload(frame.kind, &frame.payload) {
                                    Ok(Some(nachricht)) => {
                                        let ereignis = ServerEreignis::Eingehend { session, nachricht };
                                        if ereignis_tx.send(ereignis).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                    Ok(None) => {
                                        tracing::debug!(
                                            session = %session,
                                            kind = frame.kind,
                                            "Unbekanntes Nachrichten-Kind verworfen"
                                        );
                                        continue;
                                    }
                                    Err(e) => format!("Protokollverletzung: {e}"),
                                }
                            }
                            Some(Err(e)) => format!("Lesefehler: {e}"),
                            None => "Verbindung geschlossen".to_string(),
                        };
                        let _ = ereignis_tx
                            .send(ServerEreignis::Getrennt { session, grund })
                            .await;
                        break;
                    }
                }
            }
            tracing::trace!(session = %session, "Leser-Fiber beendet");
        });

        // Schreiber-Fiber: entleert die Sende-Queue bis sie geschlossen ist.
        // Kein Beenden-Kanal, damit bereits eingereihte Nachrichten (z.B. ein
        // Reject) den Client noch erreichen.
        let ereignis_tx = aufbau.ereignis_tx.clone();
        tokio::spawn(async move {
            let mut schreiber = FramedWrite::new(schreib_haelfte, FrameCodec::new());
            let mut sende_rx = sende_rx;
            while let Some(nachricht) = sende_rx.recv().await {
                if let Err(e) = schreiber.send(nachricht).await {
                    let _ = ereignis_tx
                        .send(ServerEreignis::Getrennt {
                            session,
                            grund: format!("Schreibfehler: {e}"),
                        })
                        .await;
                    break;
                }
            }
            let _ = schreiber.close().await;
            tracing::trace!(session = %session, "Schreiber-Fiber beendet");
        });

        // Datagram-Fiber: beantwortet UDP-Pings, reicht Sprach-Frames weiter
        let sprach_tx = aufbau.sprach_tx;
        let udpsend_tx = aufbau.udpsend_tx;
        let fiber_crypt = Arc::clone(&crypt);
        tokio::spawn(async move {
            let mut datagramm_rx: mpsc::Receiver<DatagrammEingang> = datagramm_rx;
            while let Some(eingang) = datagramm_rx.recv().await {
                let Some(&kopf_byte) = eingang.daten.first() else {
                    continue;
                };
                let Some(kopf) = SprachKopf::decode(kopf_byte) else {
                    tracing::trace!(session = %session, "Ungueltiger Frame-Kopf verworfen");
                    continue;
                };

                if kopf.typ == PaketTyp::Ping {
                    // Ping wird verschluesselt an den Absender gespiegelt
                    let nachricht = UdpNachricht {
                        daten: eingang.daten,
                        ziel: UdpZiel::Verschluesselt {
                            crypt: Arc::clone(&fiber_crypt),
                            adresse: eingang.absender,
                        },
                    };
                    let _ = udpsend_tx.try_send(nachricht);
                    continue;
                }

                let paket = SprachPaket {
                    session,
                    ziel: kopf.ziel,
                    daten: eingang.daten,
                };
                if sprach_tx.try_send(paket).is_err() {
                    tracing::trace!(session = %session, "Sprach-Queue voll, Frame verworfen");
                }
            }
            tracing::trace!(session = %session, "Datagram-Fiber beendet");
        });

        Self::mit_kanaelen(
            aufbau.session,
            aufbau.adresse,
            aufbau.zert_digest,
            crypt,
            resync,
            sender,
            datagramm_tx,
            beenden,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn mit_kanaelen(
        session: SessionId,
        tcp_adresse: SocketAddr,
        zert_digest: Option<String>,
        crypt: Arc<Mutex<CryptState>>,
        resync: Arc<ResyncAnforderung>,
        sender: mpsc::UnboundedSender<ControlMessage>,
        datagramm_tx: mpsc::Sender<DatagrammEingang>,
        beenden: watch::Sender<bool>,
    ) -> Self {
        Self {
            session,
            tcp_adresse,
            udp_adresse: Arc::new(Mutex::new(None)),
            zert_digest,
            benutzer: None,
            benutzername: String::new(),
            kanal: ChannelId::ROOT,
            zustand: ClientZustand::Verbunden,
            version: 0,
            codecs: Vec::new(),
            tokens: Vec::new(),
            stumm: false,
            taub: false,
            unterdrueckt: false,
            selbst_stumm: false,
            selbst_taub: false,
            prioritaets_sprecher: false,
            nimmt_auf: false,
            plugin_kontext: Vec::new(),
            plugin_identitaet: String::new(),
            sprachziele: HashMap::new(),
            ping_statistik: PaketStatistik::default(),
            letzter_resync: 0,
            verbunden_seit: chrono::Utc::now().timestamp(),
            tcp_pakete: 0,
            udp_pakete: 0,
            crypt,
            sender,
            datagramm_tx,
            resync,
            beenden,
        }
    }

    /// Reiht eine Nachricht in die Sende-Queue ein
    ///
    /// Gibt `false` zurueck wenn die Session bereits abgebaut wird; ein
    /// Broadcast bricht dann fuer diese Nachricht ab.
    pub fn senden(&self, nachricht: ControlMessage) -> bool {
        self.sender.send(nachricht).is_ok()
    }

    /// Klon der Sende-Queue (fuer Auth-Task und Resync)
    pub fn sender_klon(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.sender.clone()
    }

    /// Leitet das Beenden ein: Fibers brechen ihr ausstehendes IO ab
    pub fn schliessen(&self) {
        let _ = self.beenden.send(true);
    }

    /// Eintrag fuer den Host/Port-Index des Datagram-Transports
    pub fn host_eintrag(&self) -> HostEintrag {
        HostEintrag {
            session: self.session,
            crypt: Arc::clone(&self.crypt),
            udp_adresse: Arc::clone(&self.udp_adresse),
            datagramm_tx: self.datagramm_tx.clone(),
            resync: Arc::clone(&self.resync),
        }
    }

    /// Name wie er anderen Clients angezeigt wird
    pub fn angezeigter_name(&self) -> &str {
        &self.benutzername
    }

    /// Ist die Session mit einer registrierten Identitaet angemeldet?
    pub fn ist_registriert(&self) -> bool {
        self.benutzer.is_some()
    }

    /// Ist die Session der SuperUser?
    pub fn ist_superuser(&self) -> bool {
        self.benutzer == Some(raunen_core::UserId::SUPERUSER)
    }
}

// ---------------------------------------------------------------------------
// Test-Hilfen
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testhilfe {
    use super::*;

    /// Erstellt eine Session ohne IO-Fibers; Broadcasts landen im
    /// zurueckgegebenen Empfaenger
    pub fn attrappe(
        session: SessionId,
    ) -> (Client, mpsc::UnboundedReceiver<ControlMessage>) {
        let (sender, empfaenger) = mpsc::unbounded_channel();
        // Die Datagram-Queue bleibt im Test ohne Empfaenger
        let (datagramm_tx, _) = mpsc::channel(DATAGRAMM_QUEUE_GROESSE);
        let (beenden, _) = watch::channel(false);
        let crypt = Arc::new(Mutex::new(CryptState::new()));
        let resync = Arc::new(ResyncAnforderung::neu(sender.clone()));

        let client = Client::mit_kanaelen(
            session,
            "127.0.0.1:50000".parse().expect("Testadresse"),
            None,
            crypt,
            resync,
            sender,
            datagramm_tx,
            beenden,
        );
        (client, empfaenger)
    }
}
