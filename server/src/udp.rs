//! Datagram-Transport
//!
//! Genau ein UDP-Socket pro Server. Der Empfangs-Task demultiplext nach
//! Absender-Adresse, entschluesselt mit dem Krypto-Zustand der Session
//! und stellt den Klartext in die Datagram-Queue der Session. Der
//! Sende-Task serialisiert alle ausgehenden Datagramme und
//! verschluesselt mit dem Schluessel des jeweiligen Empfaengers.
//!
//! ## Architektur
//!
//! ```text
//! UDP Socket (recv_from)
//!     |
//!     +-- 12 Bytes? --> Probe-Antwort (unverschluesselt, via Sende-Queue)
//!     |
//!     v
//! HostIndex (Mutex): Endpunkt -> Session, sonst Kandidaten per Quell-IP
//!     |
//!     v
//! CryptState::decrypt()  <- Fehlschlag: Resync anfordern (ratenbegrenzt)
//!     |
//!     v
//! Datagram-Queue der Session (bounded, try_send)
//! ```
//!
//! Der Index ist eine der beiden dokumentierten Ausnahmen von der
//! Ein-Schreiber-Regel: die Steuerschleife traegt Sessions ein und aus,
//! der Empfangs-Task bindet Endpunkte. Sperren werden nur kurz gehalten,
//! nie ueber ein await hinweg.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use raunen_core::SessionId;
use raunen_protocol::control::{ControlMessage, CryptSetup};
use raunen_protocol::crypto::{CryptState, KOPF_GROESSE};
use raunen_protocol::voice::{ProbeAnfrage, ProbeAntwort, PROTOKOLL_VERSION, UDP_PAKET_GROESSE};

/// Mindestabstand zwischen zwei Resync-Aufforderungen (Sekunden)
const RESYNC_ABSTAND_SEK: i64 = 5;

// ---------------------------------------------------------------------------
// Ausgehende Datagramme
// ---------------------------------------------------------------------------

/// Ziel eines ausgehenden Datagrams
pub enum UdpZiel {
    /// Mit dem Schluessel des Empfaengers verschluesseln
    Verschluesselt {
        crypt: Arc<Mutex<CryptState>>,
        adresse: SocketAddr,
    },
    /// Unverschluesselt senden (nur Probe-Antworten)
    Klartext { adresse: SocketAddr },
}

/// Ein ausgehendes Datagram fuer den Sende-Task
pub struct UdpNachricht {
    pub daten: Vec<u8>,
    pub ziel: UdpZiel,
}

// ---------------------------------------------------------------------------
// Resync-Aufforderung
// ---------------------------------------------------------------------------

/// Ratenbegrenzte Resync-Aufforderung einer Session
///
/// Schickt dem Client eine leere CryptSetup-Nachricht; der Client
/// antwortet mit einer frischen Client-Nonce.
pub struct ResyncAnforderung {
    sender: mpsc::UnboundedSender<ControlMessage>,
    letzter: AtomicI64,
}

impl ResyncAnforderung {
    pub fn neu(sender: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            sender,
            letzter: AtomicI64::new(0),
        }
    }

    /// Fordert einen Resync an, hoechstens alle `RESYNC_ABSTAND_SEK`
    pub fn anfordern(&self) {
        let jetzt = Utc::now().timestamp();
        let letzter = self.letzter.load(Ordering::Relaxed);
        if jetzt - letzter < RESYNC_ABSTAND_SEK {
            return;
        }
        if self
            .letzter
            .compare_exchange(letzter, jetzt, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let _ = self
            .sender
            .send(ControlMessage::CryptSetup(CryptSetup::default()));
        tracing::debug!("Krypto-Resync angefordert");
    }
}

// ---------------------------------------------------------------------------
// Host/Port-Index
// ---------------------------------------------------------------------------

/// Ein vom Empfangs-Task benoetigter Ausschnitt einer Session
#[derive(Clone)]
pub struct HostEintrag {
    pub session: SessionId,
    pub crypt: Arc<Mutex<CryptState>>,
    /// Wird vom Empfangs-Task beim ersten erfolgreichen Datagram gesetzt
    pub udp_adresse: Arc<Mutex<Option<SocketAddr>>>,
    /// Klartext-Queue zur Datagram-Fiber der Session
    pub datagramm_tx: mpsc::Sender<DatagrammEingang>,
    pub resync: Arc<ResyncAnforderung>,
}

/// Ein entschluesseltes Datagram fuer die Datagram-Fiber
pub struct DatagrammEingang {
    pub daten: Vec<u8>,
    pub absender: SocketAddr,
}

/// Index von Quell-IP und (IP, Port) auf Sessions
///
/// Vor dem ersten Datagram einer Session ist nur die Quell-IP bekannt;
/// der Empfangs-Task probiert dann alle Sessions derselben IP durch und
/// bindet das (IP, Port)-Paar beim ersten Entschluesselungserfolg.
#[derive(Default)]
pub struct HostIndex {
    nach_host: HashMap<IpAddr, Vec<HostEintrag>>,
    nach_endpunkt: HashMap<SocketAddr, HostEintrag>,
}

impl HostIndex {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Traegt eine Session unter ihrer Stream-Quell-IP ein
    pub fn eintragen(&mut self, host: IpAddr, eintrag: HostEintrag) {
        self.nach_host.entry(host).or_default().push(eintrag);
    }

    /// Entfernt eine Session aus beiden Abbildungen (idempotent)
    pub fn austragen(&mut self, host: IpAddr, session: SessionId) {
        if let Some(eintraege) = self.nach_host.get_mut(&host) {
            eintraege.retain(|e| e.session != session);
            if eintraege.is_empty() {
                self.nach_host.remove(&host);
            }
        }
        self.nach_endpunkt.retain(|_, e| e.session != session);
    }

    /// Bindet ein (IP, Port)-Paar an eine Session
    pub fn endpunkt_binden(&mut self, endpunkt: SocketAddr, eintrag: HostEintrag) {
        *eintrag.udp_adresse.lock() = Some(endpunkt);
        self.nach_endpunkt.insert(endpunkt, eintrag);
    }

    fn eintrag_fuer_endpunkt(&self, endpunkt: &SocketAddr) -> Option<HostEintrag> {
        self.nach_endpunkt.get(endpunkt).cloned()
    }

    fn kandidaten_fuer_host(&self, host: &IpAddr) -> Vec<HostEintrag> {
        self.nach_host.get(host).cloned().unwrap_or_default()
    }
}

/// Der zwischen Steuerschleife und Empfangs-Task geteilte Index
pub type GeteilterHostIndex = Arc<Mutex<HostIndex>>;

// ---------------------------------------------------------------------------
// Probe-Informationen
// ---------------------------------------------------------------------------

/// Vom Empfangs-Task fuer Probe-Antworten benoetigte Kennzahlen
///
/// Die Steuerschleife aktualisiert die Werte bei jeder Aenderung; der
/// Empfangs-Task liest sie lockfrei.
#[derive(Debug, Default)]
pub struct ProbeInfo {
    pub benutzer: AtomicU32,
    pub max_benutzer: AtomicU32,
    pub max_bandbreite: AtomicU32,
}

// ---------------------------------------------------------------------------
// Empfangs-Schleife
// ---------------------------------------------------------------------------

/// Empfaengt Datagramme bis der Socket geschlossen wird
///
/// Laeuft als eigener Task fuer die Lebensdauer des Servers.
pub async fn empfangs_schleife(
    socket: Arc<UdpSocket>,
    index: GeteilterHostIndex,
    sende_tx: mpsc::Sender<UdpNachricht>,
    probe_info: Arc<ProbeInfo>,
) {
    // Wiederverwendeter Empfangspuffer, keine Allocation pro Datagram
    let mut puffer = [0u8; UDP_PAKET_GROESSE];

    tracing::info!("Datagram-Empfangsschleife gestartet");

    loop {
        let (laenge, absender) = match socket.recv_from(&mut puffer).await {
            Ok(ergebnis) => ergebnis,
            Err(e) => {
                tracing::error!(fehler = %e, "UDP-Empfangsfehler");
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                continue;
            }
        };

        // Probe-Datagramme umgehen die Verschluesselung vollstaendig
        if let Some(anfrage) = ProbeAnfrage::decode(&puffer[..laenge]) {
            let antwort = ProbeAntwort {
                version: PROTOKOLL_VERSION,
                nonce: anfrage.nonce,
                benutzer: probe_info.benutzer.load(Ordering::Relaxed),
                max_benutzer: probe_info.max_benutzer.load(Ordering::Relaxed),
                max_bandbreite: probe_info.max_bandbreite.load(Ordering::Relaxed),
            };
            let nachricht = UdpNachricht {
                daten: antwort.encode().to_vec(),
                ziel: UdpZiel::Klartext { adresse: absender },
            };
            if sende_tx.try_send(nachricht).is_err() {
                tracing::trace!("Sende-Queue voll, Probe-Antwort verworfen");
            }
            continue;
        }

        if laenge < KOPF_GROESSE + 1 {
            continue;
        }

        datagramm_verarbeiten(&index, &puffer[..laenge], absender);
    }
}

/// Ordnet ein Datagram seiner Session zu und entschluesselt es
fn datagramm_verarbeiten(index: &GeteilterHostIndex, daten: &[u8], absender: SocketAddr) {
    // Bekannter Endpunkt: direkt entschluesseln
    let bekannter = index.lock().eintrag_fuer_endpunkt(&absender);
    if let Some(eintrag) = bekannter {
        let mut klartext = vec![0u8; daten.len() - KOPF_GROESSE];
        let ergebnis = eintrag.crypt.lock().decrypt(&mut klartext, daten);
        match ergebnis {
            Ok(()) => zustellen(&eintrag, klartext, absender),
            Err(fehler) => {
                tracing::debug!(
                    session = %eintrag.session,
                    fehler = %fehler,
                    "Datagram nicht entschluesselbar, Resync angefragt"
                );
                eintrag.resync.anfordern();
            }
        }
        return;
    }

    // Unbekannter Endpunkt: alle Sessions derselben Quell-IP durchprobieren
    let kandidaten = index.lock().kandidaten_fuer_host(&absender.ip());
    for eintrag in &kandidaten {
        let mut klartext = vec![0u8; daten.len() - KOPF_GROESSE];
        if eintrag.crypt.lock().decrypt(&mut klartext, daten).is_ok() {
            index.lock().endpunkt_binden(absender, eintrag.clone());
            tracing::debug!(
                session = %eintrag.session,
                endpunkt = %absender,
                "Datagram-Endpunkt gebunden"
            );
            zustellen(eintrag, klartext, absender);
            return;
        }
    }

    // Niemand konnte entschluesseln: Resync fuer alle Kandidaten anfragen
    for eintrag in &kandidaten {
        eintrag.resync.anfordern();
    }
}

/// Stellt den Klartext in die Datagram-Queue der Session
fn zustellen(eintrag: &HostEintrag, daten: Vec<u8>, absender: SocketAddr) {
    let eingang = DatagrammEingang { daten, absender };
    if eintrag.datagramm_tx.try_send(eingang).is_err() {
        // Stille ist besser als Latenz
        tracing::trace!(session = %eintrag.session, "Datagram-Queue voll, Frame verworfen");
    }
}

// ---------------------------------------------------------------------------
// Sende-Schleife
// ---------------------------------------------------------------------------

/// Serialisierter Sender: verschluesselt pro Empfaenger und schreibt
pub async fn sende_schleife(socket: Arc<UdpSocket>, mut empfang: mpsc::Receiver<UdpNachricht>) {
    tracing::info!("Datagram-Sendeschleife gestartet");

    while let Some(nachricht) = empfang.recv().await {
        match nachricht.ziel {
            UdpZiel::Verschluesselt { crypt, adresse } => {
                let mut chiffrat = vec![0u8; nachricht.daten.len() + KOPF_GROESSE];
                crypt.lock().encrypt(&mut chiffrat, &nachricht.daten);
                if let Err(e) = socket.send_to(&chiffrat, adresse).await {
                    tracing::warn!(ziel = %adresse, fehler = %e, "UDP-Sendefehler");
                }
            }
            UdpZiel::Klartext { adresse } => {
                if let Err(e) = socket.send_to(&nachricht.daten, adresse).await {
                    tracing::warn!(ziel = %adresse, fehler = %e, "UDP-Sendefehler");
                }
            }
        }
    }

    tracing::info!("Datagram-Sendeschleife beendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
