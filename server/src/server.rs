//! Server-Steuerschleife
//!
//! Eine einzige kooperative Task besitzt den gesamten veraenderlichen
//! Serverzustand: Kanal-Arena, Session-Map, Benutzerregister,
//! Konfiguration, Berechtigungs-Cache. Sie entleert vier Queues
//! (eingehende Nachrichten, Authentifizierungs-Abschluesse,
//! Sprach-Broadcasts, Konfigurations-Updates) plus einen
//! Registrierungs-Timer und prueft nach jedem Ereignis die
//! Abbild-Schwelle.
//!
//! Ausserhalb der Schleife wird Serverzustand nur ueber die zwei
//! dokumentierten geteilten Strukturen beruehrt: den Host/Port-Index
//! (Mutex, Datagram-Empfang) und die Ban-Liste (RwLock, Acceptor).
//! Fehler einzelner Sessions beenden die Session, nie die Schleife.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;

use raunen_acl::{resolver, Anfrager, Berechtigung, KettenGlied, PermissionCache};
use raunen_auth::Ban;
use raunen_blobstore::BlobSpeicher;
use raunen_core::{ChannelId, ClientZustand, SessionId, UserId};
use raunen_freezer::{Abbild, Operation, Protokoll};
use raunen_protocol::control as proto;
use raunen_protocol::control::ControlMessage;
use raunen_protocol::voice::PROTOKOLL_VERSION;

use crate::channel::Kanal;
use crate::client::{Client, ClientAufbau};
use crate::config::Konfiguration;
use crate::register;
use crate::udp::{GeteilterHostIndex, HostIndex, ProbeInfo, UdpNachricht, UdpZiel};
use crate::user::Benutzer;

/// Abbild-Schwelle: Voll-Abbild nach so vielen protokollierten Operationen
pub const ABBILD_SCHWELLE: usize = 100;

/// Sentinel des CELT-Kompatibilitaets-Bitstreams
pub const CELT_COMPAT_BITSTREAM: i32 = -2147483637;

/// Ab dieser Client-Version werden Blobs als Digest uebertragen
pub const BLOB_FAEHIGE_VERSION: u32 = 0x10203;

/// Groesse der Ereignis-Queue (eingehende Nachrichten, Verbindungen)
const EREIGNIS_QUEUE_GROESSE: usize = 256;

/// Groesse der Sprach-Broadcast-Queue
const SPRACH_QUEUE_GROESSE: usize = 512;

/// Groesse der Datagram-Sende-Queue
const UDP_SENDE_QUEUE_GROESSE: usize = 512;

// ---------------------------------------------------------------------------
// Ereignisse
// ---------------------------------------------------------------------------

/// Vom Acceptor uebergebene, fertig verhandelte Verbindung
pub struct NeueVerbindung {
    pub strom: TlsStream<TcpStream>,
    pub adresse: SocketAddr,
    /// SHA-1-Digest des Client-Zertifikats (hex), falls praesentiert
    pub zert_digest: Option<String>,
}

/// Ereignisse der Haupt-Queue
pub enum ServerEreignis {
    /// Der Acceptor hat eine Verbindung fertig verhandelt
    Verbunden(NeueVerbindung),
    /// Eine Session hat eine Control-Nachricht dekodiert
    Eingehend {
        session: SessionId,
        nachricht: ControlMessage,
    },
    /// Eine Session-Fiber hat das Verbindungsende beobachtet
    Getrennt { session: SessionId, grund: String },
}

/// Abschluss-Signal einer Authentifizierungs-Task
///
/// `Err` bedeutet: die Task hat bereits ein Reject gesendet, die
/// Schleife baut die Session nur noch ab.
pub struct AuthAbschluss {
    pub session: SessionId,
    pub ergebnis: Result<Option<UserId>, ()>,
}

/// Ein entschluesselter Sprach-Frame mit Ziel-Selektor
pub struct SprachPaket {
    pub session: SessionId,
    /// 0 = aktueller Kanal, 1-30 = Fluester-Ziel
    pub ziel: u8,
    pub daten: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Der gesamte Serverzustand, exklusiv der Steuerschleife gehoerend
pub struct Server {
    pub id: i64,
    pub(crate) daten_verzeichnis: PathBuf,

    // Kanaele
    pub(crate) kanaele: HashMap<ChannelId, Kanal>,
    pub(crate) naechste_kanal_id: u32,

    // Sessions
    pub(crate) clients: HashMap<SessionId, Client>,
    pub(crate) pool: crate::sessionpool::SessionPool,

    // Registrierte Benutzer samt Indizes
    pub(crate) benutzer: HashMap<UserId, Benutzer>,
    pub(crate) nach_name: HashMap<String, UserId>,
    pub(crate) nach_zertifikat: HashMap<String, UserId>,
    pub(crate) naechste_benutzer_id: u32,

    // Laufzeit-Konfiguration
    pub(crate) konfiguration: Konfiguration,

    // Codec-Verhandlung
    pub(crate) alpha_codec: i32,
    pub(crate) beta_codec: i32,
    pub(crate) bevorzuge_alpha: bool,

    // Berechtigungs-Cache
    pub(crate) cache: PermissionCache,

    // Ban-Liste (RwLock: der Acceptor liest nebenlaeufig)
    pub(crate) bans: Arc<RwLock<Vec<Ban>>>,

    // Persistenz
    pub(crate) protokoll: Option<Protokoll>,
    pub(crate) log_operationen: usize,
    pub(crate) abbild_schwelle: usize,

    // Blob-Speicher
    pub(crate) blobs: BlobSpeicher,

    // Datagram-Transport
    pub(crate) host_index: GeteilterHostIndex,
    pub(crate) probe_info: Arc<ProbeInfo>,
    pub(crate) udpsend_tx: mpsc::Sender<UdpNachricht>,
    pub(crate) udpsend_rx: Option<mpsc::Receiver<UdpNachricht>>,

    // Queues der Steuerschleife
    pub(crate) ereignis_tx: mpsc::Sender<ServerEreignis>,
    ereignis_rx: Option<mpsc::Receiver<ServerEreignis>>,
    pub(crate) auth_tx: mpsc::Sender<AuthAbschluss>,
    pub(crate) auth_rx: Option<mpsc::Receiver<AuthAbschluss>>,
    pub(crate) sprach_tx: mpsc::Sender<SprachPaket>,
    sprach_rx: Option<mpsc::Receiver<SprachPaket>>,
    konfig_tx: mpsc::Sender<(String, String)>,
    konfig_rx: Option<mpsc::Receiver<(String, String)>>,
}

impl Server {
    /// Erstellt eine frische Instanz mit Root-Kanal und SuperUser
    pub fn neu(id: i64, daten_verzeichnis: impl Into<PathBuf>) -> Self {
        let daten_verzeichnis = daten_verzeichnis.into();

        let (ereignis_tx, ereignis_rx) = mpsc::channel(EREIGNIS_QUEUE_GROESSE);
        let (auth_tx, auth_rx) = mpsc::channel(16);
        let (sprach_tx, sprach_rx) = mpsc::channel(SPRACH_QUEUE_GROESSE);
        let (konfig_tx, konfig_rx) = mpsc::channel(16);
        let (udpsend_tx, udpsend_rx) = mpsc::channel(UDP_SENDE_QUEUE_GROESSE);

        let mut kanaele = HashMap::new();
        kanaele.insert(ChannelId::ROOT, Kanal::neu(ChannelId::ROOT, "Root"));

        let mut benutzer = HashMap::new();
        let mut nach_name = HashMap::new();
        let superuser = Benutzer::neu(UserId::SUPERUSER, "SuperUser");
        nach_name.insert(superuser.name.clone(), UserId::SUPERUSER);
        benutzer.insert(UserId::SUPERUSER, superuser);

        let blobs = BlobSpeicher::neu(daten_verzeichnis.join("blobs"));

        Self {
            id,
            daten_verzeichnis,
            kanaele,
            naechste_kanal_id: 1,
            clients: HashMap::new(),
            pool: crate::sessionpool::SessionPool::neu(),
            benutzer,
            nach_name,
            nach_zertifikat: HashMap::new(),
            naechste_benutzer_id: 1,
            konfiguration: Konfiguration::neu(),
            alpha_codec: 0,
            beta_codec: 0,
            bevorzuge_alpha: false,
            cache: PermissionCache::neu(),
            bans: Arc::new(RwLock::new(Vec::new())),
            protokoll: None,
            log_operationen: 0,
            abbild_schwelle: ABBILD_SCHWELLE,
            blobs,
            host_index: Arc::new(Mutex::new(HostIndex::neu())),
            probe_info: Arc::new(ProbeInfo::default()),
            udpsend_tx,
            udpsend_rx: Some(udpsend_rx),
            ereignis_tx,
            ereignis_rx: Some(ereignis_rx),
            auth_tx,
            auth_rx: Some(auth_rx),
            sprach_tx,
            sprach_rx: Some(sprach_rx),
            konfig_tx,
            konfig_rx: Some(konfig_rx),
        }
    }

    /// Sender der Haupt-Ereignis-Queue (fuer den Acceptor)
    pub fn ereignis_sender(&self) -> mpsc::Sender<ServerEreignis> {
        self.ereignis_tx.clone()
    }

    /// Sender der Konfigurations-Queue (fuer Verwaltungspfade)
    pub fn konfig_sender(&self) -> mpsc::Sender<(String, String)> {
        self.konfig_tx.clone()
    }

    // -----------------------------------------------------------------------
    // Steuerschleife
    // -----------------------------------------------------------------------

    /// Die Steuerschleife; laeuft fuer die Lebensdauer des Servers
    pub async fn lauf(mut self) {
        let periode = register::registrierungs_periode(self.id);
        let mut registrierungs_takt =
            tokio::time::interval_at(tokio::time::Instant::now() + periode, periode);

        let (Some(mut ereignis_rx), Some(mut auth_rx), Some(mut sprach_rx), Some(mut konfig_rx)) = (
            self.ereignis_rx.take(),
            self.auth_rx.take(),
            self.sprach_rx.take(),
            self.konfig_rx.take(),
        ) else {
            tracing::error!("Steuerschleife doppelt gestartet");
            return;
        };

        tracing::info!(server_id = self.id, "Steuerschleife gestartet");

        loop {
            tokio::select! {
                Some(ereignis) = ereignis_rx.recv() => self.ereignis_verarbeiten(ereignis),
                Some(abschluss) = auth_rx.recv() => self.authentifizierung_abschliessen(abschluss),
                Some(paket) = sprach_rx.recv() => self.sprache_verteilen(paket),
                Some((schluessel, wert)) = konfig_rx.recv() => self.konfig_aktualisieren(schluessel, wert),
                _ = registrierungs_takt.tick() => {
                    register::oeffentlich_registrieren(&self.konfiguration, self.id);
                }
                else => break,
            }

            self.abbild_pruefen();
        }

        tracing::info!("Steuerschleife beendet");
    }

    fn ereignis_verarbeiten(&mut self, ereignis: ServerEreignis) {
        match ereignis {
            ServerEreignis::Verbunden(neue) => self.client_anlegen(neue),
            ServerEreignis::Eingehend { session, nachricht } => {
                let Some(client) = self.clients.get_mut(&session) else {
                    return;
                };
                client.tcp_pakete = client.tcp_pakete.wrapping_add(1);
                self.nachricht_verarbeiten(session, nachricht);
            }
            ServerEreignis::Getrennt { session, grund } => {
                tracing::info!(session = %session, grund = %grund, "Session getrennt");
                self.client_entfernen(session, false);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session-Lebenszyklus
    // -----------------------------------------------------------------------

    fn client_anlegen(&mut self, neue: NeueVerbindung) {
        let session = self.pool.holen();
        tracing::info!(session = %session, peer = %neue.adresse, "Neue Verbindung");

        let mut client = Client::starten(ClientAufbau {
            session,
            strom: neue.strom,
            adresse: neue.adresse,
            zert_digest: neue.zert_digest,
            ereignis_tx: self.ereignis_tx.clone(),
            sprach_tx: self.sprach_tx.clone(),
            udpsend_tx: self.udpsend_tx.clone(),
        });

        // Der Server stellt sich zuerst vor
        client.senden(ControlMessage::Version(proto::Version {
            version: Some(PROTOKOLL_VERSION),
            release: Some(format!("Raunen {}", env!("CARGO_PKG_VERSION"))),
            os: Some(std::env::consts::OS.to_string()),
            os_version: None,
        }));
        client.zustand = ClientZustand::VersionGesendet;

        self.clients.insert(session, client);
    }

    /// Baut eine Session idempotent ab
    ///
    /// Kick-Pfade senden ihr `UserRemove` selbst vor dem Aufruf; nur ein
    /// regulaeres Verbindungsende einer sichtbaren Session wird hier
    /// broadcastet.
    pub(crate) fn client_entfernen(&mut self, session: SessionId, gekickt: bool) {
        let Some(mut client) = self.clients.remove(&session) else {
            return;
        };
        let war_sichtbar = client.zustand >= ClientZustand::Bereit
            && client.zustand != ClientZustand::Tot;
        client.zustand = ClientZustand::Tot;

        self.host_index
            .lock()
            .austragen(client.tcp_adresse.ip(), session);
        self.pool.zurueckgeben(session);

        // Aus dem aktuellen Kanal austragen
        let kanal_id = client.kanal;
        let temporaer_leer = if let Some(kanal) = self.kanaele.get_mut(&kanal_id) {
            kanal.mitglieder.remove(&session);
            kanal.temporaer && kanal.mitglieder.is_empty()
        } else {
            false
        };
        if temporaer_leer {
            self.kanal_entfernen_kaskade(kanal_id);
        }

        self.cache.leeren();

        if !gekickt && war_sichtbar {
            let entfernt = ControlMessage::UserRemove(proto::UserRemove {
                session: session.wert(),
                actor: None,
                reason: None,
                ban: None,
            });
            if !self.broadcast(entfernt) {
                tracing::warn!(session = %session, "UserRemove-Broadcast abgebrochen");
            }
        }

        client.schliessen();
        drop(client);

        self.codec_versionen_aktualisieren();
        self.probe_info_aktualisieren();
        tracing::info!(session = %session, "Session abgebaut");
    }

    /// Protokollverletzung oder Integritaetsfehler: Session beenden
    pub(crate) fn session_panik(&mut self, session: SessionId, grund: &str) {
        tracing::warn!(session = %session, grund = %grund, "Session-Panik");
        self.client_entfernen(session, false);
    }

    // -----------------------------------------------------------------------
    // Authentifizierungs-Abschluss (zurueck auf der Schleife)
    // -----------------------------------------------------------------------

    pub(crate) fn authentifizierung_abschliessen(&mut self, abschluss: AuthAbschluss) {
        let session = abschluss.session;
        let benutzer = match abschluss.ergebnis {
            Ok(benutzer) => benutzer,
            Err(()) => {
                // Die Auth-Task hat bereits abgelehnt
                self.client_entfernen(session, true);
                return;
            }
        };

        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };
        if client.zustand >= ClientZustand::Authentifiziert {
            return;
        }
        client.benutzer = benutzer;
        client.letzter_resync = Utc::now().timestamp();
        client.zustand = ClientZustand::Authentifiziert;

        // Doppelte Anmeldung derselben Identitaet: unbedingt ablehnen,
        // die aeltere Session bleibt
        if let Some(uid) = benutzer {
            let doppelt = self
                .clients
                .values()
                .any(|c| c.session != session && c.benutzer == Some(uid));
            if doppelt {
                self.ablehnen(
                    session,
                    proto::RejectGrund::UsernameInUse,
                    "Diese Identitaet ist bereits verbunden",
                );
                return;
            }
        }

        // Server voll?
        let verbundene = self.sichtbare_sessions();
        let maximum = self.konfiguration.u32_wert("MaxUsers");
        if verbundene > maximum {
            self.ablehnen(session, proto::RejectGrund::ServerFull, "Server ist voll");
            return;
        }

        // Eventuell muessen andere Clients den Codec wechseln
        self.codec_versionen_aktualisieren();

        self.kanal_liste_senden(session);

        // In den Host-Index fuer den Datagram-Transport eintragen
        {
            let Some(client) = self.clients.get(&session) else {
                return;
            };
            let eintrag = client.host_eintrag();
            self.host_index.lock().eintragen(client.tcp_adresse.ip(), eintrag);
        }

        // Betreten des Root-Kanals samt Broadcast an alle Sichtbaren
        let mut zustand = self.benutzer_zustand_von(session, PROTOKOLL_VERSION);
        zustand.channel_id = Some(ChannelId::ROOT.wert());
        self.kanal_betreten(session, ChannelId::ROOT, &mut zustand);
        if !self.broadcast(ControlMessage::UserState(zustand)) {
            tracing::warn!(session = %session, "UserState-Broadcast abgebrochen");
        }

        self.benutzer_liste_senden(session);

        // ServerSync mit der Root-Berechtigungsmaske
        let berechtigungen = if self
            .clients
            .get(&session)
            .is_some_and(|c| c.ist_superuser())
        {
            Berechtigung::ALL
        } else {
            self.hat_berechtigung(session, ChannelId::ROOT, Berechtigung::ENTER);
            match self.berechtigung_lesen(session, ChannelId::ROOT) {
                Some(maske) => maske,
                None => return, // Session-Panik bereits ausgeloest
            }
        };

        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };
        client.senden(ControlMessage::ServerSync(proto::ServerSync {
            session: Some(session.wert()),
            max_bandwidth: Some(self.konfiguration.u32_wert("MaxBandwidth")),
            welcome_text: Some(self.konfiguration.zeichenkette("WelcomeText")),
            permissions: Some(berechtigungen as u64),
        }));
        client.senden(ControlMessage::ServerConfig(proto::ServerConfigInfo {
            max_bandwidth: Some(self.konfiguration.u32_wert("MaxBandwidth")),
            welcome_text: None,
            allow_html: Some(self.konfiguration.bool_wert("AllowHTML")),
            message_length: Some(self.konfiguration.u32_wert("MaxTextMessageLength")),
            image_message_length: Some(self.konfiguration.u32_wert("MaxImageMessageLength")),
        }));

        client.zustand = ClientZustand::Bereit;
        self.probe_info_aktualisieren();
        tracing::info!(
            session = %session,
            name = %self.clients[&session].angezeigter_name(),
            "Session bereit"
        );
    }

    /// Sendet ein typisiertes Reject und baut die Session ab
    pub(crate) fn ablehnen(
        &mut self,
        session: SessionId,
        grund: proto::RejectGrund,
        text: &str,
    ) {
        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::Reject(proto::Reject {
                reject_type: Some(grund),
                reason: Some(text.to_string()),
            }));
        }
        self.client_entfernen(session, true);
    }

    // -----------------------------------------------------------------------
    // Synchronisation neuer Sessions
    // -----------------------------------------------------------------------

    /// Schickt einer Session den vollstaendigen Kanalbaum (Eltern zuerst)
    pub(crate) fn kanal_liste_senden(&self, session: SessionId) {
        let Some(client) = self.clients.get(&session) else {
            return;
        };

        let mut warteschlange = VecDeque::from([ChannelId::ROOT]);
        while let Some(id) = warteschlange.pop_front() {
            let Some(kanal) = self.kanaele.get(&id) else {
                continue;
            };
            warteschlange.extend(kanal.kinder.iter().copied());

            let mut zustand = proto::ChannelState {
                channel_id: Some(id.wert()),
                parent: kanal.eltern.map(|e| e.wert()),
                name: Some(kanal.name.clone()),
                links: kanal.verknuepfungen.iter().map(|v| v.wert()).collect(),
                position: Some(kanal.position),
                temporary: kanal.temporaer.then_some(true),
                ..Default::default()
            };
            if let Some(blob) = &kanal.beschreibung_blob {
                if client.version >= BLOB_FAEHIGE_VERSION {
                    zustand.description_hash = Some(blob.clone());
                } else {
                    match self.blobs.holen(blob) {
                        Ok(inhalt) => {
                            zustand.description =
                                Some(String::from_utf8_lossy(&inhalt).into_owned());
                        }
                        Err(e) => tracing::error!(fehler = %e, "Beschreibungs-Blob fehlt"),
                    }
                }
            }
            client.senden(ControlMessage::ChannelState(zustand));
        }
    }

    /// Schickt einer Session die Zustaende aller bereiten Sessions
    pub(crate) fn benutzer_liste_senden(&self, session: SessionId) {
        let Some(client) = self.clients.get(&session) else {
            return;
        };
        let version = client.version;

        let mut andere: Vec<SessionId> = self
            .clients
            .values()
            .filter(|c| c.session != session && c.zustand == ClientZustand::Bereit)
            .map(|c| c.session)
            .collect();
        andere.sort_unstable();

        for s in andere {
            let zustand = self.benutzer_zustand_von(s, version);
            client.senden(ControlMessage::UserState(zustand));
        }
    }

    /// Baut den vollstaendigen UserState einer Session
    ///
    /// Blobs werden fuer Empfaenger ab 1.2.3 als Digest, darunter als
    /// Inhalt uebertragen.
    pub(crate) fn benutzer_zustand_von(
        &self,
        session: SessionId,
        empfaenger_version: u32,
    ) -> proto::UserState {
        let mut zustand = proto::UserState::default();
        let Some(client) = self.clients.get(&session) else {
            return zustand;
        };

        zustand.session = Some(session.wert());
        zustand.name = Some(client.angezeigter_name().to_string());
        zustand.channel_id = Some(client.kanal.wert());
        if let Some(digest) = &client.zert_digest {
            zustand.hash = Some(digest.clone());
        }

        if let Some(uid) = client.benutzer {
            zustand.user_id = Some(uid.wert());
            if let Some(benutzer) = self.benutzer.get(&uid) {
                if let Some(blob) = &benutzer.textur_blob {
                    if empfaenger_version >= BLOB_FAEHIGE_VERSION {
                        zustand.texture_hash = Some(blob.clone());
                    } else {
                        match self.blobs.holen(blob) {
                            Ok(inhalt) => zustand.texture = Some(inhalt),
                            Err(e) => tracing::error!(fehler = %e, "Textur-Blob fehlt"),
                        }
                    }
                }
                if let Some(blob) = &benutzer.kommentar_blob {
                    if empfaenger_version >= BLOB_FAEHIGE_VERSION {
                        zustand.comment_hash = Some(blob.clone());
                    } else {
                        match self.blobs.holen(blob) {
                            Ok(inhalt) => {
                                zustand.comment =
                                    Some(String::from_utf8_lossy(&inhalt).into_owned());
                            }
                            Err(e) => tracing::error!(fehler = %e, "Kommentar-Blob fehlt"),
                        }
                    }
                }
            }
        }

        if client.stumm {
            zustand.mute = Some(true);
        }
        if client.taub {
            zustand.deaf = Some(true);
        }
        if client.unterdrueckt {
            zustand.suppress = Some(true);
        }
        if client.selbst_stumm {
            zustand.self_mute = Some(true);
        }
        if client.selbst_taub {
            zustand.self_deaf = Some(true);
        }
        if client.prioritaets_sprecher {
            zustand.priority_speaker = Some(true);
        }
        if client.nimmt_auf {
            zustand.recording = Some(true);
        }
        if !client.plugin_kontext.is_empty() {
            zustand.plugin_context = Some(client.plugin_kontext.clone());
        }
        if !client.plugin_identitaet.is_empty() {
            zustand.plugin_identity = Some(client.plugin_identitaet.clone());
        }

        zustand
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Sendet an jede Session ab Zustand `Authentifiziert`
    ///
    /// Ein Sendefehler bricht den Broadcast dieser Nachricht ab; Aufrufer
    /// behandeln das als nicht-fatalen Log-Fall.
    pub(crate) fn broadcast(&self, nachricht: ControlMessage) -> bool {
        self.broadcast_wenn(nachricht, |_| true)
    }

    /// Gefilterte Broadcast-Variante
    pub(crate) fn broadcast_wenn(
        &self,
        nachricht: ControlMessage,
        praedikat: impl Fn(&Client) -> bool,
    ) -> bool {
        for client in self.clients.values() {
            if client.zustand < ClientZustand::Authentifiziert
                || client.zustand == ClientZustand::Tot
            {
                continue;
            }
            if !praedikat(client) {
                continue;
            }
            if !client.senden(nachricht.clone()) {
                tracing::debug!(
                    session = %client.session,
                    "Broadcast abgebrochen: Sende-Queue geschlossen"
                );
                return false;
            }
        }
        true
    }

    /// Anzahl der Sessions ab Zustand `Authentifiziert`
    pub(crate) fn sichtbare_sessions(&self) -> u32 {
        self.clients
            .values()
            .filter(|c| {
                c.zustand >= ClientZustand::Authentifiziert && c.zustand != ClientZustand::Tot
            })
            .count() as u32
    }

    // -----------------------------------------------------------------------
    // Codec-Verhandlung
    // -----------------------------------------------------------------------

    /// Waehlt das Server-Codec-Paar neu, nach jeder Aenderung der
    /// Session-Menge oder beworbener Codec-Listen
    pub(crate) fn codec_versionen_aktualisieren(&mut self) {
        let mut zaehler: HashMap<i32, usize> = HashMap::new();
        for client in self.clients.values() {
            if client.zustand < ClientZustand::Authentifiziert
                || client.zustand == ClientZustand::Tot
            {
                continue;
            }
            for codec in &client.codecs {
                *zaehler.entry(*codec).or_default() += 1;
            }
        }
        if zaehler.is_empty() {
            return;
        }

        let mut gewinner = 0i32;
        let mut anzahl = 0usize;
        for (&codec, &benutzer) in &zaehler {
            if benutzer > anzahl {
                anzahl = benutzer;
                gewinner = codec;
            }
            // Deterministischer Gleichstand: hoehere Codec-Kennung gewinnt
            if benutzer == anzahl && codec > gewinner {
                gewinner = codec;
            }
        }

        let aktuell = if self.bevorzuge_alpha {
            self.alpha_codec
        } else {
            self.beta_codec
        };
        if gewinner == aktuell {
            return;
        }

        if gewinner == CELT_COMPAT_BITSTREAM {
            self.bevorzuge_alpha = true;
        } else {
            self.bevorzuge_alpha = !self.bevorzuge_alpha;
        }

        if self.bevorzuge_alpha {
            self.alpha_codec = gewinner;
        } else {
            self.beta_codec = gewinner;
        }

        if !self.broadcast(ControlMessage::CodecVersion(proto::CodecVersion {
            alpha: self.alpha_codec,
            beta: self.beta_codec,
            prefer_alpha: self.bevorzuge_alpha,
        })) {
            tracing::warn!("CodecVersion-Broadcast abgebrochen");
            return;
        }

        let alpha = format!("{:#x}", self.alpha_codec as u32);
        let beta = format!("{:#x}", self.beta_codec as u32);
        tracing::info!(
            alpha = %alpha,
            beta = %beta,
            bevorzuge_alpha = self.bevorzuge_alpha,
            "Codec-Wechsel"
        );
    }

    // -----------------------------------------------------------------------
    // Kanalbaum
    // -----------------------------------------------------------------------

    /// Legt einen Kanal unter dem gegebenen Elternkanal an
    pub(crate) fn kanal_anlegen(
        &mut self,
        eltern: ChannelId,
        name: impl Into<String>,
        temporaer: bool,
    ) -> Option<ChannelId> {
        self.kanal_anlegen_mit(eltern, name, temporaer, 0, None)
    }

    /// Kanal-Anlage mit Position und Beschreibungs-Blob
    pub(crate) fn kanal_anlegen_mit(
        &mut self,
        eltern: ChannelId,
        name: impl Into<String>,
        temporaer: bool,
        position: i32,
        beschreibung_blob: Option<String>,
    ) -> Option<ChannelId> {
        if !self.kanaele.contains_key(&eltern) {
            return None;
        }
        let id = ChannelId(self.naechste_kanal_id);
        self.naechste_kanal_id += 1;

        let mut kanal = Kanal::neu(id, name);
        kanal.eltern = Some(eltern);
        kanal.temporaer = temporaer;
        kanal.position = position;
        kanal.beschreibung_blob = beschreibung_blob;
        let gefroren = kanal.einfrieren();
        self.kanaele.insert(id, kanal);
        if let Some(elternkanal) = self.kanaele.get_mut(&eltern) {
            elternkanal.kinder.insert(id);
        }
        self.cache.leeren();

        // Temporaere Kanaele werden nicht eingefroren
        if !temporaer {
            self.operation_protokollieren(Operation::KanalAnlegen { kanal: gefroren });
        }
        Some(id)
    }

    /// Verlinkt zwei Kanaele symmetrisch
    pub(crate) fn kanaele_verlinken(&mut self, a: ChannelId, b: ChannelId) {
        if a == b || !self.kanaele.contains_key(&a) || !self.kanaele.contains_key(&b) {
            return;
        }
        if let Some(kanal) = self.kanaele.get_mut(&a) {
            kanal.verknuepfungen.insert(b);
        }
        if let Some(kanal) = self.kanaele.get_mut(&b) {
            kanal.verknuepfungen.insert(a);
        }
        self.cache.leeren();
        self.kanal_persistieren(a);
        self.kanal_persistieren(b);
    }

    /// Loest eine Verlinkung symmetrisch (idempotent)
    pub(crate) fn kanaele_entlinken(&mut self, a: ChannelId, b: ChannelId) {
        let mut geaendert = false;
        if let Some(kanal) = self.kanaele.get_mut(&a) {
            geaendert |= kanal.verknuepfungen.remove(&b);
        }
        if let Some(kanal) = self.kanaele.get_mut(&b) {
            geaendert |= kanal.verknuepfungen.remove(&a);
        }
        if geaendert {
            self.cache.leeren();
            self.kanal_persistieren(a);
            self.kanal_persistieren(b);
        }
    }

    /// Protokolliert den aktuellen Zustand eines dauerhaften Kanals
    pub(crate) fn kanal_persistieren(&mut self, id: ChannelId) {
        let Some(kanal) = self.kanaele.get(&id) else {
            return;
        };
        if kanal.temporaer {
            return;
        }
        let gefroren = kanal.einfrieren();
        self.operation_protokollieren(Operation::KanalAktualisieren { kanal: gefroren });
    }

    /// Entfernt einen Kanal mitsamt Kaskade
    ///
    /// Pro Knoten: Verlinkungen beidseitig loesen, Mitglieder zum
    /// naechsten betretbaren Vorfahren AUSSERHALB des entfernten
    /// Teilbaums verschieben (je ein `UserState`-Broadcast), Unterkanaele
    /// rekursiv entfernen, abschliessend `ChannelRemove` broadcasten. Die
    /// `ChannelRemove`-Broadcasts laufen damit von den Blaettern zur
    /// Wurzel des entfernten Teilbaums.
    pub(crate) fn kanal_entfernen_kaskade(&mut self, kanal_id: ChannelId) {
        if kanal_id.ist_root() {
            tracing::warn!("Versuch den Root-Kanal zu entfernen");
            return;
        }
        if !self.kanaele.contains_key(&kanal_id) {
            return;
        }
        // Ziel-Suche fuer Mitglieder beginnt beim Elternkanal der
        // Entfernungs-Wurzel; alles darunter verschwindet gerade
        let auffang = self
            .kanaele
            .get(&kanal_id)
            .and_then(|k| k.eltern)
            .unwrap_or(ChannelId::ROOT);
        self.kanal_entfernen_rekursiv(kanal_id, auffang);
    }

    fn kanal_entfernen_rekursiv(&mut self, kanal_id: ChannelId, auffang: ChannelId) {
        let Some((eltern, verknuepfungen, mitglieder, temporaer)) =
            self.kanaele.get(&kanal_id).map(|k| {
                (
                    k.eltern,
                    k.verknuepfungen.iter().copied().collect::<Vec<_>>(),
                    k.mitglieder.iter().copied().collect::<Vec<_>>(),
                    k.temporaer,
                )
            })
        else {
            return;
        };

        // 1. Verlinkungen beidseitig loesen
        for andere in verknuepfungen {
            if let Some(kanal) = self.kanaele.get_mut(&andere) {
                kanal.verknuepfungen.remove(&kanal_id);
            }
            if let Some(kanal) = self.kanaele.get_mut(&kanal_id) {
                kanal.verknuepfungen.remove(&andere);
            }
        }

        // 2. Mitglieder zum naechsten Vorfahren mit Betreten-Recht
        for session in mitglieder {
            let mut ziel = auffang;
            loop {
                if self.hat_berechtigung(session, ziel, Berechtigung::ENTER) {
                    break;
                }
                match self.kanaele.get(&ziel).and_then(|k| k.eltern) {
                    Some(naechster) => ziel = naechster,
                    None => break,
                }
            }

            let mut zustand = proto::UserState {
                session: Some(session.wert()),
                channel_id: Some(ziel.wert()),
                ..Default::default()
            };
            self.kanal_betreten_intern(session, ziel, &mut zustand, false);
            if !self.broadcast(ControlMessage::UserState(zustand)) {
                tracing::warn!(session = %session, "UserState-Broadcast abgebrochen");
            }
        }

        // 3. Unterkanaele rekursiv entfernen
        let kinder: Vec<ChannelId> = self
            .kanaele
            .get(&kanal_id)
            .map(|k| k.kinder.iter().copied().collect())
            .unwrap_or_default();
        for kind in kinder {
            self.kanal_entfernen_rekursiv(kind, auffang);
        }

        // 4. Den Kanal selbst austragen
        if let Some(eltern_id) = eltern {
            if let Some(elternkanal) = self.kanaele.get_mut(&eltern_id) {
                elternkanal.kinder.remove(&kanal_id);
            }
        }
        self.kanaele.remove(&kanal_id);
        self.cache.leeren();

        if !temporaer {
            self.operation_protokollieren(Operation::KanalEntfernen {
                kanal_id: kanal_id.wert(),
            });
        }

        if !self.broadcast(ControlMessage::ChannelRemove(proto::ChannelRemove {
            channel_id: kanal_id.wert(),
        })) {
            tracing::warn!(kanal = %kanal_id, "ChannelRemove-Broadcast abgebrochen");
        }
        tracing::info!(kanal = %kanal_id, "Kanal entfernt");
    }

    /// Verschiebt eine Session in einen Kanal
    ///
    /// Berechnet Suppress neu, schickt die Kanal-Berechtigungen nach und
    /// entfernt den alten Kanal sofort wenn er temporaer und leer ist.
    pub(crate) fn kanal_betreten(
        &mut self,
        session: SessionId,
        ziel: ChannelId,
        zustand: &mut proto::UserState,
    ) {
        self.kanal_betreten_intern(session, ziel, zustand, true);
    }

    /// Kanal-Wechsel; `alte_raeumen` unterdrueckt das Aufraeumen geleerter
    /// temporaerer Kanaele waehrend einer laufenden Entfernungs-Kaskade
    fn kanal_betreten_intern(
        &mut self,
        session: SessionId,
        ziel: ChannelId,
        zustand: &mut proto::UserState,
        alte_raeumen: bool,
    ) {
        let Some(client) = self.clients.get(&session) else {
            return;
        };
        let alter = client.kanal;
        let bereits_drin = alter == ziel
            && self
                .kanaele
                .get(&ziel)
                .is_some_and(|k| k.mitglieder.contains(&session));
        if bereits_drin {
            return;
        }

        if let Some(kanal) = self.kanaele.get_mut(&alter) {
            kanal.mitglieder.remove(&session);
        }
        if let Some(kanal) = self.kanaele.get_mut(&ziel) {
            kanal.mitglieder.insert(session);
        }
        if let Some(client) = self.clients.get_mut(&session) {
            client.kanal = ziel;
        }

        self.cache.leeren();

        // Letzten Kanal der registrierten Identitaet nachziehen
        if let Some(uid) = self.clients.get(&session).and_then(|c| c.benutzer) {
            if !uid.ist_superuser() {
                if let Some(benutzer) = self.benutzer.get_mut(&uid) {
                    benutzer.letzter_kanal = ziel;
                    benutzer.zuletzt_gesehen = Utc::now().timestamp();
                    let gefroren = benutzer.einfrieren();
                    self.operation_protokollieren(Operation::BenutzerAktualisieren {
                        benutzer: gefroren,
                    });
                }
            }
        }

        // Geleerte temporaere Kanaele verschwinden sofort
        let temporaer_leer = alte_raeumen
            && alter != ziel
            && self
                .kanaele
                .get(&alter)
                .is_some_and(|k| k.temporaer && k.mitglieder.is_empty());
        if temporaer_leer {
            self.kanal_entfernen_kaskade(alter);
        }

        // Suppress folgt dem Sprechen-Recht im neuen Kanal
        let kann_sprechen = self.hat_berechtigung(session, ziel, Berechtigung::SPEAK);
        if let Some(client) = self.clients.get_mut(&session) {
            if kann_sprechen == client.unterdrueckt {
                client.unterdrueckt = !kann_sprechen;
                zustand.suppress = Some(client.unterdrueckt);
            }
        }

        self.client_berechtigungen_senden(session, ziel);
        if let Some(eltern) = self.kanaele.get(&ziel).and_then(|k| k.eltern) {
            self.client_berechtigungen_senden(session, eltern);
        }
    }

    // -----------------------------------------------------------------------
    // Berechtigungen
    // -----------------------------------------------------------------------

    /// Die Eltern-Kette von der Wurzel bis zum Kanal
    pub(crate) fn eltern_kette(&self, kanal: ChannelId) -> Vec<ChannelId> {
        let mut kette = Vec::new();
        let mut aktuell = Some(kanal);
        while let Some(id) = aktuell {
            kette.push(id);
            aktuell = self.kanaele.get(&id).and_then(|k| k.eltern);
            if kette.len() > self.kanaele.len() {
                break;
            }
        }
        kette.reverse();
        kette
    }

    /// Prueft ein Berechtigungs-Bit und befuellt dabei den Cache
    pub(crate) fn hat_berechtigung(
        &mut self,
        session: SessionId,
        kanal: ChannelId,
        bit: u32,
    ) -> bool {
        let Some(client) = self.clients.get(&session) else {
            return false;
        };
        // SuperUser: alle Bits implizit, kein Cache-Zugriff
        if client.ist_superuser() {
            return true;
        }

        let wert = self.cache.lesen(session, kanal);
        if Berechtigung::ist_gecached(wert) {
            return Berechtigung::ohne_cache_bit(wert) & bit != 0;
        }

        let kette_ids = self.eltern_kette(kanal);
        let kette: Vec<KettenGlied> = kette_ids
            .iter()
            .filter_map(|id| self.kanaele.get(id))
            .map(|k| KettenGlied {
                kanal: k.id,
                acl: &k.acl,
                gruppen: &k.gruppen,
                acl_erben: k.acl_erben,
            })
            .collect();
        if kette.is_empty() {
            return false;
        }
        let anfrager = Anfrager {
            session,
            benutzer: client.benutzer,
            kanal: client.kanal,
            zert_digest: client.zert_digest.as_deref(),
            tokens: &client.tokens,
        };
        let maske = resolver::berechtigungen(&kette, &anfrager);
        drop(kette);

        self.cache.setzen(session, kanal, maske);
        maske & bit != 0
    }

    /// Liest die gecachte Maske; ein fehlender Eintrag nach vorheriger
    /// Befuellung ist eine Integritaetsverletzung und beendet die Session
    pub(crate) fn berechtigung_lesen(
        &mut self,
        session: SessionId,
        kanal: ChannelId,
    ) -> Option<u32> {
        let wert = self.cache.lesen(session, kanal);
        if !Berechtigung::ist_gecached(wert) {
            self.session_panik(session, "Korrupter Berechtigungs-Cache");
            return None;
        }
        Some(Berechtigung::ohne_cache_bit(wert))
    }

    /// Schickt einer Session ihre Berechtigungen fuer einen Kanal
    pub(crate) fn client_berechtigungen_senden(&mut self, session: SessionId, kanal: ChannelId) {
        // SuperUser bekommt keine Berechtigungs-Updates
        if self
            .clients
            .get(&session)
            .is_none_or(|c| c.ist_superuser())
        {
            return;
        }

        self.hat_berechtigung(session, kanal, Berechtigung::ENTER);
        let Some(maske) = self.berechtigung_lesen(session, kanal) else {
            return;
        };

        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::PermissionQuery(proto::PermissionQuery {
                channel_id: Some(kanal.wert()),
                permissions: Some(maske),
                flush: None,
            }));
        }
    }

    /// Prueft ob die Session eines Mitglieds in einer benannten Gruppe
    /// eines Kanals ist (fuer Fluester-Ziele mit Gruppenfilter)
    pub(crate) fn session_in_gruppe(
        &self,
        mitglied: SessionId,
        kanal: ChannelId,
        gruppe: &str,
    ) -> bool {
        let Some(client) = self.clients.get(&mitglied) else {
            return false;
        };
        let kette_ids = self.eltern_kette(kanal);
        let kette: Vec<KettenGlied> = kette_ids
            .iter()
            .filter_map(|id| self.kanaele.get(id))
            .map(|k| KettenGlied {
                kanal: k.id,
                acl: &k.acl,
                gruppen: &k.gruppen,
                acl_erben: k.acl_erben,
            })
            .collect();
        if kette.is_empty() {
            return false;
        }
        let anfrager = Anfrager {
            session: mitglied,
            benutzer: client.benutzer,
            kanal: client.kanal,
            zert_digest: client.zert_digest.as_deref(),
            tokens: &client.tokens,
        };
        resolver::ist_gruppen_mitglied(&kette, kette.len() - 1, gruppe, &anfrager)
    }

    // -----------------------------------------------------------------------
    // Sprach-Verteilung
    // -----------------------------------------------------------------------

    /// Verteilt einen Sprach-Frame an seine Empfaenger
    ///
    /// Ziel 0 ist der aktuelle Kanal des Sprechers; 1-30 sind dessen
    /// registrierte Fluester-Ziele. Jeder Empfaenger bekommt den Frame
    /// ueber die serialisierte Sende-Schleife, verschluesselt mit seinem
    /// eigenen Schluessel.
    pub(crate) fn sprache_verteilen(&mut self, paket: SprachPaket) {
        let Some(absender) = self.clients.get(&paket.session) else {
            return;
        };
        if absender.zustand != ClientZustand::Bereit {
            return;
        }
        if absender.stumm || absender.unterdrueckt {
            return;
        }

        let empfaenger: Vec<SessionId> = if paket.ziel == 0 {
            let kanal = absender.kanal;
            self.kanaele
                .get(&kanal)
                .map(|k| {
                    k.mitglieder
                        .iter()
                        .copied()
                        .filter(|s| *s != paket.session)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            self.fluester_empfaenger(paket.session, paket.ziel)
        };

        if let Some(client) = self.clients.get_mut(&paket.session) {
            client.udp_pakete = client.udp_pakete.wrapping_add(1);
        }

        for session in empfaenger {
            let Some(ziel_client) = self.clients.get(&session) else {
                continue;
            };
            if ziel_client.zustand != ClientZustand::Bereit
                || ziel_client.taub
                || ziel_client.selbst_taub
            {
                continue;
            }
            let Some(adresse) = *ziel_client.udp_adresse.lock() else {
                continue;
            };

            let nachricht = UdpNachricht {
                daten: paket.daten.clone(),
                ziel: UdpZiel::Verschluesselt {
                    crypt: Arc::clone(&ziel_client.crypt),
                    adresse,
                },
            };
            if self.udpsend_tx.try_send(nachricht).is_err() {
                // Stille ist besser als Latenz
                tracing::trace!(session = %session, "Sende-Queue voll, Frame verworfen");
            }
        }
    }

    /// Loest ein Fluester-Ziel (1-30) zu seiner Empfaengermenge auf
    ///
    /// Vereinigung der gelisteten Sessions und der Mitglieder gelisteter
    /// Kanaele (optional um Verlinkungen und Unterkanaele erweitert),
    /// dedupliziert, ohne den Sprecher. Jeder Kanal verlangt das
    /// Fluester-Recht des Sprechers.
    pub(crate) fn fluester_empfaenger(&mut self, session: SessionId, ziel: u8) -> Vec<SessionId> {
        let Some(eintraege) = self
            .clients
            .get(&session)
            .and_then(|c| c.sprachziele.get(&ziel))
            .cloned()
        else {
            return Vec::new();
        };

        let mut menge: BTreeSet<SessionId> = BTreeSet::new();

        for eintrag in eintraege {
            // Direkt gelistete Sessions
            for roh in &eintrag.session {
                let ziel_session = SessionId(*roh);
                let Some(kanal) = self.clients.get(&ziel_session).map(|c| c.kanal) else {
                    continue;
                };
                if self.hat_berechtigung(session, kanal, Berechtigung::WHISPER) {
                    menge.insert(ziel_session);
                }
            }

            // Kanal-Ziele mit optionaler Erweiterung
            let Some(roh) = eintrag.channel_id else {
                continue;
            };
            let wurzel = ChannelId(roh);
            if !self.kanaele.contains_key(&wurzel) {
                continue;
            }

            let mut kandidaten: Vec<ChannelId> = if eintrag.children.unwrap_or(false) {
                self.unterbaum(wurzel)
            } else {
                vec![wurzel]
            };
            if eintrag.links.unwrap_or(false) {
                let verlinkte: Vec<ChannelId> = self
                    .kanaele
                    .get(&wurzel)
                    .map(|k| k.verknuepfungen.iter().copied().collect())
                    .unwrap_or_default();
                kandidaten.extend(verlinkte);
            }
            kandidaten.sort_unstable();
            kandidaten.dedup();

            for kanal in kandidaten {
                if !self.hat_berechtigung(session, kanal, Berechtigung::WHISPER) {
                    continue;
                }
                let mitglieder: Vec<SessionId> = self
                    .kanaele
                    .get(&kanal)
                    .map(|k| k.mitglieder.iter().copied().collect())
                    .unwrap_or_default();
                for mitglied in mitglieder {
                    if let Some(gruppe) = &eintrag.group {
                        if !self.session_in_gruppe(mitglied, kanal, gruppe) {
                            continue;
                        }
                    }
                    menge.insert(mitglied);
                }
            }
        }

        menge.remove(&session);
        menge.into_iter().collect()
    }

    /// Alle Kanaele des Teilbaums unterhalb (und inklusive) der Wurzel
    pub(crate) fn unterbaum(&self, wurzel: ChannelId) -> Vec<ChannelId> {
        let mut ergebnis = Vec::new();
        let mut stapel = vec![wurzel];
        while let Some(id) = stapel.pop() {
            if let Some(kanal) = self.kanaele.get(&id) {
                ergebnis.push(id);
                stapel.extend(kanal.kinder.iter().copied());
            }
        }
        ergebnis
    }

    // -----------------------------------------------------------------------
    // Benutzerregister
    // -----------------------------------------------------------------------

    /// Registriert die Identitaet einer Session (erfordert Zertifikat)
    pub(crate) fn registrieren(&mut self, session: SessionId) -> Result<UserId, &'static str> {
        let Some(client) = self.clients.get(&session) else {
            return Err("Unbekannte Session");
        };
        let Some(digest) = client.zert_digest.clone().filter(|d| !d.is_empty()) else {
            return Err("Registrierung erfordert ein Zertifikat");
        };
        let name = client.benutzername.clone();
        if self.nach_name.contains_key(&name) {
            return Err("Name ist bereits registriert");
        }

        let uid = UserId(self.naechste_benutzer_id);
        self.naechste_benutzer_id += 1;

        let mut benutzer = Benutzer::neu(uid, name.clone());
        benutzer.zert_digest = digest.clone();
        benutzer.zuletzt_gesehen = Utc::now().timestamp();
        let gefroren = benutzer.einfrieren();

        self.nach_name.insert(name, uid);
        self.nach_zertifikat.insert(digest, uid);
        self.benutzer.insert(uid, benutzer);
        if let Some(client) = self.clients.get_mut(&session) {
            client.benutzer = Some(uid);
        }

        self.operation_protokollieren(Operation::BenutzerAnlegen { benutzer: gefroren });
        tracing::info!(session = %session, benutzer = %uid, "Session registriert");
        Ok(uid)
    }

    /// Loescht eine Registrierung und entfernt alle Referenzen
    /// transitiv aus dem Kanalbaum
    pub(crate) fn registrierung_entfernen(&mut self, uid: UserId) -> bool {
        if uid.ist_superuser() {
            return false;
        }
        let Some(benutzer) = self.benutzer.remove(&uid) else {
            return false;
        };
        self.nach_name.remove(&benutzer.name);
        self.nach_zertifikat.remove(&benutzer.zert_digest);

        for kanal in self.kanaele.values_mut() {
            kanal.acl.retain(|eintrag| eintrag.benutzer_id != Some(uid));
            for gruppe in kanal.gruppen.values_mut() {
                gruppe.hinzu.remove(&uid.wert());
                gruppe.entfernt.remove(&uid.wert());
                gruppe.temporaer.remove(&uid.wert());
            }
        }

        // Angemeldete Sessions dieser Identitaet werden unregistriert
        for client in self.clients.values_mut() {
            if client.benutzer == Some(uid) {
                client.benutzer = None;
            }
        }

        self.cache.leeren();
        self.operation_protokollieren(Operation::BenutzerEntfernen {
            benutzer_id: uid.wert(),
        });
        tracing::info!(benutzer = %uid, "Registrierung entfernt");
        true
    }

    // -----------------------------------------------------------------------
    // Konfiguration und Persistenz
    // -----------------------------------------------------------------------

    /// Uebernimmt eine Konfigurations-Aenderung und friert sie ein
    pub(crate) fn konfig_aktualisieren(&mut self, schluessel: String, wert: String) {
        tracing::info!(schluessel = %schluessel, "Konfiguration aktualisiert");
        self.konfiguration.setzen(schluessel.clone(), wert.clone());
        self.probe_info_aktualisieren();
        self.operation_protokollieren(Operation::KonfigSetzen { schluessel, wert });
    }

    /// Setzt das SuperUser-Passwort (erzeugt Salt und Digest neu)
    pub fn superuser_passwort_setzen(&mut self, passwort: &str) {
        let eintrag = raunen_auth::passwort_digest_erzeugen(passwort);
        self.konfig_aktualisieren("SuperUserPassword".to_string(), eintrag);
    }

    /// Haengt eine Operation an das Log an und zaehlt sie
    pub(crate) fn operation_protokollieren(&mut self, op: Operation) {
        if let Some(protokoll) = &mut self.protokoll {
            if let Err(e) = protokoll.anhaengen(&op) {
                tracing::error!(fehler = %e, "Operationslog nicht beschreibbar");
            }
        }
        self.log_operationen += 1;
    }

    /// Schreibt ein Voll-Abbild sobald die Schwelle erreicht ist
    ///
    /// Ein Fehlschlag beim Abbild-Schreiben ist fatal fuer den Prozess.
    pub(crate) fn abbild_pruefen(&mut self) {
        if self.log_operationen < self.abbild_schwelle {
            return;
        }
        tracing::info!(operationen = self.log_operationen, "Schreibe Voll-Abbild");

        let abbild = self.abbild_erzeugen();
        let ergebnis = raunen_freezer::abbild_schreiben(&self.daten_verzeichnis, &abbild)
            .and_then(|()| Protokoll::oeffnen(&self.daten_verzeichnis));
        match ergebnis {
            Ok(protokoll) => {
                self.protokoll = Some(protokoll);
                self.log_operationen = 0;
            }
            Err(e) => {
                tracing::error!(fehler = %e, "Voll-Abbild nicht schreibbar");
                std::process::exit(1);
            }
        }
    }

    /// Friert den vollstaendigen Zustand ein
    ///
    /// Temporaere Kanaele (und ihre Teilbaeume) sind fluechtig und fehlen
    /// im Abbild.
    pub(crate) fn abbild_erzeugen(&self) -> Abbild {
        let mut kanaele = Vec::new();
        let mut stapel = vec![ChannelId::ROOT];
        while let Some(id) = stapel.pop() {
            let Some(kanal) = self.kanaele.get(&id) else {
                continue;
            };
            if kanal.temporaer {
                continue;
            }
            kanaele.push(kanal.einfrieren());
            stapel.extend(kanal.kinder.iter().copied());
        }
        kanaele.sort_by_key(|k| k.id);

        let mut benutzer: Vec<_> = self.benutzer.values().map(|b| b.einfrieren()).collect();
        benutzer.sort_by_key(|b| b.id);

        Abbild {
            benutzer,
            kanaele,
            bans: self.bans.read().clone(),
            konfiguration: self.konfiguration.alle().clone(),
            naechste_kanal_id: self.naechste_kanal_id,
            naechste_benutzer_id: self.naechste_benutzer_id,
        }
    }

    /// Stellt den Zustand aus einem Abbild wieder her (beim Start)
    pub fn abbild_uebernehmen(&mut self, abbild: Abbild) {
        self.konfiguration = Konfiguration::aus_map(abbild.konfiguration);
        *self.bans.write() = abbild.bans;

        self.benutzer.clear();
        self.nach_name.clear();
        self.nach_zertifikat.clear();
        let mut hoechste_benutzer_id = 0;
        for gefroren in abbild.benutzer {
            let benutzer = Benutzer::auftauen(gefroren);
            hoechste_benutzer_id = hoechste_benutzer_id.max(benutzer.id.wert());
            self.nach_name.insert(benutzer.name.clone(), benutzer.id);
            if !benutzer.zert_digest.is_empty() {
                self.nach_zertifikat
                    .insert(benutzer.zert_digest.clone(), benutzer.id);
            }
            self.benutzer.insert(benutzer.id, benutzer);
        }
        // SuperUser-Identitaet sicherstellen
        if !self.benutzer.contains_key(&UserId::SUPERUSER) {
            let superuser = Benutzer::neu(UserId::SUPERUSER, "SuperUser");
            self.nach_name.insert(superuser.name.clone(), UserId::SUPERUSER);
            self.benutzer.insert(UserId::SUPERUSER, superuser);
        }

        self.kanaele.clear();
        let mut hoechste_kanal_id = 0;
        for gefroren in abbild.kanaele {
            let kanal = Kanal::auftauen(gefroren);
            hoechste_kanal_id = hoechste_kanal_id.max(kanal.id.wert());
            self.kanaele.insert(kanal.id, kanal);
        }
        if !self.kanaele.contains_key(&ChannelId::ROOT) {
            self.kanaele
                .insert(ChannelId::ROOT, Kanal::neu(ChannelId::ROOT, "Root"));
        }

        // Kinder-Mengen aus den Eltern-IDs aufbauen
        let ids: Vec<ChannelId> = self.kanaele.keys().copied().collect();
        let mut paare = Vec::new();
        for id in &ids {
            if let Some(eltern) = self.kanaele.get(id).and_then(|k| k.eltern) {
                paare.push((eltern, *id));
            }
        }
        for (eltern, kind) in paare {
            if let Some(kanal) = self.kanaele.get_mut(&eltern) {
                kanal.kinder.insert(kind);
            }
        }

        // Verlinkungen auf existierende Kanaele einschraenken und
        // Symmetrie herstellen
        let mut symmetrisch = Vec::new();
        for id in &ids {
            if let Some(kanal) = self.kanaele.get_mut(id) {
                let vorher = std::mem::take(&mut kanal.verknuepfungen);
                kanal.verknuepfungen = vorher
                    .into_iter()
                    .filter(|v| *v != *id)
                    .collect();
            }
            if let Some(kanal) = self.kanaele.get(id) {
                for andere in &kanal.verknuepfungen {
                    symmetrisch.push((*andere, *id));
                }
            }
        }
        for (kanal_id, gegenseite) in symmetrisch {
            match self.kanaele.get_mut(&kanal_id) {
                Some(kanal) => {
                    kanal.verknuepfungen.insert(gegenseite);
                }
                None => {
                    if let Some(kanal) = self.kanaele.get_mut(&gegenseite) {
                        kanal.verknuepfungen.remove(&kanal_id);
                    }
                }
            }
        }

        self.naechste_kanal_id = abbild.naechste_kanal_id.max(hoechste_kanal_id + 1);
        self.naechste_benutzer_id = abbild.naechste_benutzer_id.max(hoechste_benutzer_id + 1);
        self.cache.leeren();
        self.probe_info_aktualisieren();

        tracing::info!(
            kanaele = self.kanaele.len(),
            benutzer = self.benutzer.len(),
            "Zustand wiederhergestellt"
        );
    }

    /// Haelt die Kennzahlen fuer Probe-Antworten aktuell
    pub(crate) fn probe_info_aktualisieren(&self) {
        self.probe_info
            .benutzer
            .store(self.sichtbare_sessions(), Ordering::Relaxed);
        self.probe_info
            .max_benutzer
            .store(self.konfiguration.u32_wert("MaxUsers"), Ordering::Relaxed);
        self.probe_info.max_bandbreite.store(
            self.konfiguration.u32_wert("MaxBandwidth"),
            Ordering::Relaxed,
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testhilfe;
    use raunen_acl::AclEintrag;
    use raunen_protocol::control::PaketStatistik;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_server() -> (Server, tempfile::TempDir) {
        let verzeichnis = tempfile::tempdir().expect("Temp-Verzeichnis");
        let server = Server::neu(1, verzeichnis.path());
        (server, verzeichnis)
    }

    /// Fuegt eine bereite Session im Root-Kanal hinzu
    fn bereiter_client(
        server: &mut Server,
        name: &str,
    ) -> (SessionId, UnboundedReceiver<ControlMessage>) {
        let session = server.pool.holen();
        let (mut client, empfaenger) = testhilfe::attrappe(session);
        client.benutzername = name.to_string();
        client.zustand = ClientZustand::Bereit;
        server
            .kanaele
            .get_mut(&ChannelId::ROOT)
            .expect("Root existiert")
            .mitglieder
            .insert(session);
        server.clients.insert(session, client);
        (session, empfaenger)
    }

    /// Fuegt eine frisch verbundene Session hinzu (vor der Auth)
    fn roher_client(
        server: &mut Server,
        name: &str,
    ) -> (SessionId, UnboundedReceiver<ControlMessage>) {
        let session = server.pool.holen();
        let (mut client, empfaenger) = testhilfe::attrappe(session);
        client.benutzername = name.to_string();
        client.zustand = ClientZustand::VersionGesendet;
        server.clients.insert(session, client);
        (session, empfaenger)
    }

    fn alle_nachrichten(empfaenger: &mut UnboundedReceiver<ControlMessage>) -> Vec<ControlMessage> {
        let mut nachrichten = Vec::new();
        while let Ok(nachricht) = empfaenger.try_recv() {
            nachrichten.push(nachricht);
        }
        nachrichten
    }

    // -----------------------------------------------------------------------
    // Kanalbaum-Invarianten
    // -----------------------------------------------------------------------

    #[test]
    fn verlinken_ist_symmetrisch_und_entlinken_idempotent() {
        let (mut server, _verzeichnis) = test_server();
        let a = server.kanal_anlegen(ChannelId::ROOT, "A", false).unwrap();
        let b = server.kanal_anlegen(ChannelId::ROOT, "B", false).unwrap();

        server.kanaele_verlinken(a, b);
        assert!(server.kanaele[&a].verknuepfungen.contains(&b));
        assert!(server.kanaele[&b].verknuepfungen.contains(&a));

        // unlink(A,B); unlink(A,B) == unlink(A,B)
        server.kanaele_entlinken(a, b);
        server.kanaele_entlinken(a, b);
        assert!(server.kanaele[&a].verknuepfungen.is_empty());
        assert!(server.kanaele[&b].verknuepfungen.is_empty());
    }

    #[test]
    fn kanal_anlegen_und_entfernen_stellt_zustand_wieder_her() {
        let (mut server, _verzeichnis) = test_server();
        let vorher: Vec<ChannelId> = {
            let mut ids: Vec<_> = server.kanaele.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        let zaehler_vorher = server.naechste_kanal_id;

        let neu = server.kanal_anlegen(ChannelId::ROOT, "Fluechtig", false).unwrap();
        server.kanal_entfernen_kaskade(neu);

        let nachher: Vec<ChannelId> = {
            let mut ids: Vec<_> = server.kanaele.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(vorher, nachher);
        // Kanal-IDs werden nie wiederverwendet
        assert_eq!(server.naechste_kanal_id, zaehler_vorher + 1);
        assert!(server.kanaele[&ChannelId::ROOT].kinder.is_empty());
    }

    #[test]
    fn eltern_kette_laeuft_von_der_wurzel() {
        let (mut server, _verzeichnis) = test_server();
        let a = server.kanal_anlegen(ChannelId::ROOT, "A", false).unwrap();
        let b = server.kanal_anlegen(a, "B", false).unwrap();

        assert_eq!(server.eltern_kette(b), vec![ChannelId::ROOT, a, b]);
        assert_eq!(server.eltern_kette(ChannelId::ROOT), vec![ChannelId::ROOT]);
    }

    #[test]
    fn root_ist_nicht_entfernbar() {
        let (mut server, _verzeichnis) = test_server();
        server.kanal_entfernen_kaskade(ChannelId::ROOT);
        assert!(server.kanaele.contains_key(&ChannelId::ROOT));
    }

    // -----------------------------------------------------------------------
    // Szenario: Kaskade beim Kanal-Entfernen
    // -----------------------------------------------------------------------

    #[test]
    fn kaskade_verschiebt_mitglieder_und_loest_verlinkungen() {
        let (mut server, _verzeichnis) = test_server();
        let c1 = server.kanal_anlegen(ChannelId::ROOT, "C1", false).unwrap();
        let c2 = server.kanal_anlegen(c1, "C2", false).unwrap();
        let d = server.kanal_anlegen(ChannelId::ROOT, "D", false).unwrap();
        server.kanaele_verlinken(c1, d);

        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (_beobachter, mut rb) = bereiter_client(&mut server, "beobachter");

        // A sitzt in C2
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(a, c2, &mut bewegung);
        let _ = alle_nachrichten(&mut rb);

        server.kanal_entfernen_kaskade(c1);

        // Erwartete Broadcast-Reihenfolge: UserState (A nach Root),
        // ChannelRemove C2, ChannelRemove C1
        let nachrichten = alle_nachrichten(&mut rb);
        let relevante: Vec<&ControlMessage> = nachrichten
            .iter()
            .filter(|n| {
                matches!(
                    n,
                    ControlMessage::UserState(_) | ControlMessage::ChannelRemove(_)
                )
            })
            .collect();
        assert_eq!(relevante.len(), 3, "drei Broadcasts erwartet");
        match relevante[0] {
            ControlMessage::UserState(u) => {
                assert_eq!(u.session, Some(a.wert()));
                assert_eq!(u.channel_id, Some(ChannelId::ROOT.wert()));
            }
            andere => panic!("UserState erwartet, war {:?}", andere.kind_name()),
        }
        match relevante[1] {
            ControlMessage::ChannelRemove(c) => assert_eq!(c.channel_id, c2.wert()),
            andere => panic!("ChannelRemove C2 erwartet, war {:?}", andere.kind_name()),
        }
        match relevante[2] {
            ControlMessage::ChannelRemove(c) => assert_eq!(c.channel_id, c1.wert()),
            andere => panic!("ChannelRemove C1 erwartet, war {:?}", andere.kind_name()),
        }

        // D traegt keine Verlinkung mehr
        assert!(server.kanaele[&d].verknuepfungen.is_empty());
        // A ist wieder Mitglied des Root-Kanals
        assert!(server.kanaele[&ChannelId::ROOT].mitglieder.contains(&a));
        assert_eq!(server.clients[&a].kanal, ChannelId::ROOT);
    }

    // -----------------------------------------------------------------------
    // Szenario: Codec-Verhandlung
    // -----------------------------------------------------------------------

    #[test]
    fn codec_wechsel_wird_genau_einmal_broadcastet() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, mut rb) = bereiter_client(&mut server, "bob");
        server.clients.get_mut(&a).unwrap().codecs = vec![CELT_COMPAT_BITSTREAM, 8];
        server.clients.get_mut(&b).unwrap().codecs = vec![8];

        server.codec_versionen_aktualisieren();

        let wechsel: Vec<ControlMessage> = alle_nachrichten(&mut rb)
            .into_iter()
            .filter(|n| matches!(n, ControlMessage::CodecVersion(_)))
            .collect();
        assert_eq!(wechsel.len(), 1, "genau ein CodecVersion-Broadcast");
        let ControlMessage::CodecVersion(version) = &wechsel[0] else {
            unreachable!();
        };
        // Codec 8 gewinnt die Auszaehlung (2 gegen 1) und landet im
        // neu bevorzugten Slot
        assert_eq!(version.alpha, 8);
        assert_eq!(version.beta, 0);
        assert!(version.prefer_alpha);

        // Unveraenderte Lage: kein weiterer Broadcast
        server.codec_versionen_aktualisieren();
        assert!(alle_nachrichten(&mut rb)
            .iter()
            .all(|n| !matches!(n, ControlMessage::CodecVersion(_))));
    }

    #[test]
    fn codec_gleichstand_hoehere_kennung_gewinnt() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        server.clients.get_mut(&a).unwrap().codecs = vec![5];
        server.clients.get_mut(&b).unwrap().codecs = vec![9];

        server.codec_versionen_aktualisieren();
        // 5 und 9 haben je eine Stimme; die hoehere Kennung gewinnt
        assert_eq!(server.alpha_codec, 9);
        assert!(server.bevorzuge_alpha);
    }

    #[test]
    fn kompat_bitstream_erzwingt_alpha() {
        let (mut server, _verzeichnis) = test_server();
        server.bevorzuge_alpha = false;
        server.beta_codec = 8;
        let (a, _ra) = bereiter_client(&mut server, "alice");
        server.clients.get_mut(&a).unwrap().codecs = vec![CELT_COMPAT_BITSTREAM];

        server.codec_versionen_aktualisieren();
        assert!(server.bevorzuge_alpha);
        assert_eq!(server.alpha_codec, CELT_COMPAT_BITSTREAM);
    }

    // -----------------------------------------------------------------------
    // Szenario: doppelte Anmeldung
    // -----------------------------------------------------------------------

    #[test]
    fn doppelte_anmeldung_wird_abgelehnt() {
        let (mut server, _verzeichnis) = test_server();
        let uid = UserId(5);
        let (s1, _r1) = bereiter_client(&mut server, "bob");
        server.clients.get_mut(&s1).unwrap().benutzer = Some(uid);

        let (s2, mut r2) = roher_client(&mut server, "bob");
        server.authentifizierung_abschliessen(AuthAbschluss {
            session: s2,
            ergebnis: Ok(Some(uid)),
        });

        // Die neue Session bekommt das Reject und verschwindet
        let nachrichten = alle_nachrichten(&mut r2);
        assert!(nachrichten.iter().any(|n| matches!(
            n,
            ControlMessage::Reject(proto::Reject {
                reject_type: Some(proto::RejectGrund::UsernameInUse),
                ..
            })
        )));
        assert!(!server.clients.contains_key(&s2));

        // Die aeltere Session bleibt bereit
        assert_eq!(server.clients[&s1].zustand, ClientZustand::Bereit);
    }

    // -----------------------------------------------------------------------
    // Szenario: Abbild-Schwelle
    // -----------------------------------------------------------------------

    #[test]
    fn abbild_nach_schwelle_genau_einmal() {
        let (mut server, verzeichnis) = test_server();
        server.abbild_schwelle = 3;
        server.protokoll = Some(Protokoll::oeffnen(verzeichnis.path()).unwrap());

        // Mutation 1 und 2: Kanaele anlegen
        let a = server.kanal_anlegen(ChannelId::ROOT, "A", false).unwrap();
        server.abbild_pruefen();
        assert!(raunen_freezer::abbild_lesen(verzeichnis.path()).unwrap().is_none());

        let b = server.kanal_anlegen(ChannelId::ROOT, "B", false).unwrap();
        server.abbild_pruefen();
        assert!(raunen_freezer::abbild_lesen(verzeichnis.path()).unwrap().is_none());

        // Mutation 3: Verlinken ueberschreitet die Schwelle
        server.kanaele_verlinken(a, b);
        server.abbild_pruefen();

        let abbild = raunen_freezer::abbild_lesen(verzeichnis.path())
            .unwrap()
            .expect("Abbild muss geschrieben sein");
        assert_eq!(abbild.kanaele.len(), 3); // Root, A, B
        assert!(abbild
            .kanaele
            .iter()
            .find(|k| k.id == a.wert())
            .unwrap()
            .verknuepfungen
            .contains(&b.wert()));

        // Der Zaehler ist zurueckgesetzt, das Log frisch
        assert_eq!(server.log_operationen, 0);
        assert!(raunen_freezer::protokoll_lesen(verzeichnis.path())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn abbild_und_wiederherstellung_round_trip() {
        let (mut server, verzeichnis) = test_server();
        let a = server.kanal_anlegen(ChannelId::ROOT, "Lounge", false).unwrap();
        let b = server.kanal_anlegen(a, "Ecke", false).unwrap();
        server.kanaele_verlinken(a, b);
        server.konfig_aktualisieren("MaxUsers".into(), "25".into());

        let abbild = server.abbild_erzeugen();
        let (mut zweiter, _verzeichnis2) = test_server();
        zweiter.abbild_uebernehmen(abbild);

        assert!(zweiter.kanaele.contains_key(&a));
        assert!(zweiter.kanaele[&a].kinder.contains(&b));
        assert!(zweiter.kanaele[&b].verknuepfungen.contains(&a));
        assert_eq!(zweiter.konfiguration.u32_wert("MaxUsers"), 25);
        assert_eq!(zweiter.naechste_kanal_id, server.naechste_kanal_id);
        let _ = verzeichnis;
    }

    #[test]
    fn temporaere_kanaele_fehlen_im_abbild() {
        let (mut server, _verzeichnis) = test_server();
        server.kanal_anlegen(ChannelId::ROOT, "Dauerhaft", false).unwrap();
        let temporaer = server.kanal_anlegen(ChannelId::ROOT, "Temp", true).unwrap();
        server.kanal_anlegen(temporaer, "TempKind", false).unwrap();

        let abbild = server.abbild_erzeugen();
        let namen: Vec<&str> = abbild.kanaele.iter().map(|k| k.name.as_str()).collect();
        assert!(namen.contains(&"Root"));
        assert!(namen.contains(&"Dauerhaft"));
        assert!(!namen.contains(&"Temp"));
        assert!(!namen.contains(&"TempKind"), "Teilbaum faellt mit weg");
    }

    // -----------------------------------------------------------------------
    // Szenario: Sprach-Relay
    // -----------------------------------------------------------------------

    fn udp_adresse_setzen(server: &Server, session: SessionId, port: u16) {
        let adresse: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        *server.clients[&session].udp_adresse.lock() = Some(adresse);
    }

    #[test]
    fn sprach_relay_erreicht_nur_andere_kanal_mitglieder() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        udp_adresse_setzen(&server, a, 40001);
        udp_adresse_setzen(&server, b, 40002);

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();

        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 0,
            daten: vec![0x80, 1, 2, 3],
        });

        // Genau ein Datagram, an Bs Adresse, mit Bs Schluessel
        let nachricht = udpsend_rx.try_recv().expect("ein Datagram erwartet");
        match nachricht.ziel {
            UdpZiel::Verschluesselt { crypt, adresse } => {
                assert_eq!(adresse, *server.clients[&b].udp_adresse.lock().as_ref().unwrap());
                assert!(Arc::ptr_eq(&crypt, &server.clients[&b].crypt));
            }
            UdpZiel::Klartext { .. } => panic!("Voice ist immer verschluesselt"),
        }
        assert!(udpsend_rx.try_recv().is_err(), "keines an den Sprecher");
    }

    #[test]
    fn taube_und_fremde_kanaele_erhalten_keine_sprache() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        let (c, _rc) = bereiter_client(&mut server, "carol");
        udp_adresse_setzen(&server, b, 40010);
        udp_adresse_setzen(&server, c, 40011);

        // B ist taub, C sitzt woanders
        server.clients.get_mut(&b).unwrap().selbst_taub = true;
        let anderer = server.kanal_anlegen(ChannelId::ROOT, "Anderswo", false).unwrap();
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(c, anderer, &mut bewegung);

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();
        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 0,
            daten: vec![0x80, 9],
        });
        assert!(udpsend_rx.try_recv().is_err());
    }

    #[test]
    fn stummgeschaltete_sprecher_werden_nicht_verteilt() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        udp_adresse_setzen(&server, b, 40020);
        server.clients.get_mut(&a).unwrap().stumm = true;

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();
        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 0,
            daten: vec![0x80],
        });
        assert!(udpsend_rx.try_recv().is_err());
    }

    // -----------------------------------------------------------------------
    // Fluester-Ziele
    // -----------------------------------------------------------------------

    #[test]
    fn fluester_ziel_auf_sessions() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        let (c, _rc) = bereiter_client(&mut server, "carol");
        udp_adresse_setzen(&server, b, 40030);
        udp_adresse_setzen(&server, c, 40031);

        server.clients.get_mut(&a).unwrap().sprachziele.insert(
            2,
            vec![proto::VoiceTargetZiel {
                session: vec![b.wert()],
                ..Default::default()
            }],
        );

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();
        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 2,
            daten: vec![0x82],
        });

        let nachricht = udpsend_rx.try_recv().expect("B muss den Frame bekommen");
        match nachricht.ziel {
            UdpZiel::Verschluesselt { adresse, .. } => {
                assert_eq!(adresse.port(), 40030);
            }
            UdpZiel::Klartext { .. } => panic!("verschluesselt erwartet"),
        }
        assert!(udpsend_rx.try_recv().is_err(), "C ist kein Ziel");
    }

    #[test]
    fn fluester_ziel_auf_kanal_mit_verlinkung() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        let (c, _rc) = bereiter_client(&mut server, "carol");

        let ziel_kanal = server.kanal_anlegen(ChannelId::ROOT, "Ziel", false).unwrap();
        let verlinkt = server.kanal_anlegen(ChannelId::ROOT, "Verlinkt", false).unwrap();
        server.kanaele_verlinken(ziel_kanal, verlinkt);

        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(b, ziel_kanal, &mut bewegung);
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(c, verlinkt, &mut bewegung);
        udp_adresse_setzen(&server, b, 40040);
        udp_adresse_setzen(&server, c, 40041);

        server.clients.get_mut(&a).unwrap().sprachziele.insert(
            5,
            vec![proto::VoiceTargetZiel {
                channel_id: Some(ziel_kanal.wert()),
                links: Some(true),
                ..Default::default()
            }],
        );

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();
        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 5,
            daten: vec![0x85],
        });

        let mut ports = Vec::new();
        while let Ok(nachricht) = udpsend_rx.try_recv() {
            if let UdpZiel::Verschluesselt { adresse, .. } = nachricht.ziel {
                ports.push(adresse.port());
            }
        }
        ports.sort_unstable();
        assert_eq!(ports, vec![40040, 40041], "Kanal plus Verlinkung");
    }

    #[test]
    fn unregistriertes_fluester_ziel_verhallt() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (b, _rb) = bereiter_client(&mut server, "bob");
        udp_adresse_setzen(&server, b, 40050);

        let mut udpsend_rx = server.udpsend_rx.take().unwrap();
        server.sprache_verteilen(SprachPaket {
            session: a,
            ziel: 7,
            daten: vec![0x87],
        });
        assert!(udpsend_rx.try_recv().is_err());
    }

    // -----------------------------------------------------------------------
    // Berechtigungen und Cache
    // -----------------------------------------------------------------------

    #[test]
    fn superuser_umgeht_den_cache() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _r) = bereiter_client(&mut server, "SuperUser");
        server.clients.get_mut(&s).unwrap().benutzer = Some(UserId::SUPERUSER);

        assert!(server.hat_berechtigung(s, ChannelId::ROOT, Berechtigung::WRITE));
        assert!(server.cache.is_empty(), "SuperUser erzeugt keine Cache-Eintraege");
    }

    #[test]
    fn berechtigungs_cache_wird_befuellt_und_invalidiert() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _r) = bereiter_client(&mut server, "alice");

        assert!(server.hat_berechtigung(s, ChannelId::ROOT, Berechtigung::SPEAK));
        assert!(Berechtigung::ist_gecached(
            server.cache.lesen(s, ChannelId::ROOT)
        ));

        // Jede ACL-relevante Mutation leert den Cache vollstaendig
        server.kanal_anlegen(ChannelId::ROOT, "Neu", false).unwrap();
        assert!(server.cache.is_empty());
    }

    #[test]
    fn acl_entzug_wirkt_nach_cache_invalidierung() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _r) = bereiter_client(&mut server, "alice");

        assert!(server.hat_berechtigung(s, ChannelId::ROOT, Berechtigung::SPEAK));

        // Sprechen fuer alle entziehen
        server
            .kanaele
            .get_mut(&ChannelId::ROOT)
            .unwrap()
            .acl
            .push(AclEintrag::fuer_gruppe("all", 0, Berechtigung::SPEAK));
        server.cache.leeren();

        assert!(!server.hat_berechtigung(s, ChannelId::ROOT, Berechtigung::SPEAK));
    }

    // -----------------------------------------------------------------------
    // Registrierung
    // -----------------------------------------------------------------------

    #[test]
    fn registrierung_verlangt_zertifikat() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _r) = bereiter_client(&mut server, "alice");

        assert!(server.registrieren(s).is_err());

        server.clients.get_mut(&s).unwrap().zert_digest = Some("ab".repeat(20));
        let uid = server.registrieren(s).expect("Registrierung mit Zertifikat");
        assert_eq!(server.clients[&s].benutzer, Some(uid));
        assert_eq!(server.nach_name.get("alice"), Some(&uid));
    }

    #[test]
    fn registrierung_entfernen_raeumt_referenzen() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _r) = bereiter_client(&mut server, "alice");
        server.clients.get_mut(&s).unwrap().zert_digest = Some("cd".repeat(20));
        let uid = server.registrieren(s).unwrap();

        // Referenzen in ACL und Gruppen eines Unterkanals
        let kanal = server.kanal_anlegen(ChannelId::ROOT, "K", false).unwrap();
        server
            .kanaele
            .get_mut(&kanal)
            .unwrap()
            .acl
            .push(AclEintrag::fuer_benutzer(uid, Berechtigung::WRITE, 0));
        let mut gruppe = raunen_acl::Gruppe::neu("team");
        gruppe.hinzu.insert(uid.wert());
        server
            .kanaele
            .get_mut(&kanal)
            .unwrap()
            .gruppen
            .insert("team".into(), gruppe);

        assert!(server.registrierung_entfernen(uid));

        let kanal = &server.kanaele[&kanal];
        assert!(kanal.acl.is_empty());
        assert!(kanal.gruppen["team"].hinzu.is_empty());
        assert_eq!(server.clients[&s].benutzer, None);
        assert!(!server.benutzer.contains_key(&uid));

        // SuperUser ist nicht loeschbar
        assert!(!server.registrierung_entfernen(UserId::SUPERUSER));
    }

    // -----------------------------------------------------------------------
    // Temporaere Kanaele
    // -----------------------------------------------------------------------

    #[test]
    fn temporaerer_kanal_verschwindet_beim_leeren() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (_b, mut rb) = bereiter_client(&mut server, "beobachter");

        let temporaer = server.kanal_anlegen(ChannelId::ROOT, "Temp", true).unwrap();
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(a, temporaer, &mut bewegung);
        assert!(server.kanaele.contains_key(&temporaer));
        let _ = alle_nachrichten(&mut rb);

        // Zurueck in den Root: der temporaere Kanal leert sich und
        // verschwindet im selben Ereignis
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(a, ChannelId::ROOT, &mut bewegung);

        assert!(!server.kanaele.contains_key(&temporaer));
        assert!(alle_nachrichten(&mut rb)
            .iter()
            .any(|n| matches!(n, ControlMessage::ChannelRemove(c) if c.channel_id == temporaer.wert())));
    }

    #[test]
    fn temporaerer_kanal_verschwindet_beim_trennen() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let temporaer = server.kanal_anlegen(ChannelId::ROOT, "Temp", true).unwrap();
        let mut bewegung = proto::UserState::default();
        server.kanal_betreten(a, temporaer, &mut bewegung);

        server.client_entfernen(a, false);
        assert!(!server.kanaele.contains_key(&temporaer));
    }

    // -----------------------------------------------------------------------
    // Session-Abbau
    // -----------------------------------------------------------------------

    #[test]
    fn client_entfernen_ist_idempotent_und_broadcastet() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (_b, mut rb) = bereiter_client(&mut server, "bob");

        server.client_entfernen(a, false);
        assert!(!server.clients.contains_key(&a));
        assert!(!server.kanaele[&ChannelId::ROOT].mitglieder.contains(&a));
        assert!(alle_nachrichten(&mut rb)
            .iter()
            .any(|n| matches!(n, ControlMessage::UserRemove(u) if u.session == a.wert())));

        // Zweiter Abbau ist wirkungslos
        server.client_entfernen(a, false);
        assert!(alle_nachrichten(&mut rb)
            .iter()
            .all(|n| !matches!(n, ControlMessage::UserRemove(_))));
    }

    #[test]
    fn gekickte_sessions_broadcasten_kein_eigenes_user_remove() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        let (_b, mut rb) = bereiter_client(&mut server, "bob");

        // Kick-Pfade senden ihr UserRemove selbst vor dem Abbau
        server.client_entfernen(a, true);
        assert!(alle_nachrichten(&mut rb)
            .iter()
            .all(|n| !matches!(n, ControlMessage::UserRemove(_))));
    }

    #[test]
    fn session_ids_werden_wiederverwendet() {
        let (mut server, _verzeichnis) = test_server();
        let (a, _ra) = bereiter_client(&mut server, "alice");
        server.client_entfernen(a, false);

        let (neu, _rn) = bereiter_client(&mut server, "bob");
        assert_eq!(neu, a, "der Pool recycelt Session-IDs");
    }

    // -----------------------------------------------------------------------
    // Authentifizierungs-Abschluss (Szenario: einzelner Login)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn login_sequenz_eines_einzelnen_clients() {
        let (mut server, _verzeichnis) = test_server();
        let (s, mut rs) = roher_client(&mut server, "");

        server.nachricht_verarbeiten(
            s,
            ControlMessage::Authenticate(proto::Authenticate {
                username: Some("alice".into()),
                tokens: vec![],
                ..Default::default()
            }),
        );

        // Die Auth-Task sendet CryptSetup und signalisiert den Abschluss
        let abschluss = server
            .auth_rx
            .as_mut()
            .unwrap()
            .recv()
            .await
            .expect("Auth-Abschluss erwartet");
        assert_eq!(abschluss.session, s);
        assert_eq!(abschluss.ergebnis, Ok(None), "alice ist unregistriert");
        server.authentifizierung_abschliessen(abschluss);

        assert_eq!(server.clients[&s].zustand, ClientZustand::Bereit);

        // Erwartete Sequenz: CryptSetup, ChannelState (Root), UserState
        // (alice im Root), ServerSync, ServerConfig
        let nachrichten = alle_nachrichten(&mut rs);
        let kinds: Vec<&'static str> = nachrichten.iter().map(|n| n.kind_name()).collect();
        let crypt_pos = kinds.iter().position(|k| *k == "CryptSetup").expect("CryptSetup");
        let kanal_pos = kinds.iter().position(|k| *k == "ChannelState").expect("ChannelState");
        let benutzer_pos = kinds.iter().position(|k| *k == "UserState").expect("UserState");
        let sync_pos = kinds.iter().position(|k| *k == "ServerSync").expect("ServerSync");
        let config_pos = kinds.iter().position(|k| *k == "ServerConfig").expect("ServerConfig");
        assert!(crypt_pos < kanal_pos);
        assert!(kanal_pos < benutzer_pos);
        assert!(benutzer_pos < sync_pos);
        assert!(sync_pos < config_pos);

        // CryptSetup traegt Schluessel und beide Nonces
        let ControlMessage::CryptSetup(setup) = &nachrichten[crypt_pos] else {
            unreachable!();
        };
        assert_eq!(setup.key.as_ref().unwrap().len(), 16);
        assert_eq!(setup.client_nonce.as_ref().unwrap().len(), 16);
        assert_eq!(setup.server_nonce.as_ref().unwrap().len(), 16);

        // ServerSync nennt Session und Bandbreite
        let ControlMessage::ServerSync(sync) = &nachrichten[sync_pos] else {
            unreachable!();
        };
        assert_eq!(sync.session, Some(s.wert()));
        assert_eq!(sync.max_bandwidth, Some(72000));
        assert!(sync.permissions.is_some());
    }

    #[tokio::test]
    async fn leerer_benutzername_wird_abgelehnt() {
        let (mut server, _verzeichnis) = test_server();
        let (s, mut rs) = roher_client(&mut server, "");

        server.nachricht_verarbeiten(
            s,
            ControlMessage::Authenticate(proto::Authenticate::default()),
        );

        assert!(!server.clients.contains_key(&s));
        assert!(alle_nachrichten(&mut rs).iter().any(|n| matches!(
            n,
            ControlMessage::Reject(proto::Reject {
                reject_type: Some(proto::RejectGrund::InvalidUsername),
                ..
            })
        )));
    }

    #[test]
    fn unerwartete_nachricht_vor_auth_beendet_die_session() {
        let (mut server, _verzeichnis) = test_server();
        let (s, _rs) = roher_client(&mut server, "alice");

        server.nachricht_verarbeiten(
            s,
            ControlMessage::TextMessage(proto::TextMessage {
                message: "zu frueh".into(),
                ..Default::default()
            }),
        );
        assert!(!server.clients.contains_key(&s), "Protokollverletzung beendet die Session");
    }

    // -----------------------------------------------------------------------
    // Ping
    // -----------------------------------------------------------------------

    #[test]
    fn ping_wird_mit_krypto_statistik_beantwortet() {
        let (mut server, _verzeichnis) = test_server();
        let (s, mut rs) = bereiter_client(&mut server, "alice");
        server.clients[&s].crypt.lock().good = 17;

        server.nachricht_verarbeiten(
            s,
            ControlMessage::Ping(proto::Ping {
                timestamp: Some(123456),
                good: Some(9),
                ..Default::default()
            }),
        );

        let nachrichten = alle_nachrichten(&mut rs);
        let ControlMessage::Ping(antwort) = &nachrichten[0] else {
            panic!("Ping-Antwort erwartet");
        };
        assert_eq!(antwort.timestamp, Some(123456));
        assert_eq!(antwort.good, Some(17));
        // Die vom Client gemeldete Statistik ist festgehalten
        assert_eq!(
            server.clients[&s].ping_statistik,
            PaketStatistik {
                good: 9,
                ..Default::default()
            }
        );
    }
}
