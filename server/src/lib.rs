//! raunen-server – Mumble-kompatibler Sprachchat-Server
//!
//! Deklariert alle Server-Module und stellt den Einstiegspunkt bereit.
//! Der Kern ist die Steuerschleife in `server`, die saemtlichen
//! veraenderlichen Zustand exklusiv besitzt; `lib.rs` verdrahtet beim
//! Start Persistenz, TLS, Sockets und die begleitenden Tasks.

pub mod channel;
pub mod client;
pub mod config;
pub mod handlers;
pub mod register;
pub mod server;
pub mod sessionpool;
pub mod textfilter;
pub mod tls;
pub mod udp;
pub mod user;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use raunen_auth::{ist_gebannt, Ban};
use raunen_core::RaunenError;
use raunen_freezer::Protokoll;

use config::ServerConfig;
use server::{NeueVerbindung, Server, ServerEreignis};

impl Server {
    /// Erstellt einen Server aus der Bootstrap-Konfiguration
    pub fn aus_config(config: &ServerConfig) -> Self {
        Self::neu(config.server.id, config.daten.verzeichnis.clone())
    }

    /// Startet alle Server-Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Zustand aus Abbild plus Operationslog wiederherstellen,
    ///    Boot-Abbild schreiben, frisches Log oeffnen
    /// 2. TLS vorbereiten (konfiguriertes oder selbstsigniertes Paar)
    /// 3. TCP-Listener und UDP-Socket binden
    /// 4. Datagram-Sende/Empfangs-Tasks und Acceptor starten
    /// 5. Steuerschleife ausfuehren bis Ctrl-C
    pub async fn starten(mut self, config: &ServerConfig) -> Result<()> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // --- 1. Persistenz ---
        let daten_verzeichnis = self.daten_verzeichnis.clone();
        let abbild = raunen_freezer::wiederherstellen(&daten_verzeichnis)
            .map_err(|e| RaunenError::Persistenz(e.to_string()))
            .context("Zustand nicht wiederherstellbar")?;
        self.abbild_uebernehmen(abbild);
        // Boot-Abbild sichern bevor das alte Log verworfen wird
        raunen_freezer::abbild_schreiben(&daten_verzeichnis, &self.abbild_erzeugen())
            .map_err(|e| RaunenError::Persistenz(e.to_string()))
            .context("Boot-Abbild nicht schreibbar")?;
        self.protokoll = Some(
            Protokoll::oeffnen(&daten_verzeichnis).context("Operationslog nicht oeffenbar")?,
        );

        // --- 2. TLS ---
        let tls = tls::acceptor_bauen(
            &daten_verzeichnis,
            config.daten.tls_zertifikat.as_deref(),
            config.daten.tls_schluessel.as_deref(),
        )?;

        // --- 3. Sockets ---
        // Die dynamische Konfiguration darf die Bootstrap-Adresse
        // ueberschreiben
        let mut bind_adresse = config.netzwerk.bind_adresse.clone();
        let dynamische = self.konfiguration.zeichenkette("Address");
        if !dynamische.is_empty() {
            bind_adresse = dynamische;
        }
        let mut port = config.netzwerk.port;
        let dynamischer_port = self.konfiguration.ganzzahl("Port");
        if dynamischer_port != 0 {
            port = dynamischer_port as u16;
        }

        let adresse: SocketAddr = format!("{bind_adresse}:{port}")
            .parse()
            .with_context(|| format!("Ungueltige Bind-Adresse {bind_adresse}:{port}"))?;

        let tcp = TcpListener::bind(adresse)
            .await
            .with_context(|| format!("TCP-Bind auf {adresse} fehlgeschlagen"))?;
        let udp = Arc::new(
            UdpSocket::bind(adresse)
                .await
                .with_context(|| format!("UDP-Bind auf {adresse} fehlgeschlagen"))?,
        );

        tracing::info!(server_id = self.id, adresse = %adresse, "Server gestartet");

        // --- 4. Begleitende Tasks ---
        let udpsend_rx = self
            .udpsend_rx
            .take()
            .context("Datagram-Sende-Queue bereits vergeben")?;
        tokio::spawn(udp::sende_schleife(Arc::clone(&udp), udpsend_rx));
        tokio::spawn(udp::empfangs_schleife(
            udp,
            Arc::clone(&self.host_index),
            self.udpsend_tx.clone(),
            Arc::clone(&self.probe_info),
        ));

        tokio::spawn(akzeptieren(
            tcp,
            tls,
            Arc::clone(&self.bans),
            self.ereignis_sender(),
        ));

        // Erste Registrierung bei der oeffentlichen Liste, versetzt
        let server_id = self.id;
        let register_name = self.konfiguration.zeichenkette("RegisterName");
        tokio::spawn(async move {
            tokio::time::sleep(register::erste_registrierung_nach(server_id)).await;
            let mut konfiguration = config::Konfiguration::neu();
            konfiguration.setzen("RegisterName", register_name);
            register::oeffentlich_registrieren(&konfiguration, server_id);
        });

        // --- 5. Steuerschleife ---
        tokio::select! {
            _ = self.lauf() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
            }
        }

        Ok(())
    }
}

/// Die Accept-Schleife
///
/// Nimmt Verbindungen an, prueft die Ban-Liste vor dem Handshake und
/// reicht fertig verhandelte Streams mitsamt Zertifikats-Digest an die
/// Steuerschleife weiter. Der Acceptor mutiert nie Serverzustand.
async fn akzeptieren(
    listener: TcpListener,
    tls: TlsAcceptor,
    bans: Arc<RwLock<Vec<Ban>>>,
    ereignis_tx: mpsc::Sender<ServerEreignis>,
) {
    loop {
        let (strom, adresse) = match listener.accept().await {
            Ok(angenommen) => angenommen,
            Err(e) => {
                tracing::warn!(fehler = %e, "Accept fehlgeschlagen");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }
        };

        // Ban-Pruefung vor dem teuren Handshake
        let gebannt = {
            let liste = bans.read();
            ist_gebannt(&liste, &adresse.ip(), Utc::now().timestamp())
        };
        if gebannt {
            tracing::info!(peer = %adresse, "Verbindung abgewiesen: gebannt");
            drop(strom);
            continue;
        }

        let tls = tls.clone();
        let ereignis_tx = ereignis_tx.clone();
        tokio::spawn(async move {
            match tls.accept(strom).await {
                Ok(tls_strom) => {
                    let zert_digest = tls_strom
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|kette| kette.first())
                        .map(|zertifikat| tls::zertifikat_digest(zertifikat.as_ref()));

                    let ereignis = ServerEreignis::Verbunden(NeueVerbindung {
                        strom: tls_strom,
                        adresse,
                        zert_digest,
                    });
                    if ereignis_tx.send(ereignis).await.is_err() {
                        tracing::warn!("Steuerschleife nicht erreichbar, Verbindung verworfen");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %adresse, fehler = %e, "TLS-Handshake fehlgeschlagen");
                }
            }
        });
    }
}
