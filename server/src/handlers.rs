//! Nachrichten-Dispatch und Handler
//!
//! Die Dispatch-Tabelle der Steuerschleife: eine Handler-Funktion pro
//! Nachrichten-Kind. Unbekannte Kinds verwirft bereits die Leser-Fiber;
//! reine Server->Client-Kinds von Clients werden hier ignoriert. Vor der
//! Authentifizierung sind nur Version, Authenticate und Ping zulaessig,
//! alles andere ist eine Protokollverletzung und beendet die Session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;

use raunen_acl::{AclEintrag, Berechtigung, Gruppe};
use raunen_auth::Ban;
use raunen_core::{ChannelId, ClientZustand, SessionId, UserId};
use raunen_freezer::Operation;
use raunen_protocol::control as proto;
use raunen_protocol::control::{ControlMessage, PaketStatistik};

use crate::server::{AuthAbschluss, Server};
use crate::textfilter::{self, FilterRegeln};

impl Server {
    /// Die Dispatch-Tabelle
    pub(crate) fn nachricht_verarbeiten(&mut self, session: SessionId, nachricht: ControlMessage) {
        let Some(zustand) = self.clients.get(&session).map(|c| c.zustand) else {
            return;
        };

        if zustand < ClientZustand::Authentifiziert
            && !matches!(
                nachricht,
                ControlMessage::Version(_)
                    | ControlMessage::Authenticate(_)
                    | ControlMessage::Ping(_)
            )
        {
            self.session_panik(session, "Unerwartete Nachricht vor der Authentifizierung");
            return;
        }

        match nachricht {
            ControlMessage::Version(m) => self.handle_version(session, m),
            ControlMessage::Authenticate(m) => self.handle_authenticate(session, m),
            ControlMessage::Ping(m) => self.handle_ping(session, m),
            ControlMessage::ChannelState(m) => self.handle_channel_state(session, m),
            ControlMessage::ChannelRemove(m) => self.handle_channel_remove(session, m),
            ControlMessage::UserState(m) => self.handle_user_state(session, m),
            ControlMessage::UserRemove(m) => self.handle_user_remove(session, m),
            ControlMessage::BanList(m) => self.handle_ban_list(session, m),
            ControlMessage::TextMessage(m) => self.handle_text_message(session, m),
            ControlMessage::Acl(m) => self.handle_acl(session, m),
            ControlMessage::QueryUsers(m) => self.handle_query_users(session, m),
            ControlMessage::CryptSetup(m) => self.handle_crypt_setup(session, m),
            ControlMessage::UserList(m) => self.handle_user_list(session, m),
            ControlMessage::VoiceTarget(m) => self.handle_voice_target(session, m),
            ControlMessage::PermissionQuery(m) => self.handle_permission_query(session, m),
            ControlMessage::UserStats(m) => self.handle_user_stats(session, m),
            ControlMessage::RequestBlob(m) => self.handle_request_blob(session, m),
            andere => {
                tracing::debug!(
                    session = %session,
                    kind = andere.kind_name(),
                    "Client-seitig unzulaessige Nachricht ignoriert"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Verweigerungs-Hilfen
    // -----------------------------------------------------------------------

    pub(crate) fn verweigern(&self, session: SessionId, kanal: ChannelId, bit: u32) {
        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::PermissionDenied(proto::PermissionDenied {
                permission: Some(bit),
                channel_id: Some(kanal.wert()),
                session: None,
                reason: None,
                deny_type: Some(proto::VerweigerungsArt::Permission),
                name: None,
            }));
        }
    }

    pub(crate) fn verweigern_art(
        &self,
        session: SessionId,
        art: proto::VerweigerungsArt,
        grund: &str,
    ) {
        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::PermissionDenied(proto::PermissionDenied {
                permission: None,
                channel_id: None,
                session: None,
                reason: Some(grund.to_string()),
                deny_type: Some(art),
                name: None,
            }));
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn handle_version(&mut self, session: SessionId, version: proto::Version) {
        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };
        client.version = version.version.unwrap_or(0);
        if client.zustand == ClientZustand::VersionGesendet {
            client.zustand = ClientZustand::VersionEmpfangen;
        }
        let version_hex = format!("{:#x}", client.version);
        tracing::debug!(
            session = %session,
            version = %version_hex,
            release = version.release.as_deref().unwrap_or(""),
            "Client-Version empfangen"
        );
    }

    /// Startet die Authentifizierung
    ///
    /// Die schnellen Pruefungen und die Aufloesung der registrierten
    /// Identitaet laufen auf der Schleife; Passwortpruefung und
    /// Schluessel-Erzeugung laufen in einer eigenen Task, die ihren
    /// Abschluss ueber die Auth-Queue signalisiert. Ein erneutes
    /// Authenticate nach dem Login aktualisiert nur die Tokens.
    fn handle_authenticate(&mut self, session: SessionId, auth: proto::Authenticate) {
        {
            let Some(client) = self.clients.get_mut(&session) else {
                return;
            };
            client.tokens = auth.tokens.clone();
        }
        // Tokens erweitern Gruppenzugehoerigkeiten
        self.cache.leeren();

        let Some(zustand) = self.clients.get(&session).map(|c| c.zustand) else {
            return;
        };
        if zustand >= ClientZustand::Authentifiziert {
            return;
        }

        let Some(benutzername) = auth.username.clone().filter(|n| !n.is_empty()) else {
            self.ablehnen(
                session,
                proto::RejectGrund::InvalidUsername,
                "Bitte einen Benutzernamen angeben",
            );
            return;
        };

        let (zert_digest, sender, crypt) = {
            let Some(client) = self.clients.get_mut(&session) else {
                return;
            };
            client.benutzername = benutzername.clone();
            client.codecs = auth.celt_versions.clone();
            if client.codecs.is_empty() {
                tracing::debug!(session = %session, "Client ohne CELT-Codecs verbunden");
            }
            (
                client.zert_digest.clone(),
                client.sender_klon(),
                Arc::clone(&client.crypt),
            )
        };

        // Registrierte Identitaet aufloesen: Namenstreffer verlangt den
        // passenden Zertifikats-Digest, sonst zaehlt der Digest allein
        let ist_superuser = benutzername == "SuperUser";
        let kandidat: Option<UserId> = if ist_superuser {
            Some(UserId::SUPERUSER)
        } else if let Some(&uid) = self.nach_name.get(&benutzername) {
            let digest_passt = zert_digest.as_deref().is_some_and(|digest| {
                self.benutzer
                    .get(&uid)
                    .is_some_and(|b| b.zert_digest == digest)
            });
            if !digest_passt {
                self.ablehnen(
                    session,
                    proto::RejectGrund::WrongUserPw,
                    "Falscher Zertifikats-Digest",
                );
                return;
            }
            Some(uid)
        } else {
            zert_digest
                .as_deref()
                .and_then(|digest| self.nach_zertifikat.get(digest).copied())
        };

        // Der Rest toleriert langsame Backends und laeuft deshalb
        // ausserhalb der Steuerschleife
        let superuser_eintrag = self.konfiguration.zeichenkette("SuperUserPassword");
        let passwort = auth.password.clone();
        let auth_tx = self.auth_tx.clone();

        tokio::spawn(async move {
            if ist_superuser {
                let akzeptiert = passwort
                    .as_deref()
                    .map(|p| raunen_auth::passwort_pruefen(p, &superuser_eintrag).unwrap_or(false))
                    .unwrap_or(false);
                if !akzeptiert {
                    let _ = sender.send(ControlMessage::Reject(proto::Reject {
                        reject_type: Some(proto::RejectGrund::WrongUserPw),
                        reason: Some("Falsches SuperUser-Passwort".to_string()),
                    }));
                    let _ = auth_tx
                        .send(AuthAbschluss {
                            session,
                            ergebnis: Err(()),
                        })
                        .await;
                    return;
                }
            }

            // Frischen Voice-Schluessel erzeugen und genau einmal
            // uebermitteln
            let (schluessel, client_nonce, server_nonce) = {
                let mut crypt = crypt.lock();
                crypt.generate_key();
                (
                    crypt.raw_key.to_vec(),
                    crypt.decrypt_iv.to_vec(),
                    crypt.encrypt_iv.to_vec(),
                )
            };
            let _ = sender.send(ControlMessage::CryptSetup(proto::CryptSetup {
                key: Some(schluessel),
                client_nonce: Some(client_nonce),
                server_nonce: Some(server_nonce),
            }));

            let _ = auth_tx
                .send(AuthAbschluss {
                    session,
                    ergebnis: Ok(kandidat),
                })
                .await;
        });
    }

    fn handle_ping(&mut self, session: SessionId, ping: proto::Ping) {
        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };
        client.ping_statistik = PaketStatistik {
            good: ping.good.unwrap_or(0),
            late: ping.late.unwrap_or(0),
            lost: ping.lost.unwrap_or(0),
            resync: ping.resync.unwrap_or(0),
        };

        let antwort = {
            let krypto = client.crypt.lock();
            proto::Ping {
                timestamp: ping.timestamp,
                good: Some(krypto.good),
                late: Some(krypto.late),
                lost: Some(krypto.lost),
                resync: Some(krypto.resync),
            }
        };
        client.senden(ControlMessage::Ping(antwort));
    }

    // -----------------------------------------------------------------------
    // Kanaele
    // -----------------------------------------------------------------------

    fn handle_channel_state(&mut self, session: SessionId, zustand: proto::ChannelState) {
        match zustand.channel_id {
            None => self.kanal_anlegen_anfrage(session, zustand),
            Some(id) => self.kanal_bearbeiten_anfrage(session, ChannelId(id), zustand),
        }
    }

    fn kanal_anlegen_anfrage(&mut self, session: SessionId, anfrage: proto::ChannelState) {
        let Some(eltern_roh) = anfrage.parent else {
            self.session_panik(session, "Kanal-Anlage ohne Elternkanal");
            return;
        };
        let eltern = ChannelId(eltern_roh);
        if !self.kanaele.contains_key(&eltern) {
            return;
        }

        let Some(name) = anfrage.name.clone().filter(|n| !n.is_empty()) else {
            self.verweigern_art(session, proto::VerweigerungsArt::ChannelName, "Kanalname fehlt");
            return;
        };
        let doppelt = self
            .kanaele
            .get(&eltern)
            .map(|k| {
                k.kinder.iter().any(|kind| {
                    self.kanaele.get(kind).is_some_and(|k2| k2.name == name)
                })
            })
            .unwrap_or(false);
        if doppelt {
            self.verweigern_art(
                session,
                proto::VerweigerungsArt::ChannelName,
                "Name unter Geschwistern bereits vergeben",
            );
            return;
        }

        let temporaer = anfrage.temporary.unwrap_or(false);
        let bit = if temporaer {
            Berechtigung::MAKE_TEMP_CHANNEL
        } else {
            Berechtigung::MAKE_CHANNEL
        };
        if !self.hat_berechtigung(session, eltern, bit) {
            self.verweigern(session, eltern, bit);
            return;
        }

        // Beschreibung landet im Blob-Speicher
        let beschreibung = anfrage.description.clone().filter(|d| !d.is_empty());
        let beschreibungs_blob = beschreibung.as_ref().and_then(|text| {
            match self.blobs.ablegen(text.as_bytes()) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    tracing::error!(fehler = %e, "Kanalbeschreibung nicht ablegbar");
                    None
                }
            }
        });

        let Some(id) = self.kanal_anlegen_mit(
            eltern,
            name.clone(),
            temporaer,
            anfrage.position.unwrap_or(0),
            beschreibungs_blob.clone(),
        ) else {
            return;
        };

        let meldung = proto::ChannelState {
            channel_id: Some(id.wert()),
            parent: Some(eltern.wert()),
            name: Some(name),
            position: anfrage.position,
            temporary: temporaer.then_some(true),
            description: beschreibung,
            description_hash: beschreibungs_blob,
            ..Default::default()
        };
        if !self.broadcast(ControlMessage::ChannelState(meldung)) {
            tracing::warn!(kanal = %id, "ChannelState-Broadcast abgebrochen");
        }

        // Der Ersteller betritt einen temporaeren Kanal sofort; sonst
        // wuerde der leere Kanal augenblicklich wieder verschwinden
        if temporaer {
            let mut bewegung = proto::UserState {
                session: Some(session.wert()),
                channel_id: Some(id.wert()),
                ..Default::default()
            };
            self.kanal_betreten(session, id, &mut bewegung);
            if !self.broadcast(ControlMessage::UserState(bewegung)) {
                tracing::warn!(session = %session, "UserState-Broadcast abgebrochen");
            }
        }
        tracing::info!(session = %session, kanal = %id, temporaer, "Kanal angelegt");
    }

    fn kanal_bearbeiten_anfrage(
        &mut self,
        session: SessionId,
        id: ChannelId,
        anfrage: proto::ChannelState,
    ) {
        if !self.kanaele.contains_key(&id) {
            return;
        }

        let mut meldung = proto::ChannelState {
            channel_id: Some(id.wert()),
            ..Default::default()
        };
        let mut geaendert = false;

        // Eigenschaften (Name, Beschreibung, Position) verlangen das
        // Schreibrecht auf dem Kanal
        let will_eigenschaften =
            anfrage.name.is_some() || anfrage.description.is_some() || anfrage.position.is_some();
        if will_eigenschaften && !self.hat_berechtigung(session, id, Berechtigung::WRITE) {
            self.verweigern(session, id, Berechtigung::WRITE);
            return;
        }

        // Eltern-Wechsel
        if let Some(neue_eltern_roh) = anfrage.parent {
            let neue_eltern = ChannelId(neue_eltern_roh);
            let aktuelle_eltern = self.kanaele.get(&id).and_then(|k| k.eltern);
            if Some(neue_eltern) != aktuelle_eltern {
                if id.ist_root() || !self.kanaele.contains_key(&neue_eltern) {
                    return;
                }
                // Ein Kanal darf nie in seinen eigenen Teilbaum wandern
                if self.unterbaum(id).contains(&neue_eltern) {
                    self.session_panik(session, "Kanal-Verschiebung in den eigenen Teilbaum");
                    return;
                }
                if !self.hat_berechtigung(session, id, Berechtigung::WRITE)
                    || !self.hat_berechtigung(session, neue_eltern, Berechtigung::MAKE_CHANNEL)
                {
                    self.verweigern(session, neue_eltern, Berechtigung::MAKE_CHANNEL);
                    return;
                }

                if let Some(alte) = aktuelle_eltern {
                    if let Some(kanal) = self.kanaele.get_mut(&alte) {
                        kanal.kinder.remove(&id);
                    }
                }
                if let Some(kanal) = self.kanaele.get_mut(&neue_eltern) {
                    kanal.kinder.insert(id);
                }
                if let Some(kanal) = self.kanaele.get_mut(&id) {
                    kanal.eltern = Some(neue_eltern);
                }
                self.cache.leeren();
                meldung.parent = Some(neue_eltern.wert());
                geaendert = true;
            }
        }

        // Verlinkungen: beide Seiten brauchen das Link-Recht
        for roh in &anfrage.links_add {
            let andere = ChannelId(*roh);
            if !self.kanaele.contains_key(&andere) {
                continue;
            }
            if !self.hat_berechtigung(session, id, Berechtigung::LINK_CHANNEL)
                || !self.hat_berechtigung(session, andere, Berechtigung::LINK_CHANNEL)
            {
                self.verweigern(session, andere, Berechtigung::LINK_CHANNEL);
                return;
            }
            self.kanaele_verlinken(id, andere);
            geaendert = true;
        }
        for roh in &anfrage.links_remove {
            if !self.hat_berechtigung(session, id, Berechtigung::LINK_CHANNEL) {
                self.verweigern(session, id, Berechtigung::LINK_CHANNEL);
                return;
            }
            self.kanaele_entlinken(id, ChannelId(*roh));
            geaendert = true;
        }
        if !anfrage.links_add.is_empty() || !anfrage.links_remove.is_empty() {
            meldung.links = self
                .kanaele
                .get(&id)
                .map(|k| k.verknuepfungen.iter().map(|v| v.wert()).collect())
                .unwrap_or_default();
        }

        // Name
        if let Some(name) = anfrage.name.clone().filter(|n| !n.is_empty()) {
            if let Some(kanal) = self.kanaele.get_mut(&id) {
                if kanal.name != name {
                    kanal.name = name.clone();
                    meldung.name = Some(name);
                    geaendert = true;
                }
            }
        }

        // Beschreibung
        if let Some(beschreibung) = anfrage.description.clone() {
            let blob = if beschreibung.is_empty() {
                None
            } else {
                match self.blobs.ablegen(beschreibung.as_bytes()) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        tracing::error!(fehler = %e, "Kanalbeschreibung nicht ablegbar");
                        None
                    }
                }
            };
            if let Some(kanal) = self.kanaele.get_mut(&id) {
                kanal.beschreibung_blob = blob.clone();
            }
            meldung.description = Some(beschreibung);
            meldung.description_hash = blob;
            geaendert = true;
        }

        // Position
        if let Some(position) = anfrage.position {
            if let Some(kanal) = self.kanaele.get_mut(&id) {
                if kanal.position != position {
                    kanal.position = position;
                    meldung.position = Some(position);
                    geaendert = true;
                }
            }
        }

        if !geaendert {
            return;
        }

        self.kanal_persistieren(id);
        if !self.broadcast(ControlMessage::ChannelState(meldung)) {
            tracing::warn!(kanal = %id, "ChannelState-Broadcast abgebrochen");
        }
    }

    fn handle_channel_remove(&mut self, session: SessionId, nachricht: proto::ChannelRemove) {
        let id = ChannelId(nachricht.channel_id);
        if !self.kanaele.contains_key(&id) {
            return;
        }
        if id.ist_root() || !self.hat_berechtigung(session, id, Berechtigung::WRITE) {
            self.verweigern(session, id, Berechtigung::WRITE);
            return;
        }
        self.kanal_entfernen_kaskade(id);
    }

    // -----------------------------------------------------------------------
    // Sessions und Benutzer
    // -----------------------------------------------------------------------

    fn handle_user_state(&mut self, session: SessionId, zustand: proto::UserState) {
        let ziel = zustand.session.map(SessionId).unwrap_or(session);
        if !self.clients.contains_key(&ziel) {
            return;
        }

        let mut antwort = proto::UserState {
            session: Some(ziel.wert()),
            actor: Some(session.wert()),
            ..Default::default()
        };
        let mut geaendert = false;

        // Der Anzeigename ist an die Authentifizierung gebunden
        if let Some(name) = &zustand.name {
            let aktueller = self
                .clients
                .get(&ziel)
                .map(|c| c.angezeigter_name().to_string())
                .unwrap_or_default();
            if *name != aktueller {
                self.verweigern_art(
                    session,
                    proto::VerweigerungsArt::UserName,
                    "Umbenennen ist nicht moeglich",
                );
                return;
            }
        }

        // Registrierungs-Anfrage (user_id gesetzt)
        if zustand.user_id.is_some() {
            let bereits = self
                .clients
                .get(&ziel)
                .is_some_and(|c| c.ist_registriert());
            if !bereits {
                let bit = if ziel == session {
                    Berechtigung::SELF_REGISTER
                } else {
                    Berechtigung::REGISTER
                };
                if !self.hat_berechtigung(session, ChannelId::ROOT, bit) {
                    self.verweigern(session, ChannelId::ROOT, bit);
                    return;
                }
                match self.registrieren(ziel) {
                    Ok(uid) => {
                        antwort.user_id = Some(uid.wert());
                        geaendert = true;
                    }
                    Err(grund) => {
                        self.verweigern_art(
                            session,
                            proto::VerweigerungsArt::MissingCertificate,
                            grund,
                        );
                        return;
                    }
                }
            }
        }

        // Stummschalten/Taubstellen durch einen Akteur
        if zustand.mute.is_some()
            || zustand.deaf.is_some()
            || zustand.suppress.is_some()
            || zustand.priority_speaker.is_some()
        {
            let ziel_kanal = self
                .clients
                .get(&ziel)
                .map(|c| c.kanal)
                .unwrap_or(ChannelId::ROOT);
            if !self.hat_berechtigung(session, ziel_kanal, Berechtigung::MUTE_DEAFEN) {
                self.verweigern(session, ziel_kanal, Berechtigung::MUTE_DEAFEN);
                return;
            }
            if let Some(client) = self.clients.get_mut(&ziel) {
                if let Some(stumm) = zustand.mute {
                    client.stumm = stumm;
                    if !stumm && client.taub {
                        client.taub = false;
                        antwort.deaf = Some(false);
                    }
                    antwort.mute = Some(stumm);
                    geaendert = true;
                }
                if let Some(taub) = zustand.deaf {
                    client.taub = taub;
                    antwort.deaf = Some(taub);
                    // Taub impliziert stumm
                    if taub && !client.stumm {
                        client.stumm = true;
                        antwort.mute = Some(true);
                    }
                    geaendert = true;
                }
                if let Some(unterdrueckt) = zustand.suppress {
                    client.unterdrueckt = unterdrueckt;
                    antwort.suppress = Some(unterdrueckt);
                    geaendert = true;
                }
                if let Some(prioritaet) = zustand.priority_speaker {
                    client.prioritaets_sprecher = prioritaet;
                    antwort.priority_speaker = Some(prioritaet);
                    geaendert = true;
                }
            }
        }

        // Selbst-Flags, Aufnahme und Plugin-Daten nur fuer die eigene Session
        let eigene_felder = zustand.self_mute.is_some()
            || zustand.self_deaf.is_some()
            || zustand.recording.is_some()
            || zustand.plugin_context.is_some()
            || zustand.plugin_identity.is_some()
            || zustand.comment.is_some()
            || zustand.texture.is_some();
        if eigene_felder && ziel != session {
            self.verweigern_art(
                session,
                proto::VerweigerungsArt::Permission,
                "Nur die eigene Session",
            );
            return;
        }

        if let Some(client) = self.clients.get_mut(&ziel) {
            if let Some(selbst_stumm) = zustand.self_mute {
                client.selbst_stumm = selbst_stumm;
                antwort.self_mute = Some(selbst_stumm);
                if !selbst_stumm && client.selbst_taub {
                    client.selbst_taub = false;
                    antwort.self_deaf = Some(false);
                }
                geaendert = true;
            }
            if let Some(selbst_taub) = zustand.self_deaf {
                client.selbst_taub = selbst_taub;
                antwort.self_deaf = Some(selbst_taub);
                if selbst_taub && !client.selbst_stumm {
                    client.selbst_stumm = true;
                    antwort.self_mute = Some(true);
                }
                geaendert = true;
            }
            if let Some(nimmt_auf) = zustand.recording {
                client.nimmt_auf = nimmt_auf;
                antwort.recording = Some(nimmt_auf);
                geaendert = true;
            }
            if let Some(kontext) = zustand.plugin_context.clone() {
                client.plugin_kontext = kontext.clone();
                antwort.plugin_context = Some(kontext);
                geaendert = true;
            }
            if let Some(identitaet) = zustand.plugin_identity.clone() {
                client.plugin_identitaet = identitaet.clone();
                antwort.plugin_identity = Some(identitaet);
                geaendert = true;
            }
        }

        // Kommentar und Textur werden fuer registrierte Identitaeten
        // inhalts-adressiert abgelegt
        if let Some(kommentar) = zustand.comment.clone() {
            if let Some(digest) = self.benutzer_blob_setzen(ziel, kommentar.as_bytes(), false) {
                antwort.comment = Some(kommentar);
                antwort.comment_hash = digest;
                geaendert = true;
            }
        }
        if let Some(textur) = zustand.texture.clone() {
            if let Some(digest) = self.benutzer_blob_setzen(ziel, &textur, true) {
                antwort.texture = Some(textur);
                antwort.texture_hash = digest;
                geaendert = true;
            }
        }

        // Kanalwechsel
        if let Some(roh) = zustand.channel_id {
            let ziel_kanal = ChannelId(roh);
            if !self.kanaele.contains_key(&ziel_kanal) {
                return;
            }
            let aktueller = self
                .clients
                .get(&ziel)
                .map(|c| c.kanal)
                .unwrap_or(ChannelId::ROOT);
            if ziel_kanal != aktueller {
                let bit = if ziel == session {
                    Berechtigung::ENTER
                } else {
                    Berechtigung::MOVE
                };
                if !self.hat_berechtigung(session, ziel_kanal, bit) {
                    self.verweigern(session, ziel_kanal, bit);
                    return;
                }
                antwort.channel_id = Some(ziel_kanal.wert());
                self.kanal_betreten(ziel, ziel_kanal, &mut antwort);
                geaendert = true;
            }
        }

        if !geaendert {
            return;
        }
        if !self.broadcast(ControlMessage::UserState(antwort)) {
            tracing::warn!(session = %ziel, "UserState-Broadcast abgebrochen");
        }
    }

    /// Legt einen Kommentar- oder Textur-Blob fuer die registrierte
    /// Identitaet der Session ab; `None` wenn die Session unregistriert
    /// ist oder der Speicher versagt
    fn benutzer_blob_setzen(
        &mut self,
        session: SessionId,
        inhalt: &[u8],
        ist_textur: bool,
    ) -> Option<Option<String>> {
        let uid = self.clients.get(&session).and_then(|c| c.benutzer)?;
        let digest = if inhalt.is_empty() {
            None
        } else {
            match self.blobs.ablegen(inhalt) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    tracing::error!(fehler = %e, "Blob nicht ablegbar");
                    return None;
                }
            }
        };

        let gefroren = {
            let benutzer = self.benutzer.get_mut(&uid)?;
            if ist_textur {
                benutzer.textur_blob = digest.clone();
            } else {
                benutzer.kommentar_blob = digest.clone();
            }
            benutzer.einfrieren()
        };
        self.operation_protokollieren(Operation::BenutzerAktualisieren { benutzer: gefroren });
        Some(digest)
    }

    fn handle_user_remove(&mut self, session: SessionId, nachricht: proto::UserRemove) {
        let ziel = SessionId(nachricht.session);
        if !self.clients.contains_key(&ziel) {
            return;
        }

        let bannen = nachricht.ban.unwrap_or(false);
        let bit = if bannen {
            Berechtigung::BAN
        } else {
            Berechtigung::KICK
        };
        if !self.hat_berechtigung(session, ChannelId::ROOT, bit) {
            self.verweigern(session, ChannelId::ROOT, bit);
            return;
        }
        // Der SuperUser ist nicht entfernbar
        if self.clients.get(&ziel).is_some_and(|c| c.ist_superuser()) {
            self.verweigern_art(
                session,
                proto::VerweigerungsArt::SuperUser,
                "Der SuperUser ist nicht entfernbar",
            );
            return;
        }

        if bannen {
            let (adresse, name, digest) = {
                let Some(client) = self.clients.get(&ziel) else {
                    return;
                };
                (
                    client.tcp_adresse.ip(),
                    client.angezeigter_name().to_string(),
                    client.zert_digest.clone().unwrap_or_default(),
                )
            };
            let mut ban = Ban::fuer_adresse(
                adresse,
                nachricht.reason.clone().unwrap_or_default(),
            );
            ban.name = name;
            ban.zert_digest = digest;
            let liste = {
                let mut bans = self.bans.write();
                bans.push(ban);
                bans.clone()
            };
            self.operation_protokollieren(Operation::BanListeSetzen { bans: liste });
        }

        // Kick-Pfade broadcasten ihr UserRemove vor dem Abbau
        let meldung = ControlMessage::UserRemove(proto::UserRemove {
            session: ziel.wert(),
            actor: Some(session.wert()),
            reason: nachricht.reason.clone(),
            ban: bannen.then_some(true),
        });
        if !self.broadcast(meldung) {
            tracing::warn!(session = %ziel, "UserRemove-Broadcast abgebrochen");
        }

        tracing::info!(
            session = %ziel,
            akteur = %session,
            bannen,
            grund = nachricht.reason.as_deref().unwrap_or(""),
            "Session entfernt"
        );
        self.client_entfernen(ziel, true);
    }

    fn handle_ban_list(&mut self, session: SessionId, nachricht: proto::BanList) {
        if !self.hat_berechtigung(session, ChannelId::ROOT, Berechtigung::BAN) {
            self.verweigern(session, ChannelId::ROOT, Berechtigung::BAN);
            return;
        }

        if nachricht.query.unwrap_or(false) {
            let eintraege: Vec<proto::BanEintrag> = self
                .bans
                .read()
                .iter()
                .map(|ban| proto::BanEintrag {
                    address: ban.adresse.to_string(),
                    mask: ban.praefix_bits,
                    name: Some(ban.name.clone()),
                    hash: Some(ban.zert_digest.clone()),
                    reason: Some(ban.grund.clone()),
                    start: Some(ban.beginn),
                    duration: Some(ban.dauer_sek),
                })
                .collect();
            if let Some(client) = self.clients.get(&session) {
                client.senden(ControlMessage::BanList(proto::BanList {
                    bans: eintraege,
                    query: None,
                }));
            }
            return;
        }

        // Vollstaendiges Ersetzen der Liste
        let mut liste = Vec::with_capacity(nachricht.bans.len());
        for eintrag in &nachricht.bans {
            let Ok(adresse) = eintrag.address.parse() else {
                tracing::warn!(adresse = %eintrag.address, "Ban mit unlesbarer Adresse verworfen");
                continue;
            };
            liste.push(Ban {
                adresse,
                praefix_bits: eintrag.mask,
                name: eintrag.name.clone().unwrap_or_default(),
                zert_digest: eintrag.hash.clone().unwrap_or_default(),
                grund: eintrag.reason.clone().unwrap_or_default(),
                beginn: eintrag.start.unwrap_or_else(|| Utc::now().timestamp()),
                dauer_sek: eintrag.duration.unwrap_or(0),
            });
        }
        *self.bans.write() = liste.clone();
        self.operation_protokollieren(Operation::BanListeSetzen { bans: liste });
        tracing::info!(session = %session, "Ban-Liste ersetzt");
    }

    // -----------------------------------------------------------------------
    // Text
    // -----------------------------------------------------------------------

    fn handle_text_message(&mut self, session: SessionId, nachricht: proto::TextMessage) {
        let regeln = self.filter_regeln();
        let gefiltert = match textfilter::filtern(&nachricht.message, &regeln) {
            Ok(text) => text,
            Err(fehler) => {
                self.verweigern_art(
                    session,
                    proto::VerweigerungsArt::TextTooLong,
                    &fehler.to_string(),
                );
                return;
            }
        };

        let mut empfaenger: BTreeSet<SessionId> = BTreeSet::new();

        // Direkt adressierte Sessions
        for roh in &nachricht.session {
            let ziel = SessionId(*roh);
            if self
                .clients
                .get(&ziel)
                .is_some_and(|c| c.zustand == ClientZustand::Bereit)
            {
                empfaenger.insert(ziel);
            }
        }

        // Kanaele
        for roh in &nachricht.channel_id {
            let kanal = ChannelId(*roh);
            if !self.kanaele.contains_key(&kanal) {
                continue;
            }
            if !self.hat_berechtigung(session, kanal, Berechtigung::TEXT_MESSAGE) {
                self.verweigern(session, kanal, Berechtigung::TEXT_MESSAGE);
                return;
            }
            if let Some(k) = self.kanaele.get(&kanal) {
                empfaenger.extend(k.mitglieder.iter().copied());
            }
        }

        // Teilbaeume
        for roh in &nachricht.tree_id {
            let wurzel = ChannelId(*roh);
            if !self.kanaele.contains_key(&wurzel) {
                continue;
            }
            if !self.hat_berechtigung(session, wurzel, Berechtigung::TEXT_MESSAGE) {
                self.verweigern(session, wurzel, Berechtigung::TEXT_MESSAGE);
                return;
            }
            for kanal in self.unterbaum(wurzel) {
                if !self.hat_berechtigung(session, kanal, Berechtigung::TEXT_MESSAGE) {
                    continue;
                }
                if let Some(k) = self.kanaele.get(&kanal) {
                    empfaenger.extend(k.mitglieder.iter().copied());
                }
            }
        }

        empfaenger.remove(&session);

        let ausgehend = proto::TextMessage {
            actor: Some(session.wert()),
            session: nachricht.session.clone(),
            channel_id: nachricht.channel_id.clone(),
            tree_id: nachricht.tree_id.clone(),
            message: gefiltert,
        };
        for ziel in empfaenger {
            if let Some(client) = self.clients.get(&ziel) {
                client.senden(ControlMessage::TextMessage(ausgehend.clone()));
            }
        }
    }

    pub(crate) fn filter_regeln(&self) -> FilterRegeln {
        FilterRegeln {
            html_erlaubt: self.konfiguration.bool_wert("AllowHTML"),
            max_text_laenge: self.konfiguration.ganzzahl("MaxTextMessageLength").max(0) as usize,
            max_bild_laenge: self.konfiguration.ganzzahl("MaxImageMessageLength").max(0) as usize,
        }
    }

    // -----------------------------------------------------------------------
    // ACL
    // -----------------------------------------------------------------------

    fn handle_acl(&mut self, session: SessionId, nachricht: proto::Acl) {
        let kanal_id = ChannelId(nachricht.channel_id);
        if !self.kanaele.contains_key(&kanal_id) {
            return;
        }
        if !self.hat_berechtigung(session, kanal_id, Berechtigung::WRITE) {
            self.verweigern(session, kanal_id, Berechtigung::WRITE);
            return;
        }

        if nachricht.query.unwrap_or(false) {
            self.acl_antworten(session, kanal_id);
            return;
        }

        // Ersetzen: nur nicht-geerbte Eintraege und Gruppen uebernehmen
        {
            let Some(kanal) = self.kanaele.get_mut(&kanal_id) else {
                return;
            };
            kanal.acl_erben = nachricht.inherit_acls.unwrap_or(true);
            kanal.acl = nachricht
                .acls
                .iter()
                .filter(|e| !e.inherited.unwrap_or(false))
                .map(|e| AclEintrag {
                    benutzer_id: e.user_id.map(UserId),
                    gruppe: e.group.clone().unwrap_or_default(),
                    hier: e.apply_here.unwrap_or(true),
                    unterkanaele: e.apply_subs.unwrap_or(true),
                    erlauben: e.grant.unwrap_or(0),
                    verweigern: e.deny.unwrap_or(0),
                })
                .collect();
            kanal.gruppen = nachricht
                .groups
                .iter()
                .filter(|g| !g.inherited.unwrap_or(false))
                .map(|g| {
                    let mut gruppe = Gruppe::neu(g.name.clone());
                    gruppe.erben = g.inherit.unwrap_or(true);
                    gruppe.vererbbar = g.inheritable.unwrap_or(true);
                    gruppe.hinzu = g.add.iter().copied().collect();
                    gruppe.entfernt = g.remove.iter().copied().collect();
                    (gruppe.name.clone(), gruppe)
                })
                .collect();
        }

        self.cache.leeren();
        self.kanal_persistieren(kanal_id);
        tracing::info!(session = %session, kanal = %kanal_id, "ACL ersetzt");
    }

    /// Beantwortet eine ACL-Abfrage mit eigenen und geerbten Eintraegen
    fn acl_antworten(&mut self, session: SessionId, kanal_id: ChannelId) {
        let kette = self.eltern_kette(kanal_id);

        let mut eintraege = Vec::new();
        for id in &kette {
            let Some(kanal) = self.kanaele.get(id) else {
                continue;
            };
            let geerbt = *id != kanal_id;
            for eintrag in &kanal.acl {
                if geerbt && !eintrag.unterkanaele {
                    continue;
                }
                eintraege.push(proto::AclEintragInfo {
                    apply_here: Some(eintrag.hier),
                    apply_subs: Some(eintrag.unterkanaele),
                    inherited: Some(geerbt),
                    user_id: eintrag.benutzer_id.map(|u| u.wert()),
                    group: (!eintrag.gruppe.is_empty()).then(|| eintrag.gruppe.clone()),
                    grant: Some(eintrag.erlauben),
                    deny: Some(eintrag.verweigern),
                });
            }
        }

        let mut gruppen: BTreeMap<String, proto::AclGruppe> = BTreeMap::new();
        for id in &kette {
            let Some(kanal) = self.kanaele.get(id) else {
                continue;
            };
            let geerbt = *id != kanal_id;
            for (name, gruppe) in &kanal.gruppen {
                let info = gruppen.entry(name.clone()).or_insert_with(|| proto::AclGruppe {
                    name: name.clone(),
                    inherited: Some(true),
                    ..Default::default()
                });
                if geerbt {
                    if gruppe.vererbbar {
                        info.inherited_members
                            .extend(gruppe.hinzu.iter().copied());
                    }
                } else {
                    info.inherited = Some(false);
                    info.inherit = Some(gruppe.erben);
                    info.inheritable = Some(gruppe.vererbbar);
                    info.add = gruppe.hinzu.iter().copied().collect();
                    info.remove = gruppe.entfernt.iter().copied().collect();
                }
            }
        }

        let inherit_acls = self.kanaele.get(&kanal_id).map(|k| k.acl_erben);
        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::Acl(proto::Acl {
                channel_id: kanal_id.wert(),
                inherit_acls,
                groups: gruppen.into_values().collect(),
                acls: eintraege,
                query: None,
            }));
        }
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    fn handle_query_users(&mut self, session: SessionId, nachricht: proto::QueryUsers) {
        let mut ids = Vec::new();
        let mut namen = Vec::new();

        for roh in &nachricht.ids {
            if let Some(benutzer) = self.benutzer.get(&UserId(*roh)) {
                ids.push(*roh);
                namen.push(benutzer.name.clone());
            }
        }
        for name in &nachricht.names {
            if let Some(uid) = self.nach_name.get(name) {
                ids.push(uid.wert());
                namen.push(name.clone());
            }
        }

        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::QueryUsers(proto::QueryUsers {
                ids,
                names: namen,
            }));
        }
    }

    /// Nonce-Austausch der Voice-Kryptografie
    ///
    /// Mit `client_nonce`: der Client beantwortet eine Resync-Aufforderung,
    /// die Empfangs-Nonce wird uebernommen. Ohne Felder: der Client
    /// fordert die aktuelle Server-Nonce an.
    fn handle_crypt_setup(&mut self, session: SessionId, nachricht: proto::CryptSetup) {
        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };

        if let Some(nonce) = nachricht.client_nonce {
            let Ok(nonce) = <[u8; 16]>::try_from(nonce.as_slice()) else {
                self.session_panik(session, "Client-Nonce mit falscher Laenge");
                return;
            };
            client.crypt.lock().set_decrypt_iv(nonce);
            client.letzter_resync = Utc::now().timestamp();
            tracing::debug!(session = %session, "Empfangs-Nonce uebernommen");
        } else {
            let server_nonce = client.crypt.lock().encrypt_iv.to_vec();
            client.senden(ControlMessage::CryptSetup(proto::CryptSetup {
                key: None,
                client_nonce: None,
                server_nonce: Some(server_nonce),
            }));
        }
    }

    fn handle_user_list(&mut self, session: SessionId, nachricht: proto::UserList) {
        if !self.hat_berechtigung(session, ChannelId::ROOT, Berechtigung::REGISTER) {
            self.verweigern(session, ChannelId::ROOT, Berechtigung::REGISTER);
            return;
        }

        if nachricht.users.is_empty() {
            // Abfrage: alle Registrierungen ausser dem SuperUser
            let mut eintraege: Vec<proto::UserListEintrag> = self
                .benutzer
                .values()
                .filter(|b| !b.id.ist_superuser())
                .map(|b| proto::UserListEintrag {
                    user_id: b.id.wert(),
                    name: Some(b.name.clone()),
                })
                .collect();
            eintraege.sort_by_key(|e| e.user_id);

            if let Some(client) = self.clients.get(&session) {
                client.senden(ControlMessage::UserList(proto::UserList {
                    users: eintraege,
                }));
            }
            return;
        }

        // Bearbeitung: fehlender Name loescht, sonst Umbenennen
        for eintrag in nachricht.users {
            let uid = UserId(eintrag.user_id);
            match eintrag.name.filter(|n| !n.is_empty()) {
                None => {
                    self.registrierung_entfernen(uid);
                }
                Some(neuer_name) => {
                    if uid.ist_superuser() {
                        self.verweigern_art(
                            session,
                            proto::VerweigerungsArt::SuperUser,
                            "Der SuperUser ist nicht umbenennbar",
                        );
                        continue;
                    }
                    if self.nach_name.contains_key(&neuer_name) {
                        self.verweigern_art(
                            session,
                            proto::VerweigerungsArt::UserName,
                            "Name ist bereits vergeben",
                        );
                        continue;
                    }
                    let gefroren = {
                        let Some(benutzer) = self.benutzer.get_mut(&uid) else {
                            continue;
                        };
                        self.nach_name.remove(&benutzer.name);
                        benutzer.name = neuer_name.clone();
                        benutzer.einfrieren()
                    };
                    self.nach_name.insert(neuer_name, uid);
                    self.operation_protokollieren(Operation::BenutzerAktualisieren {
                        benutzer: gefroren,
                    });
                }
            }
        }
    }

    /// Registriert Fluester-Ziele 1-30 fuer die Session
    fn handle_voice_target(&mut self, session: SessionId, nachricht: proto::VoiceTarget) {
        let Some(id) = nachricht.id.filter(|id| (1..=30).contains(id)) else {
            tracing::debug!(session = %session, "Fluester-Ziel ausserhalb von 1-30 verworfen");
            return;
        };
        let Some(client) = self.clients.get_mut(&session) else {
            return;
        };

        if nachricht.targets.is_empty() {
            client.sprachziele.remove(&(id as u8));
        } else {
            client.sprachziele.insert(id as u8, nachricht.targets);
        }
    }

    fn handle_permission_query(&mut self, session: SessionId, nachricht: proto::PermissionQuery) {
        if nachricht.flush.unwrap_or(false) {
            self.cache.leeren();
        }
        if let Some(roh) = nachricht.channel_id {
            let kanal = ChannelId(roh);
            if self.kanaele.contains_key(&kanal) {
                self.client_berechtigungen_senden(session, kanal);
            }
        }
    }

    fn handle_user_stats(&mut self, session: SessionId, nachricht: proto::UserStats) {
        let ziel = nachricht.session.map(SessionId).unwrap_or(session);
        if !self.clients.contains_key(&ziel) {
            return;
        }

        // Fremde Statistik verlangt das Registrier-Recht
        if ziel != session
            && !self.hat_berechtigung(session, ChannelId::ROOT, Berechtigung::REGISTER)
        {
            self.verweigern(session, ChannelId::ROOT, Berechtigung::REGISTER);
            return;
        }

        let Some(ziel_client) = self.clients.get(&ziel) else {
            return;
        };
        let vom_server = {
            let krypto = ziel_client.crypt.lock();
            PaketStatistik {
                good: krypto.good,
                late: krypto.late,
                lost: krypto.lost,
                resync: krypto.resync,
            }
        };

        let jetzt = Utc::now().timestamp();
        let antwort = proto::UserStats {
            session: Some(ziel.wert()),
            stats_only: nachricht.stats_only,
            from_client: Some(ziel_client.ping_statistik),
            from_server: Some(vom_server),
            udp_packets: Some(ziel_client.udp_pakete),
            tcp_packets: Some(ziel_client.tcp_pakete),
            onlinesecs: Some((jetzt - ziel_client.verbunden_seit).max(0) as u32),
            version: Some(ziel_client.version),
            celt_versions: ziel_client.codecs.clone(),
            address: Some(ziel_client.tcp_adresse.ip().to_string()),
            certificate_hash: ziel_client.zert_digest.clone(),
        };

        if let Some(client) = self.clients.get(&session) {
            client.senden(ControlMessage::UserStats(antwort));
        }
    }

    /// Liefert angefragte Blobs (Texturen, Kommentare, Beschreibungen)
    /// als gezielte Zustands-Nachrichten nach
    fn handle_request_blob(&mut self, session: SessionId, nachricht: proto::RequestBlob) {
        for roh in &nachricht.session_texture {
            let ziel = SessionId(*roh);
            let Some(blob) = self
                .clients
                .get(&ziel)
                .and_then(|c| c.benutzer)
                .and_then(|uid| self.benutzer.get(&uid))
                .and_then(|b| b.textur_blob.clone())
            else {
                continue;
            };
            match self.blobs.holen(&blob) {
                Ok(inhalt) => {
                    if let Some(client) = self.clients.get(&session) {
                        client.senden(ControlMessage::UserState(proto::UserState {
                            session: Some(ziel.wert()),
                            texture: Some(inhalt),
                            ..Default::default()
                        }));
                    }
                }
                Err(e) => tracing::error!(fehler = %e, "Textur-Blob fehlt"),
            }
        }

        for roh in &nachricht.session_comment {
            let ziel = SessionId(*roh);
            let Some(blob) = self
                .clients
                .get(&ziel)
                .and_then(|c| c.benutzer)
                .and_then(|uid| self.benutzer.get(&uid))
                .and_then(|b| b.kommentar_blob.clone())
            else {
                continue;
            };
            match self.blobs.holen(&blob) {
                Ok(inhalt) => {
                    if let Some(client) = self.clients.get(&session) {
                        client.senden(ControlMessage::UserState(proto::UserState {
                            session: Some(ziel.wert()),
                            comment: Some(String::from_utf8_lossy(&inhalt).into_owned()),
                            ..Default::default()
                        }));
                    }
                }
                Err(e) => tracing::error!(fehler = %e, "Kommentar-Blob fehlt"),
            }
        }

        for roh in &nachricht.channel_description {
            let kanal = ChannelId(*roh);
            let Some(blob) = self
                .kanaele
                .get(&kanal)
                .and_then(|k| k.beschreibung_blob.clone())
            else {
                continue;
            };
            match self.blobs.holen(&blob) {
                Ok(inhalt) => {
                    if let Some(client) = self.clients.get(&session) {
                        client.senden(ControlMessage::ChannelState(proto::ChannelState {
                            channel_id: Some(kanal.wert()),
                            description: Some(String::from_utf8_lossy(&inhalt).into_owned()),
                            ..Default::default()
                        }));
                    }
                }
                Err(e) => tracing::error!(fehler = %e, "Beschreibungs-Blob fehlt"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
