//! Control-Protokoll (TCP/TLS)
//!
//! Definiert alle Steuerungsnachrichten die ueber die TCP/TLS-Verbindung
//! zwischen Client und Server ausgetauscht werden.
//!
//! ## Design
//! - Jede Nachricht traegt auf dem Draht einen Kind-Diskriminator (u16),
//!   die Nummerierung folgt dem Mumble-Protokoll
//! - Payload-Kodierung via serde (JSON) hinter der Codec-Grenze
//! - Unbekannte Kinds werden beim Dekodieren als `None` gemeldet und vom
//!   Aufrufer verworfen
//! - Alle Felder optional bzw. mit Defaults, wie im Originalprotokoll

use std::io;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kind-Diskriminatoren
// ---------------------------------------------------------------------------

/// Nachrichten-Kinds auf dem Draht (Mumble-Nummerierung)
pub mod kind {
    pub const VERSION: u16 = 0;
    pub const UDP_TUNNEL: u16 = 1;
    pub const AUTHENTICATE: u16 = 2;
    pub const PING: u16 = 3;
    pub const REJECT: u16 = 4;
    pub const SERVER_SYNC: u16 = 5;
    pub const CHANNEL_REMOVE: u16 = 6;
    pub const CHANNEL_STATE: u16 = 7;
    pub const USER_REMOVE: u16 = 8;
    pub const USER_STATE: u16 = 9;
    pub const BAN_LIST: u16 = 10;
    pub const TEXT_MESSAGE: u16 = 11;
    pub const PERMISSION_DENIED: u16 = 12;
    pub const ACL: u16 = 13;
    pub const QUERY_USERS: u16 = 14;
    pub const CRYPT_SETUP: u16 = 15;
    pub const CONTEXT_ACTION_MODIFY: u16 = 16;
    pub const CONTEXT_ACTION: u16 = 17;
    pub const USER_LIST: u16 = 18;
    pub const VOICE_TARGET: u16 = 19;
    pub const PERMISSION_QUERY: u16 = 20;
    pub const CODEC_VERSION: u16 = 21;
    pub const USER_STATS: u16 = 22;
    pub const REQUEST_BLOB: u16 = 23;
    pub const SERVER_CONFIG: u16 = 24;
}

// ---------------------------------------------------------------------------
// Handshake-Nachrichten
// ---------------------------------------------------------------------------

/// Versions-Austausch (erste Nachricht in beide Richtungen)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Version {
    /// Gepackte Protokollversion: (major << 16) | (minor << 8) | patch
    pub version: Option<u32>,
    /// Release-Bezeichnung des Gegenuebers
    pub release: Option<String>,
    /// Betriebssystem
    pub os: Option<String>,
    /// Betriebssystem-Version
    pub os_version: Option<String>,
}

/// Authentifizierungs-Anfrage vom Client
///
/// Kann nach dem Login erneut gesendet werden um die Access-Tokens
/// zu aktualisieren.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authenticate {
    pub username: Option<String>,
    /// Klartext-Passwort (nur fuer den SuperUser relevant)
    pub password: Option<String>,
    /// Access-Tokens erweitern die Gruppenzugehoerigkeit der Session
    pub tokens: Vec<String>,
    /// Vom Client unterstuetzte CELT-Bitstream-Versionen
    pub celt_versions: Vec<i32>,
}

/// Ablehnungsgrund bei fehlgeschlagener Authentifizierung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectGrund {
    None,
    WrongVersion,
    InvalidUsername,
    WrongUserPw,
    WrongServerPw,
    UsernameInUse,
    ServerFull,
    NoCertificate,
}

/// Typisierte Ablehnung, danach wird die Verbindung geschlossen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reject {
    pub reject_type: Option<RejectGrund>,
    pub reason: Option<String>,
}

/// Abschluss der Synchronisation nach erfolgreichem Login
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSync {
    pub session: Option<u32>,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    /// Berechtigungs-Maske des Clients im Root-Kanal
    pub permissions: Option<u64>,
}

/// Keepalive mit Krypto-Statistik
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    pub timestamp: Option<u64>,
    pub good: Option<u32>,
    pub late: Option<u32>,
    pub lost: Option<u32>,
    pub resync: Option<u32>,
}

// ---------------------------------------------------------------------------
// Kanal-Nachrichten
// ---------------------------------------------------------------------------

/// Kanal entfernen (Client-Anfrage) bzw. Entfernung melden (Broadcast)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRemove {
    pub channel_id: u32,
}

/// Kanal anlegen/bearbeiten (Client-Anfrage) bzw. Zustand melden (Broadcast)
///
/// Ohne `channel_id` legt die Anfrage einen neuen Kanal an.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelState {
    pub channel_id: Option<u32>,
    pub parent: Option<u32>,
    pub name: Option<String>,
    /// Vollstaendige Link-Menge (nur in Broadcasts)
    pub links: Vec<u32>,
    pub description: Option<String>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
    pub temporary: Option<bool>,
    pub position: Option<i32>,
    /// SHA-1-Digest der Beschreibung im Blob-Store (hex)
    pub description_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Benutzer-Nachrichten
// ---------------------------------------------------------------------------

/// Session entfernen: Kick/Ban-Anfrage bzw. Trennungs-Broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRemove {
    pub session: u32,
    pub actor: Option<u32>,
    pub reason: Option<String>,
    pub ban: Option<bool>,
}

/// Session-Zustand: Aenderungsanfrage bzw. Zustands-Broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserState {
    pub session: Option<u32>,
    pub actor: Option<u32>,
    pub name: Option<String>,
    pub user_id: Option<u32>,
    pub channel_id: Option<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub texture: Option<Vec<u8>>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
    pub comment: Option<String>,
    /// SHA-1-Digest des Client-Zertifikats (hex)
    pub hash: Option<String>,
    pub comment_hash: Option<String>,
    pub texture_hash: Option<String>,
    pub priority_speaker: Option<bool>,
    pub recording: Option<bool>,
}

/// Ein Eintrag in der Ban-Liste
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanEintrag {
    /// IP-Adresse als Text (v4 oder v6)
    pub address: String,
    /// Praefix-Laenge in Bits (CIDR)
    pub mask: u32,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub reason: Option<String>,
    /// Beginn als Unix-Timestamp (Sekunden)
    pub start: Option<i64>,
    /// Dauer in Sekunden, 0 = permanent
    pub duration: Option<u32>,
}

/// Ban-Liste abfragen (`query`) oder vollstaendig ersetzen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanList {
    pub bans: Vec<BanEintrag>,
    pub query: Option<bool>,
}

/// Textnachricht an Sessions, Kanaele und/oder Teilbaeume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMessage {
    pub actor: Option<u32>,
    pub session: Vec<u32>,
    pub channel_id: Vec<u32>,
    pub tree_id: Vec<u32>,
    pub message: String,
}

/// Art einer Berechtigungs-Verweigerung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerweigerungsArt {
    Text,
    Permission,
    SuperUser,
    ChannelName,
    TextTooLong,
    TemporaryChannel,
    MissingCertificate,
    UserName,
    ChannelFull,
}

/// Verweigerungs-Antwort auf eine unzulaessige Anfrage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionDenied {
    pub permission: Option<u32>,
    pub channel_id: Option<u32>,
    pub session: Option<u32>,
    pub reason: Option<String>,
    pub deny_type: Option<VerweigerungsArt>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// ACL-Nachrichten
// ---------------------------------------------------------------------------

/// Gruppe in einer ACL-Nachricht
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclGruppe {
    pub name: String,
    /// Wurde die Gruppe von einem Elternkanal geerbt?
    pub inherited: Option<bool>,
    /// Erbt die Gruppe Mitglieder von Elternkanaelen?
    pub inherit: Option<bool>,
    /// Duerfen Unterkanaele diese Gruppe erben?
    pub inheritable: Option<bool>,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
    pub inherited_members: Vec<u32>,
}

/// Einzelner ACL-Eintrag in einer ACL-Nachricht
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclEintragInfo {
    pub apply_here: Option<bool>,
    pub apply_subs: Option<bool>,
    pub inherited: Option<bool>,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: Option<u32>,
    pub deny: Option<u32>,
}

/// ACL eines Kanals abfragen (`query`) oder ersetzen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Acl {
    pub channel_id: u32,
    pub inherit_acls: Option<bool>,
    pub groups: Vec<AclGruppe>,
    pub acls: Vec<AclEintragInfo>,
    pub query: Option<bool>,
}

// ---------------------------------------------------------------------------
// Abfrage-Nachrichten
// ---------------------------------------------------------------------------

/// Aufloesen von Benutzer-IDs zu Namen und umgekehrt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryUsers {
    pub ids: Vec<u32>,
    pub names: Vec<String>,
}

/// Schluessel- und Nonce-Austausch fuer die Voice-Kryptografie
///
/// Drei Verwendungen:
/// - Server -> Client nach der Authentifizierung: alle drei Felder gesetzt
/// - Server -> Client als Resync-Aufforderung: alle Felder leer
/// - Client -> Server als Resync-Antwort: nur `client_nonce` gesetzt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptSetup {
    pub key: Option<Vec<u8>>,
    pub client_nonce: Option<Vec<u8>>,
    pub server_nonce: Option<Vec<u8>>,
}

/// Eintrag in der Liste registrierter Benutzer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserListEintrag {
    pub user_id: u32,
    /// Neuer Name beim Umbenennen; fehlend = Registrierung loeschen
    pub name: Option<String>,
}

/// Registrierte Benutzer abfragen bzw. bearbeiten
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserList {
    pub users: Vec<UserListEintrag>,
}

/// Einzelnes Ziel innerhalb eines Fluester-Ziels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceTargetZiel {
    pub session: Vec<u32>,
    pub channel_id: Option<u32>,
    pub group: Option<String>,
    /// Verlinkte Kanaele einbeziehen
    pub links: Option<bool>,
    /// Unterkanaele einbeziehen
    pub children: Option<bool>,
}

/// Fluester-Ziel registrieren (Ziel-Selektoren 1-30)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceTarget {
    pub id: Option<u32>,
    pub targets: Vec<VoiceTargetZiel>,
}

/// Berechtigungen fuer einen Kanal abfragen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionQuery {
    pub channel_id: Option<u32>,
    pub permissions: Option<u32>,
    /// Client soll seinen Berechtigungs-Cache verwerfen
    pub flush: Option<bool>,
}

/// Vom Server gewaehltes Codec-Paar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecVersion {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
}

/// Paket-Statistik einer Richtung (aus Sicht der Krypto-Schicht)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaketStatistik {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

/// Detaillierte Statistik einer Session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStats {
    pub session: Option<u32>,
    pub stats_only: Option<bool>,
    pub from_client: Option<PaketStatistik>,
    pub from_server: Option<PaketStatistik>,
    pub udp_packets: Option<u32>,
    pub tcp_packets: Option<u32>,
    pub onlinesecs: Option<u32>,
    pub version: Option<u32>,
    pub celt_versions: Vec<i32>,
    pub address: Option<String>,
    pub certificate_hash: Option<String>,
}

/// Blobs (Texturen, Kommentare, Beschreibungen) nachfordern
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestBlob {
    pub session_texture: Vec<u32>,
    pub session_comment: Vec<u32>,
    pub channel_description: Vec<u32>,
}

/// Server-Konfiguration die der Client kennen muss
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigInfo {
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    pub allow_html: Option<bool>,
    pub message_length: Option<u32>,
    pub image_message_length: Option<u32>,
}

// ---------------------------------------------------------------------------
// Haupt-Enum: ControlMessage
// ---------------------------------------------------------------------------

/// Alle Control-Nachrichten die der Server versteht oder versendet
///
/// Der Kind-Diskriminator steht im Frame-Header, die Payload wird hinter
/// der Codec-Grenze via serde kodiert. Unbekannte Kinds dekodieren zu
/// `None` und werden verworfen.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Version(Version),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    BanList(BanList),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    Acl(Acl),
    QueryUsers(QueryUsers),
    CryptSetup(CryptSetup),
    UserList(UserList),
    VoiceTarget(VoiceTarget),
    PermissionQuery(PermissionQuery),
    CodecVersion(CodecVersion),
    UserStats(UserStats),
    RequestBlob(RequestBlob),
    ServerConfig(ServerConfigInfo),
}

impl ControlMessage {
    /// Gibt den Kind-Diskriminator der Nachricht zurueck
    pub fn kind(&self) -> u16 {
        match self {
            Self::Version(_) => kind::VERSION,
            Self::Authenticate(_) => kind::AUTHENTICATE,
            Self::Ping(_) => kind::PING,
            Self::Reject(_) => kind::REJECT,
            Self::ServerSync(_) => kind::SERVER_SYNC,
            Self::ChannelRemove(_) => kind::CHANNEL_REMOVE,
            Self::ChannelState(_) => kind::CHANNEL_STATE,
            Self::UserRemove(_) => kind::USER_REMOVE,
            Self::UserState(_) => kind::USER_STATE,
            Self::BanList(_) => kind::BAN_LIST,
            Self::TextMessage(_) => kind::TEXT_MESSAGE,
            Self::PermissionDenied(_) => kind::PERMISSION_DENIED,
            Self::Acl(_) => kind::ACL,
            Self::QueryUsers(_) => kind::QUERY_USERS,
            Self::CryptSetup(_) => kind::CRYPT_SETUP,
            Self::UserList(_) => kind::USER_LIST,
            Self::VoiceTarget(_) => kind::VOICE_TARGET,
            Self::PermissionQuery(_) => kind::PERMISSION_QUERY,
            Self::CodecVersion(_) => kind::CODEC_VERSION,
            Self::UserStats(_) => kind::USER_STATS,
            Self::RequestBlob(_) => kind::REQUEST_BLOB,
            Self::ServerConfig(_) => kind::SERVER_CONFIG,
        }
    }

    /// Name des Kinds fuer Log-Ausgaben
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Version(_) => "Version",
            Self::Authenticate(_) => "Authenticate",
            Self::Ping(_) => "Ping",
            Self::Reject(_) => "Reject",
            Self::ServerSync(_) => "ServerSync",
            Self::ChannelRemove(_) => "ChannelRemove",
            Self::ChannelState(_) => "ChannelState",
            Self::UserRemove(_) => "UserRemove",
            Self::UserState(_) => "UserState",
            Self::BanList(_) => "BanList",
            Self::TextMessage(_) => "TextMessage",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::Acl(_) => "ACL",
            Self::QueryUsers(_) => "QueryUsers",
            Self::CryptSetup(_) => "CryptSetup",
            Self::UserList(_) => "UserList",
            Self::VoiceTarget(_) => "VoiceTarget",
            Self::PermissionQuery(_) => "PermissionQuery",
            Self::CodecVersion(_) => "CodecVersion",
            Self::UserStats(_) => "UserStats",
            Self::RequestBlob(_) => "RequestBlob",
            Self::ServerConfig(_) => "ServerConfig",
        }
    }

    /// Serialisiert die Payload der Nachricht
    pub fn encode_payload(&self) -> io::Result<Vec<u8>> {
        let ergebnis = match self {
            Self::Version(m) => serde_json::to_vec(m),
            Self::Authenticate(m) => serde_json::to_vec(m),
            Self::Ping(m) => serde_json::to_vec(m),
            Self::Reject(m) => serde_json::to_vec(m),
            Self::ServerSync(m) => serde_json::to_vec(m),
            Self::ChannelRemove(m) => serde_json::to_vec(m),
            Self::ChannelState(m) => serde_json::to_vec(m),
            Self::UserRemove(m) => serde_json::to_vec(m),
            Self::UserState(m) => serde_json::to_vec(m),
            Self::BanList(m) => serde_json::to_vec(m),
            Self::TextMessage(m) => serde_json::to_vec(m),
            Self::PermissionDenied(m) => serde_json::to_vec(m),
            Self::Acl(m) => serde_json::to_vec(m),
            Self::QueryUsers(m) => serde_json::to_vec(m),
            Self::CryptSetup(m) => serde_json::to_vec(m),
            Self::UserList(m) => serde_json::to_vec(m),
            Self::VoiceTarget(m) => serde_json::to_vec(m),
            Self::PermissionQuery(m) => serde_json::to_vec(m),
            Self::CodecVersion(m) => serde_json::to_vec(m),
            Self::UserStats(m) => serde_json::to_vec(m),
            Self::RequestBlob(m) => serde_json::to_vec(m),
            Self::ServerConfig(m) => serde_json::to_vec(m),
        };
        ergebnis.map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Payload-Serialisierung fehlgeschlagen: {e}"),
            )
        })
    }

    /// Dekodiert eine Payload anhand ihres Kind-Diskriminators
    ///
    /// Gibt `Ok(None)` fuer unbekannte Kinds zurueck; der Aufrufer
    /// verwirft solche Frames.
    pub fn decode_payload(kind: u16, payload: &[u8]) -> io::Result<Option<Self>> {
        fn json<T: for<'a> Deserialize<'a>>(payload: &[u8]) -> io::Result<T> {
            serde_json::from_slice(payload).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Payload-Deserialisierung fehlgeschlagen: {e}"),
                )
            })
        }

        let nachricht = match kind {
            kind::VERSION => Self::Version(json(payload)?),
            kind::AUTHENTICATE => Self::Authenticate(json(payload)?),
            kind::PING => Self::Ping(json(payload)?),
            kind::REJECT => Self::Reject(json(payload)?),
            kind::SERVER_SYNC => Self::ServerSync(json(payload)?),
            kind::CHANNEL_REMOVE => Self::ChannelRemove(json(payload)?),
            kind::CHANNEL_STATE => Self::ChannelState(json(payload)?),
            kind::USER_REMOVE => Self::UserRemove(json(payload)?),
            kind::USER_STATE => Self::UserState(json(payload)?),
            kind::BAN_LIST => Self::BanList(json(payload)?),
            kind::TEXT_MESSAGE => Self::TextMessage(json(payload)?),
            kind::PERMISSION_DENIED => Self::PermissionDenied(json(payload)?),
            kind::ACL => Self::Acl(json(payload)?),
            kind::QUERY_USERS => Self::QueryUsers(json(payload)?),
            kind::CRYPT_SETUP => Self::CryptSetup(json(payload)?),
            kind::USER_LIST => Self::UserList(json(payload)?),
            kind::VOICE_TARGET => Self::VoiceTarget(json(payload)?),
            kind::PERMISSION_QUERY => Self::PermissionQuery(json(payload)?),
            kind::CODEC_VERSION => Self::CodecVersion(json(payload)?),
            kind::USER_STATS => Self::UserStats(json(payload)?),
            kind::REQUEST_BLOB => Self::RequestBlob(json(payload)?),
            kind::SERVER_CONFIG => Self::ServerConfig(json(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nachricht))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_und_payload_round_trip() {
        let original = ControlMessage::Authenticate(Authenticate {
            username: Some("alice".into()),
            password: None,
            tokens: vec!["geheim".into()],
            celt_versions: vec![-2147483637, 8],
        });
        assert_eq!(original.kind(), kind::AUTHENTICATE);

        let payload = original.encode_payload().unwrap();
        let dekodiert = ControlMessage::decode_payload(original.kind(), &payload)
            .unwrap()
            .expect("Bekanntes Kind muss dekodieren");
        assert_eq!(dekodiert, original);
    }

    #[test]
    fn unbekanntes_kind_wird_verworfen() {
        let ergebnis = ControlMessage::decode_payload(999, b"{}").unwrap();
        assert!(ergebnis.is_none());

        // Bekannte, aber vom Server nicht behandelte Kinds ebenfalls
        let ergebnis = ControlMessage::decode_payload(kind::CONTEXT_ACTION, b"{}").unwrap();
        assert!(ergebnis.is_none());
    }

    #[test]
    fn fehlende_felder_dekodieren_zu_defaults() {
        let nachricht = ControlMessage::decode_payload(kind::USER_STATE, b"{}")
            .unwrap()
            .unwrap();
        if let ControlMessage::UserState(u) = nachricht {
            assert!(u.session.is_none());
            assert!(u.self_mute.is_none());
        } else {
            panic!("Erwartet UserState");
        }
    }

    #[test]
    fn kaputte_payload_ist_fehler() {
        let ergebnis = ControlMessage::decode_payload(kind::PING, b"kein json");
        assert!(ergebnis.is_err());
    }

    #[test]
    fn reject_grund_serialisierung() {
        let msg = ControlMessage::Reject(Reject {
            reject_type: Some(RejectGrund::UsernameInUse),
            reason: Some("Bereits verbunden".into()),
        });
        let payload = msg.encode_payload().unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("username_in_use"));
    }

    #[test]
    fn crypt_setup_varianten() {
        // Vollstaendig (nach Authentifizierung)
        let voll = CryptSetup {
            key: Some(vec![1; 16]),
            client_nonce: Some(vec![2; 16]),
            server_nonce: Some(vec![3; 16]),
        };
        // Resync-Aufforderung (leer)
        let leer = CryptSetup::default();

        for setup in [voll, leer] {
            let msg = ControlMessage::CryptSetup(setup.clone());
            let payload = msg.encode_payload().unwrap();
            let zurueck = ControlMessage::decode_payload(kind::CRYPT_SETUP, &payload)
                .unwrap()
                .unwrap();
            assert_eq!(zurueck, ControlMessage::CryptSetup(setup));
        }
    }

    #[test]
    fn alle_kinds_eindeutig() {
        let nachrichten: Vec<ControlMessage> = vec![
            ControlMessage::Version(Default::default()),
            ControlMessage::Authenticate(Default::default()),
            ControlMessage::Ping(Default::default()),
            ControlMessage::Reject(Default::default()),
            ControlMessage::ServerSync(Default::default()),
            ControlMessage::ChannelRemove(Default::default()),
            ControlMessage::ChannelState(Default::default()),
            ControlMessage::UserRemove(Default::default()),
            ControlMessage::UserState(Default::default()),
            ControlMessage::BanList(Default::default()),
            ControlMessage::TextMessage(Default::default()),
            ControlMessage::PermissionDenied(Default::default()),
            ControlMessage::Acl(Default::default()),
            ControlMessage::QueryUsers(Default::default()),
            ControlMessage::CryptSetup(Default::default()),
            ControlMessage::UserList(Default::default()),
            ControlMessage::VoiceTarget(Default::default()),
            ControlMessage::PermissionQuery(Default::default()),
            ControlMessage::CodecVersion(Default::default()),
            ControlMessage::UserStats(Default::default()),
            ControlMessage::RequestBlob(Default::default()),
            ControlMessage::ServerConfig(Default::default()),
        ];

        let mut kinds: Vec<u16> = nachrichten.iter().map(|m| m.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), nachrichten.len(), "Kinds muessen eindeutig sein");

        // Jede Nachricht muss ueber ihren eigenen Kind wieder dekodierbar sein
        for msg in &nachrichten {
            let payload = msg.encode_payload().unwrap();
            let zurueck = ControlMessage::decode_payload(msg.kind(), &payload)
                .unwrap()
                .unwrap();
            assert_eq!(zurueck.kind(), msg.kind());
        }
    }
}
