//! ACL-Resolver
//!
//! Wertet die Berechtigungen eines Anfragers fuer einen Zielkanal aus.
//! Der Aufrufer stellt die Eltern-Kette von der Wurzel bis zum Zielkanal
//! als Liste von `KettenGlied`-Sichten zusammen; der Resolver laeuft sie
//! von der Wurzel abwaerts und sammelt additive und entziehende Masken
//! pro passendem Eintrag.
//!
//! Fuer den SuperUser sind alle Bits implizit gesetzt, es findet keine
//! Auswertung statt.

use std::collections::HashMap;

use raunen_core::{ChannelId, SessionId, UserId};

use crate::permission::Berechtigung;
use crate::types::{AclEintrag, Gruppe};

// ---------------------------------------------------------------------------
// Sichten
// ---------------------------------------------------------------------------

/// Sicht auf einen Kanal innerhalb der Eltern-Kette
pub struct KettenGlied<'a> {
    pub kanal: ChannelId,
    pub acl: &'a [AclEintrag],
    pub gruppen: &'a HashMap<String, Gruppe>,
    /// Erbt dieser Kanal die ACLs seiner Eltern?
    pub acl_erben: bool,
}

/// Sicht auf die anfragende Session
pub struct Anfrager<'a> {
    pub session: SessionId,
    /// Registrierte Identitaet, falls vorhanden
    pub benutzer: Option<UserId>,
    /// Aktueller Kanal der Session (fuer die Gruppen `in`/`out`)
    pub kanal: ChannelId,
    /// Zertifikats-Digest (hex) fuer `$`-Gruppen
    pub zert_digest: Option<&'a str>,
    /// Access-Tokens fuer `#`-Gruppen
    pub tokens: &'a [String],
}

// ---------------------------------------------------------------------------
// Gruppen-Mitgliedschaft
// ---------------------------------------------------------------------------

/// Prueft die Mitgliedschaft in einer benannten Gruppe
///
/// `kontext_idx` ist der Index des Kanals in der Kette, in dessen Kontext
/// die Gruppe ausgewertet wird. Die Mitgliedschaft ist die transitive
/// Huelle der geerbten Gruppen, minus explizite Entfernungen, plus
/// temporaere Mitglieder des Kontextkanals.
pub fn ist_gruppen_mitglied(
    kette: &[KettenGlied],
    kontext_idx: usize,
    name: &str,
    anfrager: &Anfrager,
) -> bool {
    let benutzer = anfrager.benutzer.map(|u| u.wert());

    let mut aktiv = false;
    // Darf die naechsttiefere Definition die bisherige Mitgliedschaft erben?
    let mut weitergabe = true;

    for (idx, glied) in kette.iter().enumerate().take(kontext_idx + 1) {
        let Some(gruppe) = glied.gruppen.get(name) else {
            continue;
        };

        let mut basis = gruppe.erben && weitergabe && aktiv;
        if let Some(uid) = benutzer {
            if gruppe.hinzu.contains(&uid) {
                basis = true;
            }
            if idx == kontext_idx && gruppe.temporaer.contains(&uid) {
                basis = true;
            }
            if gruppe.entfernt.contains(&uid) {
                basis = false;
            }
        }
        // Temporaere Session-Mitglieder werden ueber die Session-ID gefuehrt
        if idx == kontext_idx && gruppe.temporaer.contains(&anfrager.session.wert()) {
            basis = true;
        }

        aktiv = basis;
        weitergabe = gruppe.vererbbar;
    }

    aktiv
}

/// Wertet einen Gruppen-Namen inklusive Praefixen aus
fn gruppe_passt(
    name: &str,
    kette: &[KettenGlied],
    acl_idx: usize,
    ziel_idx: usize,
    anfrager: &Anfrager,
) -> bool {
    let mut rest = name;
    let mut negieren = false;
    let mut im_acl_kanal = false;

    loop {
        if let Some(r) = rest.strip_prefix('!') {
            negieren = !negieren;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('~') {
            im_acl_kanal = true;
            rest = r;
        } else {
            break;
        }
    }

    let kontext_idx = if im_acl_kanal { acl_idx } else { ziel_idx };

    let ergebnis = if let Some(token) = rest.strip_prefix('#') {
        anfrager.tokens.iter().any(|t| t == token)
    } else if let Some(digest) = rest.strip_prefix('$') {
        anfrager
            .zert_digest
            .is_some_and(|d| d.eq_ignore_ascii_case(digest))
    } else {
        match rest {
            "all" => true,
            "auth" => anfrager.benutzer.is_some(),
            "in" => anfrager.kanal == kette[kontext_idx].kanal,
            "out" => anfrager.kanal != kette[kontext_idx].kanal,
            "none" => false,
            _ => ist_gruppen_mitglied(kette, kontext_idx, rest, anfrager),
        }
    };

    negieren != ergebnis
}

// ---------------------------------------------------------------------------
// Berechtigungs-Auswertung
// ---------------------------------------------------------------------------

/// Berechnet die effektive Berechtigungs-Maske des Anfragers fuer den
/// letzten Kanal der Kette
///
/// Die Kette muss von der Wurzel (Index 0) bis zum Zielkanal reichen.
pub fn berechtigungen(kette: &[KettenGlied], anfrager: &Anfrager) -> u32 {
    // SuperUser: alle Bits implizit, keine Auswertung
    if anfrager.benutzer == Some(UserId::SUPERUSER) {
        return Berechtigung::ALL;
    }

    debug_assert!(!kette.is_empty(), "Kette muss mindestens die Wurzel enthalten");
    let ziel_idx = kette.len() - 1;
    let ziel = kette[ziel_idx].kanal;

    let mut maske = Berechtigung::STANDARD;

    for (idx, glied) in kette.iter().enumerate() {
        // Ein Kanal ohne ACL-Vererbung beginnt mit den Standard-Rechten
        if !glied.acl_erben {
            maske = Berechtigung::STANDARD;
        }

        for eintrag in glied.acl {
            let gilt = if glied.kanal == ziel {
                eintrag.hier
            } else {
                eintrag.unterkanaele
            };
            if !gilt {
                continue;
            }

            let passt = match eintrag.benutzer_id {
                Some(uid) => anfrager.benutzer == Some(uid),
                None => gruppe_passt(&eintrag.gruppe, kette, idx, ziel_idx, anfrager),
            };
            if !passt {
                continue;
            }

            maske |= eintrag.erlauben;
            maske &= !eintrag.verweigern;
        }
    }

    maske
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestKanal {
        kanal: ChannelId,
        acl: Vec<AclEintrag>,
        gruppen: HashMap<String, Gruppe>,
        acl_erben: bool,
    }

    impl TestKanal {
        fn neu(id: u32) -> Self {
            Self {
                kanal: ChannelId(id),
                acl: Vec::new(),
                gruppen: HashMap::new(),
                acl_erben: true,
            }
        }

        fn glied(&self) -> KettenGlied<'_> {
            KettenGlied {
                kanal: self.kanal,
                acl: &self.acl,
                gruppen: &self.gruppen,
                acl_erben: self.acl_erben,
            }
        }
    }

    fn anfrager<'a>(benutzer: Option<u32>, tokens: &'a [String]) -> Anfrager<'a> {
        Anfrager {
            session: SessionId(1),
            benutzer: benutzer.map(UserId),
            kanal: ChannelId::ROOT,
            zert_digest: None,
            tokens,
        }
    }

    #[test]
    fn standard_rechte_ohne_acl() {
        let root = TestKanal::neu(0);
        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_eq!(maske, Berechtigung::STANDARD);
        assert_eq!(maske & Berechtigung::WRITE, 0);
    }

    #[test]
    fn superuser_hat_alles_ohne_auswertung() {
        let mut root = TestKanal::neu(0);
        // Selbst ein Alles-Verbot trifft den SuperUser nicht
        root.acl
            .push(AclEintrag::fuer_gruppe("all", 0, Berechtigung::ALL));
        let maske = berechtigungen(&[root.glied()], &anfrager(Some(0), &[]));
        assert_eq!(maske, Berechtigung::ALL);
    }

    #[test]
    fn gewaehren_und_entziehen() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_gruppe(
            "all",
            Berechtigung::MAKE_CHANNEL,
            Berechtigung::SPEAK,
        ));

        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_ne!(maske & Berechtigung::MAKE_CHANNEL, 0);
        assert_eq!(maske & Berechtigung::SPEAK, 0);
    }

    #[test]
    fn unterkanal_erbt_eltern_acl() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_gruppe(
            "all",
            0,
            Berechtigung::ENTER,
        ));
        let kind = TestKanal::neu(1);

        let maske = berechtigungen(&[root.glied(), kind.glied()], &anfrager(None, &[]));
        assert_eq!(maske & Berechtigung::ENTER, 0);
    }

    #[test]
    fn hier_vs_unterkanaele() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag {
            benutzer_id: None,
            gruppe: "all".into(),
            hier: true,
            unterkanaele: false, // gilt nur im Root selbst
            erlauben: 0,
            verweigern: Berechtigung::SPEAK,
        });
        let kind = TestKanal::neu(1);

        // Im Root selbst entzogen
        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_eq!(maske & Berechtigung::SPEAK, 0);

        // Im Kind nicht, da der Eintrag nicht fuer Unterkanaele gilt
        let maske = berechtigungen(&[root.glied(), kind.glied()], &anfrager(None, &[]));
        assert_ne!(maske & Berechtigung::SPEAK, 0);
    }

    #[test]
    fn acl_vererbung_abschaltbar() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_gruppe(
            "all",
            0,
            Berechtigung::SPEAK | Berechtigung::ENTER,
        ));
        let mut kind = TestKanal::neu(1);
        kind.acl_erben = false;

        let maske = berechtigungen(&[root.glied(), kind.glied()], &anfrager(None, &[]));
        // Das Kind beginnt wieder mit den Standard-Rechten
        assert_ne!(maske & Berechtigung::SPEAK, 0);
        assert_ne!(maske & Berechtigung::ENTER, 0);
    }

    #[test]
    fn auth_gruppe_nur_fuer_registrierte() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_gruppe(
            "auth",
            Berechtigung::MAKE_TEMP_CHANNEL,
            0,
        ));

        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_eq!(maske & Berechtigung::MAKE_TEMP_CHANNEL, 0);

        let maske = berechtigungen(&[root.glied()], &anfrager(Some(7), &[]));
        assert_ne!(maske & Berechtigung::MAKE_TEMP_CHANNEL, 0);
    }

    #[test]
    fn token_gruppe() {
        let mut root = TestKanal::neu(0);
        root.acl
            .push(AclEintrag::fuer_gruppe("#einlass", Berechtigung::ENTER, 0));
        root.acl
            .push(AclEintrag::fuer_gruppe("all", 0, Berechtigung::ENTER));
        // Reihenfolge: erst Token-Gewaehrung, dann Alles-Entzug -> Entzug gewinnt.
        // Andersherum gewinnt das Token.
        root.acl.swap(0, 1);

        let mit_token = vec!["einlass".to_string()];
        let maske = berechtigungen(&[root.glied()], &anfrager(None, &mit_token));
        assert_ne!(maske & Berechtigung::ENTER, 0);

        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_eq!(maske & Berechtigung::ENTER, 0);
    }

    #[test]
    fn zert_digest_gruppe() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_gruppe(
            "$abcdef012345",
            Berechtigung::WRITE,
            0,
        ));

        let mut a = anfrager(None, &[]);
        a.zert_digest = Some("ABCDEF012345");
        let maske = berechtigungen(&[root.glied()], &a);
        assert_ne!(maske & Berechtigung::WRITE, 0, "Digest-Vergleich ist case-insensitiv");
    }

    #[test]
    fn negierte_gruppe() {
        let mut root = TestKanal::neu(0);
        root.acl
            .push(AclEintrag::fuer_gruppe("!auth", 0, Berechtigung::TEXT_MESSAGE));

        // Unregistrierte verlieren das Recht
        let maske = berechtigungen(&[root.glied()], &anfrager(None, &[]));
        assert_eq!(maske & Berechtigung::TEXT_MESSAGE, 0);

        // Registrierte behalten es
        let maske = berechtigungen(&[root.glied()], &anfrager(Some(3), &[]));
        assert_ne!(maske & Berechtigung::TEXT_MESSAGE, 0);
    }

    #[test]
    fn benannte_gruppe_mit_vererbung() {
        let mut root = TestKanal::neu(0);
        let mut admins = Gruppe::neu("admin");
        admins.hinzu.insert(9);
        root.gruppen.insert("admin".into(), admins);
        let mut kind = TestKanal::neu(1);
        kind.acl.push(AclEintrag::fuer_gruppe(
            "admin",
            Berechtigung::WRITE,
            0,
        ));

        let kette = [root.glied(), kind.glied()];
        let maske = berechtigungen(&kette, &anfrager(Some(9), &[]));
        assert_ne!(maske & Berechtigung::WRITE, 0, "Gruppe erbt vom Root");

        let maske = berechtigungen(&kette, &anfrager(Some(10), &[]));
        assert_eq!(maske & Berechtigung::WRITE, 0);
    }

    #[test]
    fn gruppen_entfernung_gewinnt() {
        let mut root = TestKanal::neu(0);
        let mut gruppe = Gruppe::neu("team");
        gruppe.hinzu.insert(4);
        root.gruppen.insert("team".into(), gruppe);

        let mut kind = TestKanal::neu(1);
        let mut lokal = Gruppe::neu("team");
        lokal.entfernt.insert(4);
        kind.gruppen.insert("team".into(), lokal);
        kind.acl
            .push(AclEintrag::fuer_gruppe("team", Berechtigung::MOVE, 0));

        let kette = [root.glied(), kind.glied()];
        assert!(!ist_gruppen_mitglied(
            &kette,
            1,
            "team",
            &anfrager(Some(4), &[])
        ));
        let maske = berechtigungen(&kette, &anfrager(Some(4), &[]));
        assert_eq!(maske & Berechtigung::MOVE, 0);
    }

    #[test]
    fn nicht_vererbbare_gruppe_endet() {
        let mut root = TestKanal::neu(0);
        let mut gruppe = Gruppe::neu("intern");
        gruppe.hinzu.insert(2);
        gruppe.vererbbar = false;
        root.gruppen.insert("intern".into(), gruppe);

        let mut kind = TestKanal::neu(1);
        kind.gruppen.insert("intern".into(), Gruppe::neu("intern"));

        let kette = [root.glied(), kind.glied()];
        assert!(ist_gruppen_mitglied(&kette, 0, "intern", &anfrager(Some(2), &[])));
        assert!(
            !ist_gruppen_mitglied(&kette, 1, "intern", &anfrager(Some(2), &[])),
            "vererbbar=false kappt die Weitergabe"
        );
    }

    #[test]
    fn benutzer_eintrag_trifft_nur_den_benutzer() {
        let mut root = TestKanal::neu(0);
        root.acl.push(AclEintrag::fuer_benutzer(
            UserId(6),
            Berechtigung::BAN,
            0,
        ));

        let maske = berechtigungen(&[root.glied()], &anfrager(Some(6), &[]));
        assert_ne!(maske & Berechtigung::BAN, 0);

        let maske = berechtigungen(&[root.glied()], &anfrager(Some(7), &[]));
        assert_eq!(maske & Berechtigung::BAN, 0);
    }
}
