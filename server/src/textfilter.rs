//! Text- und HTML-Filter
//!
//! Filtert eingehende Textnachrichten und Kommentare nach den aktuellen
//! Server-Regeln: HTML wird entfernt wenn `AllowHTML` aus ist, und die
//! Laenge wird gegen `MaxTextMessageLength` bzw. (bei eingebetteten
//! Bildern) `MaxImageMessageLength` geprueft.

use thiserror::Error;

/// Regeln fuer den Textfilter, abgeleitet aus der Konfiguration
#[derive(Debug, Clone, Copy)]
pub struct FilterRegeln {
    pub html_erlaubt: bool,
    /// 0 = unbegrenzt
    pub max_text_laenge: usize,
    /// 0 = unbegrenzt
    pub max_bild_laenge: usize,
}

/// Fehler des Textfilters
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterFehler {
    #[error("Nachricht zu lang: {ist} Bytes (Maximum {erlaubt})")]
    ZuLang { ist: usize, erlaubt: usize },
}

/// Filtert einen Text nach den gegebenen Regeln
pub fn filtern(text: &str, regeln: &FilterRegeln) -> Result<String, FilterFehler> {
    let gefiltert = if regeln.html_erlaubt {
        text.to_string()
    } else {
        html_entfernen(text)
    };

    // Nachrichten mit eingebetteten Bildern duerfen laenger sein
    let grenze = if text.contains("data:image") {
        regeln.max_bild_laenge
    } else {
        regeln.max_text_laenge
    };

    if grenze > 0 && gefiltert.len() > grenze {
        return Err(FilterFehler::ZuLang {
            ist: gefiltert.len(),
            erlaubt: grenze,
        });
    }

    Ok(gefiltert)
}

/// Entfernt HTML-Tags und ersetzt die gaengigen Entities
fn html_entfernen(text: &str) -> String {
    let mut ergebnis = String::with_capacity(text.len());
    let mut im_tag = false;

    for zeichen in text.chars() {
        match zeichen {
            '<' => im_tag = true,
            '>' => im_tag = false,
            _ if !im_tag => ergebnis.push(zeichen),
            _ => {}
        }
    }

    ergebnis
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn regeln(html: bool, text: usize, bild: usize) -> FilterRegeln {
        FilterRegeln {
            html_erlaubt: html,
            max_text_laenge: text,
            max_bild_laenge: bild,
        }
    }

    #[test]
    fn klartext_bleibt_unveraendert() {
        let ergebnis = filtern("Hallo zusammen", &regeln(false, 100, 1000)).unwrap();
        assert_eq!(ergebnis, "Hallo zusammen");
    }

    #[test]
    fn html_wird_entfernt() {
        let ergebnis = filtern("<b>fett</b> und <i>kursiv</i>", &regeln(false, 100, 0)).unwrap();
        assert_eq!(ergebnis, "fett und kursiv");
    }

    #[test]
    fn html_bleibt_wenn_erlaubt() {
        let ergebnis = filtern("<b>fett</b>", &regeln(true, 100, 0)).unwrap();
        assert_eq!(ergebnis, "<b>fett</b>");
    }

    #[test]
    fn entities_werden_ersetzt() {
        let ergebnis = filtern("1 &lt; 2 &amp;&amp; 3 &gt; 2", &regeln(false, 100, 0)).unwrap();
        assert_eq!(ergebnis, "1 < 2 && 3 > 2");
    }

    #[test]
    fn zu_lange_nachricht() {
        let lang = "x".repeat(51);
        assert_eq!(
            filtern(&lang, &regeln(true, 50, 0)),
            Err(FilterFehler::ZuLang {
                ist: 51,
                erlaubt: 50
            })
        );
    }

    #[test]
    fn bild_nachricht_nutzt_bild_grenze() {
        let bild = format!("<img src=\"data:image/png;base64,{}\"/>", "A".repeat(100));
        // Ueber der Textgrenze, unter der Bildgrenze
        assert!(filtern(&bild, &regeln(true, 50, 1000)).is_ok());
        // Ueber beiden Grenzen
        assert!(filtern(&bild, &regeln(true, 50, 60)).is_err());
    }

    #[test]
    fn grenze_null_ist_unbegrenzt() {
        let lang = "y".repeat(10_000);
        assert!(filtern(&lang, &regeln(true, 0, 0)).is_ok());
    }
}
