//! Operationslog und Abbild-Dateien
//!
//! Das Protokoll ist eine JSON-Zeilen-Datei (`protokoll.jsonl`), das
//! Abbild eine einzelne JSON-Datei (`abbild.json`). Abbilder werden ueber
//! eine Temporaerdatei plus Umbenennen atomar geschrieben. Beim Lesen
//! eines Protokolls bricht eine unvollstaendige letzte Zeile (Absturz
//! beim Schreiben) das Abspielen ab statt den Start zu verhindern.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::abbild::{Abbild, Operation};
use crate::error::FreezerResult;

/// Dateiname des Voll-Abbilds
pub const ABBILD_DATEI: &str = "abbild.json";

/// Dateiname des Operationslogs
pub const PROTOKOLL_DATEI: &str = "protokoll.jsonl";

// ---------------------------------------------------------------------------
// Protokoll
// ---------------------------------------------------------------------------

/// Ein offenes, frisches Operationslog
pub struct Protokoll {
    datei: File,
    pfad: PathBuf,
}

impl Protokoll {
    /// Oeffnet ein frisches (leeres) Protokoll im Datenverzeichnis
    ///
    /// Der Aufrufer muss den Zustand zuvor als Abbild gesichert haben,
    /// sonst gehen die bisherigen Protokoll-Eintraege verloren.
    pub fn oeffnen(verzeichnis: &Path) -> FreezerResult<Self> {
        std::fs::create_dir_all(verzeichnis)?;
        let pfad = verzeichnis.join(PROTOKOLL_DATEI);
        let datei = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&pfad)?;
        tracing::debug!(pfad = %pfad.display(), "Frisches Operationslog geoeffnet");
        Ok(Self { datei, pfad })
    }

    /// Haengt eine Operation als JSON-Zeile an und flusht
    pub fn anhaengen(&mut self, op: &Operation) -> FreezerResult<()> {
        let mut zeile = serde_json::to_vec(op)?;
        zeile.push(b'\n');
        self.datei.write_all(&zeile)?;
        self.datei.flush()?;
        Ok(())
    }

    /// Pfad der Protokolldatei
    pub fn pfad(&self) -> &Path {
        &self.pfad
    }
}

// ---------------------------------------------------------------------------
// Abbild-Dateien
// ---------------------------------------------------------------------------

/// Schreibt ein Abbild atomar (Temporaerdatei + Umbenennen)
pub fn abbild_schreiben(verzeichnis: &Path, abbild: &Abbild) -> FreezerResult<()> {
    std::fs::create_dir_all(verzeichnis)?;
    let ziel = verzeichnis.join(ABBILD_DATEI);
    let temporaer = verzeichnis.join(format!("{ABBILD_DATEI}.neu"));

    let json = serde_json::to_vec_pretty(abbild)?;
    std::fs::write(&temporaer, json)?;
    std::fs::rename(&temporaer, &ziel)?;

    tracing::info!(
        pfad = %ziel.display(),
        kanaele = abbild.kanaele.len(),
        benutzer = abbild.benutzer.len(),
        "Voll-Abbild geschrieben"
    );
    Ok(())
}

/// Liest das Abbild; `None` wenn noch keines existiert
pub fn abbild_lesen(verzeichnis: &Path) -> FreezerResult<Option<Abbild>> {
    let pfad = verzeichnis.join(ABBILD_DATEI);
    match std::fs::read(&pfad) {
        Ok(inhalt) => Ok(Some(serde_json::from_slice(&inhalt)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Liest alle Operationen aus dem Protokoll
///
/// Eine unvollstaendige letzte Zeile beendet das Lesen mit einer Warnung.
pub fn protokoll_lesen(verzeichnis: &Path) -> FreezerResult<Vec<Operation>> {
    let pfad = verzeichnis.join(PROTOKOLL_DATEI);
    let datei = match File::open(&pfad) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut operationen = Vec::new();
    for (nummer, zeile) in BufReader::new(datei).lines().enumerate() {
        let zeile = zeile?;
        if zeile.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Operation>(&zeile) {
            Ok(op) => operationen.push(op),
            Err(e) => {
                tracing::warn!(
                    zeile = nummer + 1,
                    fehler = %e,
                    "Abgeschnittener Protokoll-Eintrag, Abspielen endet hier"
                );
                break;
            }
        }
    }
    Ok(operationen)
}

/// Stellt den Zustand beim Start wieder her: Abbild laden, Protokoll
/// darueber abspielen
///
/// Gibt das resultierende Abbild zurueck; ohne vorhandene Dateien ein
/// leeres.
pub fn wiederherstellen(verzeichnis: &Path) -> FreezerResult<Abbild> {
    let mut abbild = abbild_lesen(verzeichnis)?.unwrap_or_default();
    let operationen = protokoll_lesen(verzeichnis)?;
    let anzahl = operationen.len();

    for op in operationen {
        abbild.anwenden(op);
    }

    if anzahl > 0 {
        tracing::info!(operationen = anzahl, "Operationslog abgespielt");
    }
    Ok(abbild)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
