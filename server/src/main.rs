//! Raunen – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet den
//! Server. Mit gesetztem `RAUNEN_SUPW` wird beim Start das
//! SuperUser-Passwort neu gesetzt.

use anyhow::Result;
use raunen_server::{config::ServerConfig, server::Server};

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("RAUNEN_CONFIG").unwrap_or_else(|_| "raunen.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let config = ServerConfig::laden(&config_pfad)?;

    // Logging initialisieren
    logging_initialisieren(&config.logging.level, &config.logging.format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Raunen wird initialisiert"
    );

    let mut server = Server::aus_config(&config);

    // SuperUser-Passwort aus der Umgebung setzen (einmalige Verwaltung)
    if let Ok(passwort) = std::env::var("RAUNEN_SUPW") {
        if !passwort.is_empty() {
            server.superuser_passwort_setzen(&passwort);
            tracing::info!("SuperUser-Passwort aus RAUNEN_SUPW gesetzt");
        }
    }

    server.starten(&config).await?;

    Ok(())
}

/// Initialisiert tracing-subscriber mit dem konfigurierten Level und Format
fn logging_initialisieren(level: &str, format: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
}
