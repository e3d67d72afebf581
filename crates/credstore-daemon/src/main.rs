//! credstored: watches key sources and keeps the encrypted credential
//! store's availability in sync with the keys present on the system.

mod keys;

use anyhow::Context;
use clap::Parser;
use credstore_core::access_manager::PendingAuthorization;
use credstore_core::config::{CredstoreConfig, DEFAULT_CONFIG_PATH};
use credstore_core::logging;
use credstore_core::registry::PluginRegistry;
use credstore_core::CredentialsAccessManager;
use credstore_provider::{Key, KeyDecision, KeyEventReporter, KeyManager};
use keys::FileKeyManager;
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "credstored", about = "Credential storage daemon")]
struct Args {
    /// Configuration file (TOML or YAML).
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("info");

    let config = CredstoreConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    for issue in config.validate() {
        warn!("configuration: {issue}");
    }

    let mut registry = PluginRegistry::with_builtins();
    credstore_luks::register(&mut registry);

    let mut cam = CredentialsAccessManager::new(config.clone(), &registry)
        .context("failed to construct credentials access manager")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut key_manager = FileKeyManager::from_config(&config);
    let manager_name = key_manager.name().to_string();
    key_manager
        .setup(KeyEventReporter::new(manager_name.clone(), event_tx))
        .context("failed to start file key manager")?;

    cam.initialize([manager_name])
        .context("failed to initialize credentials access manager")?;
    info!("credstored running; store path {}", config.storage_dir().display());

    let (decision_tx, mut decision_rx) = mpsc::unbounded_channel::<(Key, KeyDecision)>();

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else {
                    warn!("key event channel closed");
                    break;
                };
                match cam.handle_key_event(event) {
                    Ok(Some(PendingAuthorization { key, ticket })) => {
                        let tx = decision_tx.clone();
                        tokio::spawn(async move {
                            let decision = ticket.decision().await;
                            let _ = tx.send((key, decision));
                        });
                    }
                    Ok(None) => {}
                    Err(err) => error!("key event handling failed: {err}"),
                }
            }
            maybe_decision = decision_rx.recv() => {
                if let Some((key, decision)) = maybe_decision {
                    if let Err(err) = cam.handle_authorization_decision(&key, decision) {
                        error!("applying authorization decision failed: {err}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    cam.shutdown().context("shutdown failed")?;
    Ok(())
}
