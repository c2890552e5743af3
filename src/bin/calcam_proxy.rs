//! calcam_proxy - credential-holding relay for the calorie camera.
//!
//! This daemon:
//! 1. Reads the upstream credential from its own environment
//! 2. Serves POST /analyze and POST /explain, relaying to the upstream
//!    generative API
//! 3. Never exposes the credential to clients

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use calorie_camera::{ProxySettings, ProxyServer};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let api_key = std::env::var("GOOGLE_API_KEY")
        .map_err(|_| anyhow!("GOOGLE_API_KEY must be set in the proxy environment"))?;
    let settings = ProxySettings::load()?;

    let handle = ProxyServer::new(settings, api_key).spawn()?;
    log::info!("proxy endpoint listening on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("calcam_proxy waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping proxy...");
    handle.stop()?;

    Ok(())
}
