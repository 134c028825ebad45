//! Netron CLI: run a hub, ping a runtime, list its contexts, watch its events.

mod cli;

use crate::cli::*;
use anyhow::Context as _;
use clap::Parser;
use netron_kernel::config::load_config;
use netron_kernel::{Netron, RemoteHandler};
use netron_types::config::NetronConfig;
use netron_types::event::NetronEvent;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Listen address for `netron hub` when neither the flag nor the config sets one.
const DEFAULT_LISTEN: &str = "127.0.0.1:8470";

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };
    let config = load_config(cli.config.as_deref());

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Hub { listen } => cmd_hub(config, listen).await,
            Commands::Ping { addr } => cmd_ping(config, &addr).await,
            Commands::Contexts { addr, json } => cmd_contexts(config, &addr, json).await,
            Commands::Watch { addr, events } => cmd_watch(config, &addr, events).await,
        }
    });
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn cmd_hub(mut config: NetronConfig, listen: Option<String>) -> anyhow::Result<()> {
    config.is_super = true;
    let listen = listen
        .or_else(|| config.listen_addr.map(|a| a.to_string()))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let netron = Netron::new(config);
    let addr = netron
        .bind(Some(&listen))
        .await
        .with_context(|| format!("cannot listen on {listen}"))?;
    println!("Hub {} listening on {addr}", netron.uid());

    let mut events = netron.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    netron.shutdown().await;
    Ok(())
}

fn log_event(event: &NetronEvent) {
    match event {
        NetronEvent::PeerOnline { uid, .. } => info!(uid = %uid, "peer joined"),
        NetronEvent::PeerOffline { uid, .. } => info!(uid = ?uid, "peer left"),
        NetronEvent::ContextAttach { definition, origin } => {
            info!(context = %definition.name, origin = ?origin, "context available")
        }
        NetronEvent::ContextDetach { name, origin, .. } => {
            info!(context = %name, origin = ?origin, "context gone")
        }
        other => tracing::debug!(event = other.kind(), "event"),
    }
}

/// Client runtime for one-shot commands.
fn client(mut config: NetronConfig) -> Arc<Netron> {
    config.is_super = false;
    config.uid = None;
    Netron::new(config)
}

async fn cmd_ping(config: NetronConfig, addr: &str) -> anyhow::Result<()> {
    let netron = client(config);
    let peer = netron.connect(addr).await?;
    let uid = peer.uid().context("peer has no uid after handshake")?;

    let started = Instant::now();
    netron.ping(Some(&uid)).await?;
    let rtt = started.elapsed();
    println!("{uid} at {addr}: {:.2} ms", rtt.as_secs_f64() * 1000.0);

    netron.shutdown().await;
    Ok(())
}

async fn cmd_contexts(config: NetronConfig, addr: &str, json: bool) -> anyhow::Result<()> {
    let netron = client(config);
    let peer = netron.connect(addr).await?;
    let mut definitions = peer.definitions();
    definitions.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
    } else if definitions.is_empty() {
        println!("No contexts exposed.");
    } else {
        for definition in &definitions {
            println!("{} (id {})", definition.name, definition.id);
            for method in &definition.methods {
                println!("  fn   {method}");
            }
            for property in &definition.properties {
                let mode = if property.readonly { "ro" } else { "rw" };
                println!("  {mode}   {}", property.name);
            }
        }
    }

    netron.shutdown().await;
    Ok(())
}

async fn cmd_watch(config: NetronConfig, addr: &str, events: Vec<String>) -> anyhow::Result<()> {
    let netron = client(config);
    let peer = netron.connect(addr).await?;
    let uid = peer.uid().context("peer has no uid after handshake")?;

    let events = if events.is_empty() {
        NetronEvent::KINDS.iter().map(|e| e.to_string()).collect()
    } else {
        events
    };
    let print: RemoteHandler = Arc::new(|_: &str, event: &NetronEvent| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("cannot encode event: {e}"),
        }
    });
    for event in &events {
        netron
            .on_remote(Some(&uid), event, Arc::clone(&print))
            .await
            .with_context(|| format!("cannot follow '{event}'"))?;
    }
    info!(uid = %uid, count = events.len(), "watching events");

    let mut local = netron.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = local.recv() => match event {
                Ok(NetronEvent::PeerOffline { uid: Some(gone), .. }) if gone == uid => {
                    warn!(uid = %uid, "runtime went away");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    netron.shutdown().await;
    Ok(())
}
