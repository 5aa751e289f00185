#[macro_use]
extern crate log;

mod aggregator;
mod args;
mod bitcoin;
mod calendar;
mod http_utils;
mod index;
mod journal;
mod logger;
mod merkle;
mod server;
mod stamper;

use anyhow::{bail, Context, Result};
use clap_complete::Shell;
use rand::Rng;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::aggregator::Aggregator;
use crate::args::{build_cli, Args};
use crate::bitcoin::rpc::{BitcoinRpc, CoreRpc};
use crate::calendar::Calendar;
use crate::server::Server;
use crate::stamper::{Stamper, StamperConfig};

const STAMPER_POLL_INTERVAL: Duration = Duration::from_secs(30);
const STAMPER_BUMP_AFTER: Duration = Duration::from_secs(1800);
const STAMPER_BROADCAST_ATTEMPTS: u32 = 6;

fn main() {
    let matches = build_cli().get_matches();
    if let Some(shell) = matches.get_one::<Shell>("completions") {
        let mut cmd = build_cli();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    let args = match Args::parse(matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    };
    if logger::init().is_err() {
        eprintln!("error: failed to install the logger");
        process::exit(1);
    }
    if let Err(e) = run(args) {
        error!("{e:#}");
        process::exit(1);
    }
}

/// Per-calendar files living next to the journal and index.
struct CalendarFiles {
    uri: String,
    hmac_key: Vec<u8>,
    donation_addr: Option<String>,
}

fn prepare_calendar_dir(dir: &Path) -> Result<CalendarFiles> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create calendar directory {}", dir.display()))?;

    let uri_path = dir.join("uri");
    let uri = fs::read_to_string(&uri_path)
        .with_context(|| {
            format!("missing {}; write this calendar's public URI into it", uri_path.display())
        })?
        .trim()
        .to_string();
    if uri.is_empty() {
        bail!("{} is empty; it must hold this calendar's public URI", uri_path.display());
    }

    let key_path = dir.join("hmac-key");
    let hmac_key = if key_path.exists() {
        let key = fs::read(&key_path)?;
        if key.len() != 32 {
            bail!("{} must hold exactly 32 bytes", key_path.display());
        }
        key
    } else {
        let key: [u8; 32] = rand::thread_rng().gen();
        fs::write(&key_path, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        info!("generated new hmac key at {}", key_path.display());
        key.to_vec()
    };

    let donation_addr = fs::read_to_string(dir.join("donation_addr"))
        .ok()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty());

    Ok(CalendarFiles { uri, hmac_key, donation_addr })
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let files = prepare_calendar_dir(&args.calendar_dir)?;
    let calendar = Arc::new(Calendar::open(&args.calendar_dir)?);
    let stats = calendar.stats();
    info!(
        "calendar opened: {} commitments, {} awaiting anchor",
        stats.commitments, stats.unconfirmed
    );

    let rpc = CoreRpc::new(args.rpc_url.clone(), args.rpc_user.clone(), args.rpc_password.clone())?;
    let chain_info = rpc
        .chain_info()
        .await
        .with_context(|| format!("node at {} is unreachable", args.rpc_url))?;
    if chain_info.chain != args.chain.core_name() {
        bail!(
            "node is on chain \"{}\" but the calendar is configured for \"{}\"",
            chain_info.chain,
            args.chain.core_name()
        );
    }
    info!("connected to node on {} at height {}", chain_info.chain, chain_info.blocks);

    let running = Arc::new(AtomicBool::new(true));
    let aggregator =
        Arc::new(Aggregator::new(calendar.clone(), files.uri.clone(), args.buffer_cap));
    let server = Arc::new(Server::new(
        aggregator.clone(),
        calendar.clone(),
        files.uri.clone(),
        files.donation_addr.clone(),
        &files.hmac_key,
    ));
    let stamper = Stamper::new(
        rpc,
        calendar.clone(),
        StamperConfig {
            anchor_interval: args.anchor_interval,
            poll_interval: STAMPER_POLL_INTERVAL,
            bump_after: STAMPER_BUMP_AFTER,
            min_relay_feerate: args.min_relay_feerate,
            max_fee: args.max_fee,
            conf_target: args.conf_target,
            confirmations: args.confirmations,
            broadcast_attempts: STAMPER_BROADCAST_ATTEMPTS,
        },
    );

    let listener = TcpListener::bind((args.bind, args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.bind, args.port))?;
    info!("listening on {}:{} as {}", args.bind, args.port, files.uri);

    let round_task = tokio::spawn(aggregator.clone().run(args.round_interval, running.clone()));
    let stamper_running = running.clone();
    let stamper_task = tokio::spawn(async move { stamper.run(stamper_running).await });
    let serve_task = tokio::spawn(server::serve(server, listener));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            running.store(false, Ordering::Relaxed);
            Ok(())
        }
        result = round_task => {
            result.context("round closer panicked")??;
            bail!("round closer exited unexpectedly");
        }
        result = stamper_task => {
            result.context("stamper panicked")??;
            bail!("stamper exited unexpectedly");
        }
        result = serve_task => {
            result.context("server panicked")??;
            bail!("server exited unexpectedly");
        }
    }
}
