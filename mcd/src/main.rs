//! # MCD — motion-control link daemon
//!
//! Startup sequencing: parse flags, load configuration, install logging,
//! open the hardware link, wire the `Supervisor`'s components to the
//! transfer engine's inbound/outbound channels, and run until the link is
//! lost or a signal asks for a clean shutdown.

mod codesource;
mod command_line;
mod config;
mod hardware;
mod plugins;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mc_core::{DispatchOutcome, Response, Supervisor};
use mc_transfer::{spawn_cycle_thread, TransferConfig, TransferEngine};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "mcd", about = "SBC-side motion-control link daemon")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(long, default_value = "/etc/mcd/mcd.toml")]
  config: PathBuf,

  /// Overrides `spi_device` from the config file.
  #[arg(long)]
  spi_device: Option<String>,

  #[arg(long)]
  sbc_ready_gpio: Option<u32>,

  #[arg(long)]
  firmware_ready_gpio: Option<u32>,

  #[arg(long)]
  direction_gpio: Option<u32>,

  #[arg(long)]
  plugin_list_path: Option<String>,

  /// Overrides `macro_dir` from the config file — the directory macro
  /// and job files are resolved against.
  #[arg(long)]
  macro_dir: Option<String>,
}

const EGRESS_BYTE_BUDGET: u32 = mc_proto::header::DEFAULT_BODY_CAP as u32;
const IDLE_POLL: Duration = Duration::from_millis(20);

fn main() -> ExitCode {
  let cli = Cli::parse();
  tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_env("MCD_LOG").unwrap_or_else(|_| EnvFilter::new("info"))).init();

  let config = match Config::load(&cli.config, &cli) {
    Ok(config) => config,
    Err(err) => {
      tracing::error!(error = %err, "startup configuration error");
      return ExitCode::from(2);
    }
  };

  match run(config) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      tracing::error!(error = %err, "fatal error, shutting down");
      ExitCode::FAILURE
    }
  }
}

fn run(config: Config) -> anyhow::Result<()> {
  let enabled_plugins = plugins::load(&config.plugin_list_path)?;
  tracing::info!(count = enabled_plugins.len(), "loaded plugin list");

  let spi = hardware::LinuxSpiBus::open(config.spi_device.to_str().unwrap_or_default(), 1_000_000)
    .map_err(|err| anyhow::anyhow!("failed to open SPI device {:?}: {err}", config.spi_device))?;
  let lines = hardware::GpioLinkLines::open(config.sbc_ready_gpio, config.firmware_ready_gpio, config.direction_gpio)
    .map_err(|err| anyhow::anyhow!("failed to export handshake GPIO lines: {err}"))?;

  let transfer_config = TransferConfig {
    handshake_timeout: config.handshake_timeout,
    resync_hold: config.resync_hold,
    body_cap: config.body_cap,
    ..TransferConfig::default()
  };
  let engine = TransferEngine::new(lines, spi, transfer_config);

  let (outbound_tx, outbound_rx) = mpsc::channel();
  let (inbound_tx, inbound_rx) = mpsc::channel();
  let (fatal_tx, fatal_rx) = mpsc::channel();
  let cycle_thread = spawn_cycle_thread(engine, outbound_rx, inbound_tx, fatal_tx, IDLE_POLL);

  let file_opener = Arc::new(codesource::FsFileOpener::new(config.macro_dir.clone()));
  let mut supervisor = Supervisor::with_file_opener(file_opener);

  let command_rx = command_line::spawn_stdin_reader();
  let mut pending_replies: Vec<(mc_core::PendingCode, mpsc::Sender<Response>)> = Vec::new();

  let shutdown_requested = Arc::new(AtomicBool::new(false));
  {
    let flag = Arc::clone(&shutdown_requested);
    ctrlc::set_handler(move || flag.store(true, Ordering::Release)).ok();
  }

  let result = (|| -> anyhow::Result<()> {
    loop {
      if shutdown_requested.load(Ordering::Acquire) {
        tracing::info!("shutdown requested, draining in-flight work");
        break;
      }
      match fatal_rx.try_recv() {
        Ok(error) => anyhow::bail!("transfer link lost: {error}"),
        Err(mpsc::TryRecvError::Empty) => {}
        Err(mpsc::TryRecvError::Disconnected) => anyhow::bail!("transfer cycle thread exited unexpectedly"),
      }

      for (command, reply_tx) in command_rx.try_iter() {
        match supervisor.dispatch(command) {
          DispatchOutcome::Ready(response) => {
            let _ = reply_tx.send(response);
          }
          DispatchOutcome::Deferred(pending) => pending_replies.push((pending, reply_tx)),
        }
      }
      pending_replies.retain(|(pending, reply_tx)| match mc_core::poll_deferred(pending) {
        Some(response) => {
          let _ = reply_tx.send(response);
          false
        }
        None => true,
      });

      match inbound_rx.recv_timeout(IDLE_POLL) {
        Ok(packets) => {
          for packet in &packets {
            if let Err(err) = supervisor.router.dispatch_inbound(packet) {
              tracing::warn!(error = %err, "dropping malformed inbound packet");
            }
          }
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {}
        Err(mpsc::RecvTimeoutError::Disconnected) => anyhow::bail!("transfer cycle thread exited unexpectedly"),
      }

      let outbound = supervisor.router.pull_egress(EGRESS_BYTE_BUDGET);
      if !outbound.is_empty() && outbound_tx.send(outbound).is_err() {
        anyhow::bail!("transfer cycle thread exited unexpectedly");
      }
    }
    Ok(())
  })();

  supervisor.shutdown();
  drop(outbound_tx);
  let _ = cycle_thread.join();

  if let Err(err) = plugins::save(&config.plugin_list_path, &enabled_plugins) {
    tracing::warn!(error = %err, "failed to persist plugin list on shutdown");
  }

  result
}
