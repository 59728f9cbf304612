//! Telecrypt node: sends encrypted telemetry to a peer, or receives and stores it.
//!
//! # Usage
//!
//! ```bash
//! # Receive into ./received, restarting on fatal errors via systemd
//! telecrypt-node --config node.toml receive
//!
//! # Send one reading every 2 s to a registered peer
//! telecrypt-node --config node.toml send --peer 84:F3:EB:05:50:B7 \
//!     --message "30.80,73.80" --repeat 0 --interval-ms 2000
//! ```

mod config;
mod link;
mod storage;

use std::future::Future;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use telecrypt_core::{delivery_channel, Delivery, LinkAddr, Receiver, Sender, Storage};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::link::{LinkEvents, UdpLink};
use crate::storage::FileStorage;

/// Encrypted telemetry node
#[derive(Parser, Debug)]
#[command(name = "telecrypt-node")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the UDP bind address
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt and send a message to a registered peer
    Send {
        /// Destination link address, e.g. 84:F3:EB:05:50:B7
        #[arg(long)]
        peer: LinkAddr,

        /// Message text; otherwise read from --file or stdin
        #[arg(short, long, conflicts_with = "file")]
        message: Option<String>,

        /// Read the message from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Number of sends; 0 repeats until interrupted
        #[arg(long, default_value_t = 1)]
        repeat: u64,

        /// Pause between repeated sends
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Receive, decrypt and store messages
    Receive {
        /// Override the storage directory
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    tracing::info!(
        address = %cfg.address,
        bind = %cfg.bind,
        cipher = %cfg.link.cipher,
        framing = ?cfg.link.framing,
        "telecrypt node starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match args.command {
            Command::Send {
                peer,
                message,
                file,
                repeat,
                interval_ms,
            } => {
                let body = read_message(message, file)?;
                tokio::select! {
                    r = run_send(&cfg, peer, body, repeat, Duration::from_millis(interval_ms)) => r,
                    r = shutdown_signal() => r,
                }
            }
            Command::Receive { storage_dir } => {
                if let Some(dir) = storage_dir {
                    cfg.storage_dir = dir;
                }
                run_receive(&cfg).await
            }
        }
    })
}

fn read_message(message: Option<String>, file: Option<PathBuf>) -> anyhow::Result<Vec<u8>> {
    if let Some(m) = message {
        return Ok(m.into_bytes());
    }
    if let Some(path) = file {
        return std::fs::read(&path).with_context(|| format!("reading {}", path.display()));
    }
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

async fn run_send(
    cfg: &config::Config,
    peer: LinkAddr,
    body: Vec<u8>,
    repeat: u64,
    interval: Duration,
) -> anyhow::Result<()> {
    if cfg.peer(&peer).is_none() {
        bail!("peer {peer} is not registered in [[peers]]");
    }
    let link = UdpLink::bind(cfg.bind, cfg.address, &cfg.peers, cfg.link.mtu)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    tracing::info!(socket = %link.local_addr()?, address = %link.address(), "link up");
    let listener = link.clone();
    let sender = Sender::new(&cfg.link, link, peer);
    let mut link_task = tokio::spawn(listener.run(LinkEvents {
        acks: Some(sender.ack_handle()),
        deliveries: None,
    }));

    tokio::select! {
        r = send_loop(&sender, &body, repeat, interval) => {
            link_task.abort();
            r
        }
        joined = &mut link_task => Err(link_stopped(joined)),
    }
}

async fn send_loop(
    sender: &Sender<UdpLink>,
    body: &[u8],
    repeat: u64,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut sent = 0u64;
    let mut failed = 0u64;
    loop {
        match sender.send_message(body).await {
            Ok(report) => {
                sent += 1;
                tracing::info!(
                    frames = report.frames,
                    ciphertext_len = report.ciphertext_len,
                    encrypt_us = report.encrypt_elapsed.as_micros() as u64,
                    "send ok"
                );
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "send failed");
            }
        }
        if repeat != 0 && sent + failed >= repeat {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    tracing::info!(sent, failed, "done");
    if failed > 0 && sent == 0 {
        bail!("no message was delivered");
    }
    Ok(())
}

async fn run_receive(cfg: &config::Config) -> anyhow::Result<()> {
    let storage = FileStorage::open(&cfg.storage_dir, cfg.storage_prefix.as_str())
        .with_context(|| format!("opening storage {}", cfg.storage_dir.display()))?;
    let link = UdpLink::bind(cfg.bind, cfg.address, &cfg.peers, cfg.link.mtu)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    tracing::info!(socket = %link.local_addr()?, address = %link.address(), "listening");

    let (deliveries, mut queue) = delivery_channel(telecrypt_core::transport::DEFAULT_DELIVERY_QUEUE);
    let link_task = tokio::spawn(link.run(LinkEvents {
        acks: None,
        deliveries: Some(deliveries),
    }));

    let mut receiver = Receiver::new(&cfg.link, storage);
    receive_until(&mut receiver, &mut queue, link_task, shutdown_signal()).await
}

/// Drive `receiver` until the link ends, `shutdown` resolves, or a fatal error.
///
/// The queue only closes once the link task is gone, so the receiver always
/// gets to flush a partial message. Any way out other than `shutdown` is an
/// error, which makes the service manager restart the node.
async fn receive_until<S: Storage>(
    receiver: &mut Receiver<S>,
    queue: &mut mpsc::Receiver<Delivery>,
    link_task: JoinHandle<io::Result<()>>,
    shutdown: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let receiving = receiver.run(queue);
    tokio::pin!(receiving);
    tokio::pin!(shutdown);

    let finished = tokio::select! {
        r = &mut receiving => Some(r),
        r = &mut shutdown => {
            r?;
            None
        }
    };
    let received = match finished {
        Some(r) => r,
        None => {
            link_task.abort();
            receiving.await
        }
    };
    if let Err(e) = received {
        link_task.abort();
        return Err(anyhow::Error::new(e).context("receiver stopped"));
    }
    match link_task.await {
        Err(e) if e.is_cancelled() => Ok(()),
        joined => Err(link_stopped(joined)),
    }
}

fn link_stopped(joined: Result<io::Result<()>, JoinError>) -> anyhow::Error {
    match joined {
        Ok(Ok(())) => anyhow::anyhow!("link stopped"),
        Ok(Err(e)) => anyhow::Error::new(e).context("link failed"),
        Err(e) => anyhow::Error::new(e).context("link task failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
