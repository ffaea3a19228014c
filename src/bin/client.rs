//! Client entry point: scan the source tree, watch it, index changes and
//! keep reconciling against the server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use dirsync::client::indexer::Indexer;
use dirsync::client::ops::FileOp;
use dirsync::client::rest;
use dirsync::client::syncer::{Credentials, Syncer};
use dirsync::client::walker;
use dirsync::client::watcher::Watcher;
use dirsync::wal::{Entry, Wal};

const SYNC_INTERVAL: Duration = Duration::from_secs(10);
// How long the bootstrap phase waits for watch events recorded during the
// scan before moving on.
const BOOTSTRAP_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(
    name = "dirsync-client",
    about = "Mirrors a local directory tree to a dirsync server"
)]
struct Options {
    /// Source directory to sync its content with the server
    #[arg(long, default_value = ".")]
    src_dir: PathBuf,

    /// Your access key ID as printed by the server (required)
    #[arg(long)]
    aki: Option<String>,

    /// Your secret key as printed by the server (required)
    #[arg(long)]
    secret: Option<String>,

    /// Server address to connect to
    #[arg(long, default_value = "http://localhost:8080")]
    server_addr: String,

    /// Upload endpoint used for generating presigned upload URLs
    #[arg(long, default_value = "/v1/files/upload")]
    upload_endpoint: String,

    /// Quite output
    #[arg(long)]
    quite: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Options::parse();

    let level = if opts.quite { Level::INFO } else { Level::DEBUG };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (Some(aki), Some(secret)) = (opts.aki.clone(), opts.secret.clone()) else {
        eprintln!("--aki and --secret are required; the server prints a key pair on startup");
        return ExitCode::FAILURE;
    };
    let creds = Credentials {
        access_key_id: aki,
        secret_key: secret,
    };

    if let Err(err) = run(opts, creds).await {
        error!(error = ?err, "client failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(opts: Options, creds: Credentials) -> Result<()> {
    let root = opts
        .src_dir
        .canonicalize()
        .context("resolve source directory")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Any pipeline task error lands here and takes the process down.
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);

    let tmp = tempfile::Builder::new()
        .prefix("dirsync")
        .tempdir()
        .context("create temp dir for the logs")?;
    let scan_wal = Arc::new(
        Wal::open(tmp.path().join("scan.wal"))
            .await
            .context("open scan log")?,
    );
    let watch_wal = Arc::new(
        Wal::open(tmp.path().join("watch.wal"))
            .await
            .context("open watch log")?,
    );

    let watcher = Arc::new(Watcher::new(root.clone(), watch_wal.clone()).context("initialize watcher")?);
    {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(cancel).await {
                let _ = err_tx.send(err.context("watcher failed")).await;
            }
        });
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let indexer = Arc::new(Indexer::new(root.clone(), workers));
    {
        let indexer = indexer.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.run(cancel).await {
                let _ = err_tx.send(err.context("indexer pipeline failed")).await;
            }
        });
    }

    // Baseline: walk the tree, then drain the scan log into the index. The
    // log is closed by then, so the drain ends at EOF.
    walker::walk(&root, &watcher, &scan_wal)
        .await
        .context("walk source directory")?;
    scan_wal.close();
    indexer
        .index_wal(&scan_wal, &cancel, |_| false)
        .await
        .context("index baseline records")?;

    // Pick up watch events recorded while the scan was still running
    // (stage 0). Stop at the first post-scan event, which rewinds so the
    // continuous consumer below resumes from it; give up quickly when the
    // tree is quiet.
    let bootstrap_cancel = cancel.child_token();
    let stopper = bootstrap_cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(BOOTSTRAP_DRAIN).await;
        stopper.cancel();
    });
    let past_baseline = |entry: &Entry| {
        serde_json::from_slice::<FileOp>(&entry.bytes)
            .map(|op| op.stage > 0)
            .unwrap_or(false)
    };
    indexer
        .index_wal(&watch_wal, &bootstrap_cancel, past_baseline)
        .await
        .context("index watch events recorded during the scan")?;
    indexer.wait_idle().await;
    info!("baseline index ready");

    // From here on the watch log is tailed continuously.
    {
        let indexer = indexer.clone();
        let watch_wal = watch_wal.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.index_wal(&watch_wal, &cancel, |_| false).await {
                let _ = err_tx.send(err.context("watch log indexing failed")).await;
            }
        });
    }

    let client = rest::Client::new(&opts.server_addr, &opts.upload_endpoint)
        .context("initialize rest client")?;
    let syncer = Syncer::new(client, creds, root, workers, SYNC_INTERVAL);
    {
        let indexer = indexer.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = syncer.run(cancel, indexer).await {
                let _ = err_tx.send(err.context("sync failed")).await;
            }
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        Some(err) = err_rx.recv() => {
            cancel.cancel();
            Err(err)
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!(error = %err, "could not install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
