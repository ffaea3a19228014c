//! Server entry point: issue an access key, serve the upload/delete/snapshot
//! API and run the janitor.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use dirsync::server::auth::Auth;
use dirsync::server::blobstore::{BlobStorage, FsStore};
use dirsync::server::emitter::Emitter;
use dirsync::server::handlers::{self, AppState};
use dirsync::server::janitor::Janitor;
use dirsync::server::store::MetadataStore;

#[derive(Debug, Parser)]
#[command(
    name = "dirsync-server",
    about = "Stores mirrored files as blobs addressed by presigned URLs"
)]
struct Options {
    /// Destination directory to store file objects (required)
    #[arg(long)]
    dest_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "localhost:8080")]
    server_addr: String,

    /// Quite output
    #[arg(long)]
    quite: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Options::parse();

    let level = if opts.quite { Level::INFO } else { Level::DEBUG };
    tracing_subscriber::fmt().with_max_level(level).init();

    let Some(dest_dir) = opts.dest_dir.clone() else {
        eprintln!("--dest-dir is required");
        return ExitCode::FAILURE;
    };

    if let Err(err) = run(opts, dest_dir).await {
        error!(error = ?err, "server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(opts: Options, dest_dir: PathBuf) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let auth = Arc::new(Auth::new());
    let key = auth.generate_access_key();
    println!("[!] Use the following access key with your client:");
    println!("  Access Key ID:     {}", key.access_key_id);
    println!("  Access Key Secret: {}", key.secret_key);

    let emitter = Arc::new(Emitter::new());
    let store = Arc::new(MetadataStore::new(emitter.clone()));
    let storage: Arc<dyn BlobStorage> = Arc::new(
        FsStore::new(&dest_dir)
            .await
            .context("initialize blob storage")?,
    );

    let events = emitter
        .take_receiver()
        .context("emitter receiver already taken")?;
    let janitor_storage = storage.clone();
    let janitor_cancel = cancel.clone();
    let janitor = tokio::spawn(async move {
        Janitor::new(janitor_storage).run(janitor_cancel, events).await;
    });

    let state = AppState {
        auth,
        store,
        storage,
        cancel: cancel.clone(),
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&opts.server_addr)
        .await
        .with_context(|| format!("bind {}", opts.server_addr))?;
    info!(addr = %opts.server_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("server failed")?;

    // Let in-flight emits finish before the janitor winds down.
    emitter.close().await;
    let _ = janitor.await;
    Ok(())
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
