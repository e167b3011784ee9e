//! macvm: run a macOS guest from the command line.
//!
//! Batch mode: resolve the bundle, acquire a restore image, optionally
//! install, then boot and stay attached until the guest stops or Ctrl-C
//! requests a graceful stop.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use macvm::config::{EngineKind, Settings};
use macvm::engine::Hypervisor;
use macvm::engine::vfkit::VfkitHypervisor;
use macvm::logging;
use macvm::paths::MacvmPaths;
use macvm::vm::catalog::IpswCatalog;
use macvm::vm::download::HttpTransport;
use macvm::vm::{LifecycleState, Orchestrator, Services};

/// macOS guest VM manager
#[derive(Parser, Debug)]
#[command(name = "macvm", version, about = "Acquire, install and run a macOS guest VM")]
struct Args {
    /// Install the guest before starting it
    #[arg(long)]
    install: bool,

    /// Bundle directory (defaults to ~/MacVM.bundle or the configured root)
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Settings file (defaults to ~/.config/macvm/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use a local restore image instead of downloading one
    #[arg(long)]
    image: Option<PathBuf>,

    /// Virtualization engine
    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    /// Print the bundle status and exit
    #[arg(long)]
    status: bool,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = MacvmPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(&paths.logs);

    let config_path = match &args.config {
        Some(path) => paths.expand_tilde(path),
        None => paths.config_file(),
    };
    let settings = Settings::load(&config_path)?;
    if args.print_config {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let result = runtime.block_on(run(args, settings, paths));

    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    result
}

async fn run(args: Args, settings: Settings, paths: MacvmPaths) -> Result<()> {
    let root = match &args.bundle {
        Some(path) => paths.expand_tilde(path),
        None => settings.bundle_root(&paths),
    };

    let kind = args.engine.unwrap_or(settings.engine.kind);
    let hypervisor: Arc<dyn Hypervisor> = match kind {
        EngineKind::Vfkit => Arc::new(
            VfkitHypervisor::new(settings.vfkit_options(&paths))
                .context("vfkit engine is not available on this host")?,
        ),
        EngineKind::Simulated => Arc::new(settings.simulated_engine()),
    };
    let services = Services {
        catalog: Arc::new(IpswCatalog::new(settings.catalog_url()?)?),
        transport: Arc::new(HttpTransport::new()?),
        hypervisor,
    };

    println!("macvm v{}", env!("CARGO_PKG_VERSION"));
    println!("Bundle: {}", root.display());

    let orchestrator = Orchestrator::spawn(root, settings.policy_for(kind), services);
    spawn_log_printer(&orchestrator);

    let status = orchestrator.check_status().await?;
    if args.status {
        println!("Image present: {}", status.has_image);
        println!("Installed:     {}", status.is_installed);
        println!("State:         {}", status.state);
        return Ok(());
    }

    let result = drive(&orchestrator, &args).await;
    orchestrator.shutdown().await;
    result
}

/// Acquire, optionally install, start, then wait for the guest to stop.
async fn drive(orchestrator: &Orchestrator, args: &Args) -> Result<()> {
    match &args.image {
        Some(image) => {
            orchestrator.import_image(image).await?;
        }
        None => {
            let stream = orchestrator.acquire_image().await?;
            stream
                .for_each_progress(|f| print_progress("Downloading", f))
                .await?;
            println!();
        }
    }

    if args.install {
        let stream = orchestrator.install().await?;
        stream
            .for_each_progress(|f| print_progress("Installing", f))
            .await?;
        println!();
    } else if !orchestrator.check_status().await?.is_installed {
        bail!("the VM is not installed yet; run again with --install");
    }

    orchestrator.start().await?;
    println!("VM running. Press Ctrl-C to stop.");

    let mut state = orchestrator.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for Ctrl-C")?;
                println!("Stopping VM...");
                orchestrator.stop().await?;
                return Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = state.borrow_and_update().clone();
                match current {
                    LifecycleState::Stopped => return Ok(()),
                    LifecycleState::Failed(reason) => bail!("VM failed: {reason}"),
                    _ => {}
                }
            }
        }
    }
}

fn spawn_log_printer(orchestrator: &Orchestrator) {
    let mut lines = orchestrator.logs().subscribe();
    tokio::spawn(async move {
        loop {
            match lines.recv().await {
                Ok(line) => println!("{line}"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    });
}

fn print_progress(label: &str, fraction: f64) {
    print!("\r{label}: {:>3.0}%", fraction * 100.0);
    let _ = std::io::stdout().flush();
}
