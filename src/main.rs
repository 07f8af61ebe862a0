//! Mihomo Groups - CLI Entry Point
//!
//! Loads a configuration, builds every proxy group and keeps providers and
//! health checks running until Ctrl-C. Go-style single-dash long options
//! (`-config`, `-test`) are accepted alongside the standard form.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use mihomo_groups::proxy::ProxyGroup;
use mihomo_groups::{Config, OutboundManager, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Go-style long options that clap only knows with a double dash
const GO_STYLE_LONG_OPTIONS: &[&str] = &["-config", "-directory", "-test", "-status"];

fn normalize_args() -> Vec<String> {
    std::env::args()
        .map(|arg| {
            if GO_STYLE_LONG_OPTIONS.contains(&arg.as_str()) {
                return format!("-{}", arg);
            }
            arg
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(name = "mihomo-groups")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Proxy group selection and health monitoring")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Configuration directory
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Seconds between status dumps; 0 disables them
    #[arg(short = 's', long = "status", default_value_t = 0)]
    status: u64,
}

fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("mihomo-groups")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse_from(normalize_args());

    if let Some(ref dir) = args.directory {
        if dir.is_dir() {
            std::env::set_current_dir(dir)?;
        }
    }

    let config = match Config::load_async(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("mihomo_groups={}", config.log_level).parse()?),
        )
        .init();

    info!("Mihomo Groups v{}", VERSION);
    info!("Configuration loaded from {}", args.config.display());

    if args.test {
        if let Err(e) = OutboundManager::verify(&config).await {
            error!("Configuration test failed: {}", e);
            std::process::exit(1);
        }
        info!("Configuration test passed");
        return Ok(());
    }

    let manager = match OutboundManager::new(&config).await {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to build proxy groups: {}", e);
            std::process::exit(1);
        }
    };

    if args.status > 0 {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.status));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    for group in manager.groups() {
                        info!("{}", group.to_json());
                    }
                }
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Received shutdown signal");
    manager.close().await;
    Ok(())
}
