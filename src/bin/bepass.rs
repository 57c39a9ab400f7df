//! bepass gateway binary
//!
//! Usage: bepass [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (TOML, or JSON by extension)
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use bepass::server::{Server, ServerConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"bepass - local SOCKS gateway with Client Hello fragmentation

USAGE:
    bepass [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration:
        bepass --generate > bepass.toml

    Run the gateway:
        bepass --config bepass.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = ServerConfigFile::default();

    println!("# bepass configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config_file = ServerConfigFile::load(config_path).map_err(|e: String| anyhow::anyhow!(e))?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    tracing::info!("Starting bepass on {}", config.bind_address);
    tracing::info!("Resolver: {}", config.remote_dns_addr);
    if config.relay_enabled() {
        tracing::info!("Mode: worker relay");
    } else {
        tracing::info!(
            "Mode: direct, chunks {}/{} bytes, {}ms apart",
            config.fragment.before_sni,
            config.fragment.after_sni,
            config.fragment.delay.as_millis()
        );
    }

    let capture_signals = config.capture_ctrl_c;
    let server = Arc::new(Server::new(config)?);

    if capture_signals {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutting down");
            server.shutdown();
        });
    }

    server.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
