// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Homebrew DMR hub server
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (62031) with a directory seed
//! hbhub-server --directory directory.json
//!
//! # Configuration file
//! hbhub-server --config hub.json
//!
//! # Write a default configuration
//! hbhub-server gen-config --output hub.json
//! ```

use clap::{Parser, Subcommand};
use hbhub_server::{HubServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Homebrew DMR hub - repeater logins, talkgroup routing and parrot
#[derive(Parser, Debug)]
#[command(name = "hbhub-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long, env = "HBHUB_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(short, long, env = "HBHUB_PORT", default_value = "62031")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, env = "HBHUB_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Directory seed with repeaters, talkgroups and users (JSON)
    #[arg(short, long, env = "HBHUB_DIRECTORY")]
    directory: Option<PathBuf>,

    /// Log every successful protocol step
    #[arg(short, long, env = "HBHUB_VERBOSE")]
    verbose: bool,

    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[arg(long, env = "HBHUB_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "hbhub.json")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = if let Some(ref config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        let mut config = ServerConfig::from_file(config_path)?;
        if args.directory.is_some() {
            config.directory_path = args.directory.clone();
        }
        config.verbose |= args.verbose;
        config
    } else {
        ServerConfig {
            bind_address: args.bind,
            port: args.port,
            directory_path: args.directory.clone(),
            verbose: args.verbose,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       Homebrew DMR Hub v{}                      |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bind:   {:40} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!(
        "|  TTL:    {:40} |",
        format!("{}s", config.session_ttl_secs)
    );
    info!(
        "|  Parrot: {:40} |",
        format!("{}ms delay", config.parrot_delay_ms)
    );
    info!("+----------------------------------------------------+");

    let server = HubServer::in_memory(config)?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping hub...");
        server_handle.shutdown().await;
    });

    server.run().await?;

    info!("Hub stopped");
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    ServerConfig::default().to_file(&output)?;
    println!("Generated configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_file(&path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("  Bind:      {}:{}", config.bind_address, config.port);
    println!("  Session:   {}s", config.session_ttl_secs);
    println!(
        "  Parrot:    {}ms delay, {}ms pacing",
        config.parrot_delay_ms, config.parrot_frame_interval_ms
    );
    if let Some(directory) = &config.directory_path {
        println!("  Directory: {}", directory.display());
    }
    Ok(())
}
