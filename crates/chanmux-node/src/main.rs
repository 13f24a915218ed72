//! Chanmux Node - channel server and RPC client.
//!
//! `serve` runs a channel server exposing the `echo` and `system` services on
//! the `RPCService` channel. `call` connects as a multiplexer client, invokes
//! one method and prints the result.

mod handler;
mod server;

use anyhow::{Context, Result};
use chanmux_core::{
    create_client_connection, BackoffConfig, ClientConnectionOptions, ReconnectingTcpTransport,
    ServiceRegistry,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "chanmux-node")]
#[command(about = "Channel multiplexing server and RPC client")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a channel server
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Call one RPC method on a running server
    Call {
        /// Server address
        #[arg(long)]
        addr: SocketAddr,

        /// Service path
        #[arg(long, default_value = "echo")]
        service: String,

        /// Method name
        #[arg(long)]
        method: String,

        /// JSON params
        #[arg(long, default_value = "{}")]
        params: String,

        /// Seconds to wait for the connection
        #[arg(long, default_value = "10")]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, host } => serve(&host, port).await,
        Command::Call {
            addr,
            service,
            method,
            params,
            connect_timeout,
        } => call(addr, &service, &method, &params, Duration::from_secs(connect_timeout)).await,
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    info!("Starting chanmux node");
    let mut handle = server::start_server(host, port).await?;

    // Print port for scripts to read (intentional stdout)
    println!("CHANMUX_PORT={}", handle.addr().port());
    info!("Channel server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

async fn call(
    addr: SocketAddr,
    service: &str,
    method: &str,
    params: &str,
    connect_timeout: Duration,
) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("--params must be valid JSON")?;

    let (transport, events) = ReconnectingTcpTransport::connect(addr, BackoffConfig::new());
    let connection = tokio::time::timeout(
        connect_timeout,
        create_client_connection(
            Arc::new(ServiceRegistry::new()),
            &[],
            transport.clone(),
            events,
            ClientConnectionOptions::new()
                .with_on_reconnect(|| info!("RPC channel re-opened after reconnect")),
        ),
    )
    .await
    .with_context(|| format!("could not connect to {} within {:?}", addr, connect_timeout))??;

    let result = connection
        .center
        .get_rpc_service(service)
        .call(method, params)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    connection.multiplexer.dispose();
    transport.close();
    Ok(())
}
