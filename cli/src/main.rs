//! chanpool CLI — probe a backend through the shared channel pool.
//!
//! Usage:
//! ```bash
//! # Connect 4 logical clients to one backend and print pool stats
//! chanpool probe --addr 127.0.0.1:50051 --clients 4
//!
//! # Same, with pool / TCP / log settings from a JSON file
//! chanpool probe --addr db.internal:5432 --config chanpool.json
//! ```

mod logging;

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;

use chanpool_core::{Address, ChannelPool, ClientConnection, PoolConfig, PoolConfigFile};
use chanpool_tcp::{TcpConfig, TcpConnector};

use crate::logging::{init_tracing, LogConfig};

/// Top-level `--config` file.
#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    pool: PoolConfigFile,
    #[serde(default)]
    tcp: TcpConfig,
    #[serde(default)]
    log: LogConfig,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "probe" => cmd_probe(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chanpool {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chanpool {}", env!("CARGO_PKG_VERSION"));
    println!("Probe backends through the shared channel pool\n");
    println!("USAGE:");
    println!("    chanpool <COMMAND>\n");
    println!("COMMANDS:");
    println!("    probe      Connect N clients to one address and print pool stats");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("PROBE FLAGS:");
    println!("    --addr <HOST:PORT>   Backend address  [required]");
    println!("    --clients <N>        Logical clients sharing the channel  [default: 2]");
    println!("    --config <FILE>      JSON file with pool / tcp / log sections");
    println!("    --log-level <LEVEL>  Override the configured log level");
}

fn load_config(path: Option<&str>) -> anyhow::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("reading config {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))
}

async fn cmd_probe(args: &[String]) -> anyhow::Result<()> {
    let addr: Address = parse_flag(args, "--addr")
        .context("--addr is required")?
        .parse()?;
    let clients: usize = match parse_flag(args, "--clients") {
        Some(n) => n.parse().context("--clients must be a positive integer")?,
        None => 2,
    };
    if clients == 0 {
        bail!("--clients must be at least 1");
    }

    let mut config = load_config(parse_flag(args, "--config").as_deref())?;
    if let Some(level) = parse_flag(args, "--log-level") {
        config.log.level = level;
    }
    init_tracing(&config.log);

    let pool_config = PoolConfig::try_from(config.pool)?;
    let pool = ChannelPool::new(Arc::new(TcpConnector::new(config.tcp)), pool_config);
    let evictor = pool.spawn_evictor();

    println!("Probing {addr} with {clients} client(s)...");

    let conns: Vec<ClientConnection> = (0..clients)
        .map(|_| ClientConnection::plain(pool.clone(), addr.clone()))
        .collect();

    let start = std::time::Instant::now();
    let results = futures::future::join_all(conns.iter().map(|c| c.ensure_connected())).await;
    let latency = start.elapsed();

    let mut failed = 0;
    for (i, (conn, res)) in conns.iter().zip(&results).enumerate() {
        match res {
            Ok(()) => {
                let channel = conn.channel().map(|c| c.id().to_string()).unwrap_or_default();
                println!(
                    "  client {i}: {}  channel={channel}  healthy={}",
                    conn.connection_state(),
                    conn.is_channel_healthy()
                );
            }
            Err(e) => {
                failed += 1;
                println!("  client {i}: error: {e}");
            }
        }
    }
    println!("  Latency:      {}ms", latency.as_millis());

    let stats = pool.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for conn in &conns {
        conn.close().await;
    }
    pool.shutdown().await;
    if let Some(task) = evictor {
        task.abort();
    }

    if failed > 0 {
        bail!("{failed} of {clients} client(s) failed to connect");
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_flag_finds_value() {
        let a = args(&["--addr", "svc:1", "--clients", "3"]);
        assert_eq!(parse_flag(&a, "--clients").as_deref(), Some("3"));
        assert_eq!(parse_flag(&a, "--config"), None);
    }

    #[test]
    fn parse_flag_missing_value() {
        let a = args(&["--addr"]);
        assert_eq!(parse_flag(&a, "--addr"), None);
    }

    #[test]
    fn config_sections_are_optional() {
        let cfg: CliConfig =
            serde_json::from_str(r#"{"pool": {"connect_timeout_ms": 250}}"#).unwrap();
        assert_eq!(cfg.pool.connect_timeout_ms, 250);
        assert!(cfg.tcp.nodelay);
        assert_eq!(cfg.log.level, "warn");
    }

    #[tokio::test]
    async fn probe_reports_failure_for_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let a = args(&["--addr", &format!("127.0.0.1:{port}"), "--clients", "1"]);
        assert!(cmd_probe(&a).await.is_err());
    }
}
