//! Command-line shim over the pivox engine.
//!
//! Exit codes: 0 success, 2 no valid proxies, 3 configuration error,
//! 4 unreachable destination.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use pivox_core::{
    AnonymityLevel, FetchOptions, Pivox, PivoxConfig, PivoxError, ProxyProtocol, RequestOptions,
    RotationKind,
};

const EXIT_OK: u8 = 0;
const EXIT_NO_PROXIES: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_UNREACHABLE: u8 = 4;

#[derive(Parser)]
#[command(name = "pivox", about = "Rotating free-proxy client", version)]
struct Cli {
    /// Optional TOML config file; PIVOX_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch candidate proxies from the enabled sources.
    Fetch {
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Filter by transport: http, https, socks4, socks5.
        #[arg(long)]
        protocol: Option<String>,
        /// Filter by advertised country.
        #[arg(long)]
        country: Option<String>,
        /// Minimum anonymity: transparent, anonymous, elite.
        #[arg(long)]
        anonymity: Option<String>,
        /// Return only proxies that pass validation now.
        #[arg(long)]
        validated: bool,
    },
    /// Issue a GET through a rotated proxy and print the body.
    Get {
        url: String,
        #[arg(long, default_value_t = 3)]
        retries: u32,
        /// round-robin, random, weighted, or least-recently-used.
        #[arg(long)]
        strategy: Option<String>,
        /// Allow a direct connection when no proxy works.
        #[arg(long)]
        direct_fallback: bool,
        /// Accept unvalidated proxies from the pool.
        #[arg(long)]
        any_proxy: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };

    match cli.command {
        Command::Fetch {
            count,
            protocol,
            country,
            anonymity,
            validated,
        } => fetch_command(config, count, protocol, country, anonymity, validated).await,
        Command::Get {
            url,
            retries,
            strategy,
            direct_fallback,
            any_proxy,
        } => get_command(config, url, retries, strategy, direct_fallback, any_proxy).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> pivox_core::Result<PivoxConfig> {
    match path {
        Some(path) => PivoxConfig::load(path),
        None => PivoxConfig::from_env(),
    }
}

async fn fetch_command(
    config: PivoxConfig,
    count: usize,
    protocol: Option<String>,
    country: Option<String>,
    anonymity: Option<String>,
    validated: bool,
) -> u8 {
    let protocols = match protocol.as_deref().map(parse_protocol).transpose() {
        Ok(p) => p.map(|p| vec![p]),
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };
    let min_anonymity = match anonymity.as_deref().map(parse_anonymity).transpose() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };

    let engine = match Pivox::builder().with_config(config).build().await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };

    let options = FetchOptions {
        count,
        protocols,
        countries: country.map(|c| vec![c]),
        min_anonymity,
        validated_only: false,
    };

    let proxies = if validated {
        engine
            .pool
            .fetch_validated(
                &options,
                Some(Box::new(|done, total| {
                    debug!(done, total, "validation progress");
                })),
            )
            .await
    } else {
        engine.pool.fetch(&options).await
    };

    if proxies.is_empty() {
        eprintln!("pivox: no proxies available");
        return EXIT_NO_PROXIES;
    }
    for proxy in proxies {
        let country = proxy.metadata.country.as_deref().unwrap_or("-");
        let anonymity = proxy.metadata.anonymity.map(|a| a.as_str()).unwrap_or("-");
        println!("{}\t{}\t{}", proxy.url(), country, anonymity);
    }
    EXIT_OK
}

async fn get_command(
    config: PivoxConfig,
    url: String,
    retries: u32,
    strategy: Option<String>,
    direct_fallback: bool,
    any_proxy: bool,
) -> u8 {
    let strategy = match strategy.as_deref().map(parse_strategy).transpose() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };

    let mut config = config;
    config.allow_direct_fallback = direct_fallback;

    let engine = match Pivox::builder().with_config(config).build().await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("pivox: {e}");
            return EXIT_CONFIG;
        }
    };

    let options = RequestOptions {
        use_validated_proxies: !any_proxy,
        rotate: true,
        max_retries: retries,
        strategy,
        use_https: url.starts_with("https://"),
    };

    match engine
        .client
        .request(pivox_core::client::Method::GET, &url, None, None, Some(options))
        .await
    {
        Ok(response) => {
            print!("{}", response.text());
            if response.is_success() {
                EXIT_OK
            } else {
                eprintln!("pivox: destination returned HTTP {}", response.status);
                EXIT_UNREACHABLE
            }
        }
        Err(PivoxError::NoProxiesAvailable) => {
            eprintln!("pivox: no valid proxies");
            EXIT_NO_PROXIES
        }
        Err(e @ PivoxError::Config(_)) => {
            eprintln!("pivox: {e}");
            EXIT_CONFIG
        }
        Err(e) => {
            eprintln!("pivox: {e}");
            EXIT_UNREACHABLE
        }
    }
}

fn parse_protocol(s: &str) -> Result<ProxyProtocol, String> {
    ProxyProtocol::parse(s).ok_or_else(|| format!("unknown protocol {s:?}"))
}

fn parse_anonymity(s: &str) -> Result<AnonymityLevel, String> {
    AnonymityLevel::parse(s).ok_or_else(|| format!("unknown anonymity level {s:?}"))
}

fn parse_strategy(s: &str) -> Result<RotationKind, String> {
    RotationKind::parse(s).ok_or_else(|| format!("unknown strategy {s:?}"))
}
