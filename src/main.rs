//! velocy - command-line probe for VelocyStream servers
//!
//! Loads the driver configuration, connects and issues one request.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use velocy_client::{
    Driver, DriverConfig, HostDescription, HostHandle, LoadBalancingStrategy, Protocol, Request,
    RequestType,
};

#[derive(Parser)]
#[command(name = "velocy")]
#[command(about = "Command-line probe for VelocyStream document database servers")]
#[command(version)]
struct Cli {
    /// Config file (YAML); VELOCY_* variables still apply on top
    #[arg(short, long, env = "VELOCY_CONFIG")]
    config: Option<PathBuf>,

    /// Hosts to connect to, comma-separated (host:port or tcp://host:port)
    #[arg(short = 'H', long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Transport: vst or http
    #[arg(short, long)]
    protocol: Option<String>,

    /// User name
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(long, env = "VELOCY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Database
    #[arg(short, long)]
    database: Option<String>,

    /// Load balancing: NONE, ONE_RANDOM or ROUND_ROBIN
    #[arg(long)]
    load_balancing: Option<String>,

    /// Refresh the host list from the cluster
    #[arg(long)]
    acquire_host_list: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the server version
    Version,

    /// List the cluster's coordinator endpoints
    Endpoints,

    /// GET a path and print the response body
    Get {
        /// Path relative to the database, e.g. /_api/collection
        path: String,

        /// Allow a follower to answer
        #[arg(long)]
        dirty_read: bool,

        /// Repeat the request, pinned to the host that answered first
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },

    /// POST a JSON body to a path
    Post {
        path: String,

        /// JSON body (or @file.json to read from file)
        body: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;
    tracing::debug!("Using configuration: {:?}", config);
    let driver = Driver::new(config)?;

    let result = execute(&driver, cli.command).await;
    driver.shutdown().await;
    result
}

fn build_config(cli: &Cli) -> Result<DriverConfig, Box<dyn std::error::Error>> {
    let mut config = match cli.config {
        Some(ref path) => {
            let config = DriverConfig::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => DriverConfig::default(),
    };
    config.apply_env_overrides();

    if !cli.hosts.is_empty() {
        config.hosts = cli
            .hosts
            .iter()
            .map(|h| HostDescription::parse_location(h))
            .collect::<Result<_, _>>()?;
    }
    if let Some(ref protocol) = cli.protocol {
        config.protocol = protocol.parse::<Protocol>()?;
    }
    if let Some(ref user) = cli.user {
        config.user = Some(user.clone());
    }
    if let Some(ref password) = cli.password {
        config.password = Some(password.clone());
    }
    if let Some(ref database) = cli.database {
        config.database = database.clone();
    }
    if let Some(ref strategy) = cli.load_balancing {
        config.load_balancing = strategy.parse::<LoadBalancingStrategy>()?;
    }
    if cli.acquire_host_list {
        config.acquire_host_list = true;
    }

    config.validate()?;
    Ok(config)
}

async fn execute(driver: &Driver, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Version => {
            let version = driver.version().await?;
            match version.license {
                Some(license) => println!("{} {} ({})", version.server, version.version, license),
                None => println!("{} {}", version.server, version.version),
            }
        }
        Commands::Endpoints => {
            for endpoint in driver.endpoints().await? {
                println!("{}", endpoint);
            }
        }
        Commands::Get {
            path,
            dirty_read,
            repeat,
        } => {
            let request = driver
                .request(RequestType::Get, path)
                .with_dirty_read(dirty_read);
            let mut handle = HostHandle::new();
            for _ in 0..repeat.max(1) {
                let body: serde_json::Value =
                    driver.execute_json(&request, Some(&mut handle)).await?;
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            if let Some(host) = handle.host() {
                tracing::info!("Served by {}", host);
            }
        }
        Commands::Post { path, body } => {
            let body = match body.strip_prefix('@') {
                Some(file) => std::fs::read_to_string(file)?,
                None => body,
            };
            let value: serde_json::Value = serde_json::from_str(&body)?;
            let request: Request = driver
                .request(RequestType::Post, path)
                .with_body(serde_json::to_vec(&value)?);
            let response: serde_json::Value = driver.execute_json(&request, None).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
