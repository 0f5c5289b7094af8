//! dbwire - command-line access to a database cluster
//!
//! Sends single requests through the communication engine and shows the
//! cluster topology.

use clap::{Parser, Subcommand};
use dbwire_client::{
    Communication, ConfigFile, ContentCodec, LoadBalancingStrategy, Method, Request, Response,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbwire")]
#[command(about = "Send requests to a multi-host database cluster")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "DBWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Host endpoint, repeatable (replaces hosts from the configuration)
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Load balancing strategy (none, round-robin, one-random)
    #[arg(long)]
    load_balancing: Option<LoadBalancingStrategy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Request {
        /// HTTP-like method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Target database
        #[arg(short, long, default_value = "_system")]
        database: String,

        /// Request path, e.g. /_api/version
        path: String,

        /// JSON body (or @file.json to read from file)
        #[arg(short, long)]
        body: Option<String>,

        /// Extra meta header as name=value, repeatable
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Fetch the cluster endpoint list and print the resulting hosts
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut file = match &cli.config {
        Some(path) => {
            let mut file = ConfigFile::from_file(path)?;
            file.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            file
        }
        None => ConfigFile::load()?,
    };
    if !cli.hosts.is_empty() {
        file.hosts = cli.hosts.clone();
    }
    if let Some(strategy) = cli.load_balancing {
        file.load_balancing = strategy;
    }

    let comm = Communication::connect(file.into_config()?).await?;
    let result = run(&comm, cli.command).await;
    comm.close().await;
    result
}

async fn run(comm: &Communication, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Request {
            method,
            database,
            path,
            body,
            headers,
        } => {
            let method: Method = method.to_uppercase().parse()?;
            let mut request = Request::new(database, method, path);

            for header in headers {
                let (name, value) = header
                    .split_once('=')
                    .ok_or_else(|| format!("invalid header '{}', expected name=value", header))?;
                request = request.with_header(name.trim(), value.trim());
            }

            if let Some(body) = body {
                let text = match body.strip_prefix('@') {
                    Some(file) => std::fs::read_to_string(file)?,
                    None => body,
                };
                let value: serde_json::Value = serde_json::from_str(&text)?;
                request = request.with_body(comm.codec().serialize(&value)?);
            }

            let response = comm.execute(request).await?;
            print_response(comm, &response)?;
            if !response.is_success() {
                return Err(format!("request failed with status {}", response.status).into());
            }
        }
        Commands::Endpoints => {
            let change = comm.refresh_topology().await?;
            for host in comm.host_descriptions() {
                println!("{}", host);
            }
            for host in &change.removed {
                println!("{} (draining)", host);
            }
        }
    }
    Ok(())
}

fn print_response(
    comm: &Communication,
    response: &Response,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("status: {}", response.status);
    if response.body.is_empty() {
        return Ok(());
    }

    match comm.codec().deserialize::<serde_json::Value>(&response.body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        // Not in the negotiated content type, print it as text
        Err(_) => println!("{}", String::from_utf8_lossy(&response.body)),
    }
    Ok(())
}
