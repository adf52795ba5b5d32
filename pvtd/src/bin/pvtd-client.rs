//! Command-line client for pvtd.
//!
//! ```text
//! pvtd-client put -c ADDR -d VALUE
//! pvtd-client put -c ADDR -a SOURCE
//! pvtd-client get -c ADDR
//! pvtd-client get -a -c ADDR
//! ```

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pvtd::{DEFAULT_SOCKET, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

#[derive(Parser)]
#[command(name = "pvtd-client")]
#[command(author, version, about = "Read and write pvtd properties")]
struct Cli {
    /// Path to the pvtd control socket
    #[arg(short, long, env = "PVTD_SOCKET", default_value = DEFAULT_SOCKET, global = true)]
    socket: PathBuf,

    /// Response timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, global = true)]
    timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a property and print the stored value
    Put {
        /// Property address
        #[arg(short = 'c', value_name = "ADDR")]
        address: String,

        /// Scalar value
        #[arg(
            short = 'd',
            value_name = "VALUE",
            allow_hyphen_values = true,
            required_unless_present = "array",
            conflicts_with = "array"
        )]
        data: Option<String>,

        /// Array source file name
        #[arg(short = 'a', value_name = "SOURCE")]
        array: Option<String>,
    },
    /// Read a property
    Get {
        /// Property address
        #[arg(short = 'c', value_name = "ADDR")]
        address: String,

        /// Read the whole array
        #[arg(short = 'a')]
        array: bool,
    },
    /// Show daemon state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Put {
            address,
            data: Some(value),
            ..
        } => Request::Put { address, value },
        Commands::Put {
            address,
            array: Some(source),
            ..
        } => Request::PutArray { address, source },
        Commands::Put { .. } => bail!("put needs -d VALUE or -a SOURCE"),
        Commands::Get {
            address,
            array: true,
        } => Request::GetArray { address },
        Commands::Get { address, .. } => Request::Get { address },
        Commands::Status => Request::Status,
    };

    let response = send_request(&cli.socket, &request, cli.timeout).await?;
    if !response.ok {
        bail!(
            "{}",
            response.error.unwrap_or_else(|| "request failed".to_string())
        );
    }
    match (response.values, response.value) {
        (Some(values), _) => println!("{}", values.join(" ")),
        (None, Some(value)) => println!("{value}"),
        (None, None) => {}
    }
    Ok(())
}

async fn send_request(socket: &Path, request: &Request, limit: Duration) -> Result<Response> {
    if !socket.exists() {
        bail!("pvtd socket {:?} not found; is pvtd running?", socket);
    }
    let stream = timeout(Duration::from_secs(5), UnixStream::connect(socket))
        .await
        .map_err(|_| anyhow::anyhow!("Connect to {:?} timed out after 5s", socket))??;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;

    let read_response = async {
        let mut reader = BufReader::new(reader);
        let mut body = String::new();
        let n = reader.read_line(&mut body).await?;
        if n == 0 {
            bail!("pvtd closed the connection without responding");
        }
        serde_json::from_str::<Response>(body.trim())
            .context("Failed to parse pvtd response")
    };

    timeout(limit, read_response)
        .await
        .map_err(|_| anyhow::anyhow!("pvtd response timed out after {:?}", limit))?
}
