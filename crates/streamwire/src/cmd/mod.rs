use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use streamwire_protocol::ConnectionConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod request;
pub mod serve;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer requests on a Unix socket: `GET /version`, anything else is echoed.
    Serve(ServeArgs),
    /// Send one request and print the response.
    Request(RequestArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args).await,
        Command::Request(args) => request::run(args, format).await,
    }
}

/// Connection options shared by every subcommand.
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Maximum payload bytes per frame.
    #[arg(
        long,
        env = "STREAMWIRE_MAX_FRAME",
        default_value_t = 4096,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub max_frame: u16,
    /// Request timeout (e.g. 30s, 500ms).
    #[arg(long, env = "STREAMWIRE_TIMEOUT", default_value = "30s")]
    pub timeout: String,
}

impl ConnectionArgs {
    pub fn config(&self) -> CliResult<ConnectionConfig> {
        Ok(ConnectionConfig::default()
            .with_max_frame_length(usize::from(self.max_frame))
            .with_request_timeout(parse_duration(&self.timeout)?))
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Request verb.
    #[arg(long, default_value = "GET")]
    pub verb: String,
    /// Request path.
    #[arg(long = "path", value_name = "PATH")]
    pub target: String,
    /// Attach a UTF-8 string body.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Attach a JSON body (validated before sending).
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Attach the contents of a file.
    #[arg(long, conflicts_with_all = ["data", "json"])]
    pub file: Option<PathBuf>,
    /// Override the attachment's content type.
    #[arg(long)]
    pub content_type: Option<String>,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
