use std::time::Duration;

use clap::{Args, Subcommand};
use mqwire_client::ConnectionConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod consume;
pub mod info;
pub mod publish;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish one message.
    Publish(PublishArgs),
    /// Consume a queue and print deliveries.
    Consume(ConsumeArgs),
    /// Connect, print negotiated limits, and disconnect.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Publish(args) => publish::run(args),
        Command::Consume(args) => consume::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Server address, host:port.
    pub addr: String,

    /// Virtual host to open.
    #[arg(long, default_value = "/")]
    pub vhost: String,

    /// Username for PLAIN authentication.
    #[arg(long, default_value = "guest")]
    pub user: String,

    /// Password for PLAIN authentication.
    #[arg(long, default_value = "guest", env = "MQWIRE_PASSWORD")]
    pub password: String,

    /// Connect and RPC timeout, e.g. `5s` or `500ms`.
    #[arg(long, value_name = "DURATION", default_value = "10s")]
    pub timeout: String,

    /// Requested heartbeat interval in seconds (0 disables).
    #[arg(long, default_value_t = 60)]
    pub heartbeat: u16,
}

impl ConnectArgs {
    pub fn to_config(&self) -> CliResult<ConnectionConfig> {
        let timeout = parse_duration(&self.timeout)?;
        Ok(ConnectionConfig {
            virtual_host: self.vhost.clone(),
            username: self.user.clone(),
            password: self.password.clone(),
            heartbeat: self.heartbeat,
            connect_timeout: Some(timeout),
            rpc_timeout: timeout,
            ..ConnectionConfig::new(self.addr.clone())
        })
    }
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Exchange to publish to (empty for the default exchange).
    #[arg(long, short = 'e', default_value = "")]
    pub exchange: String,

    /// Routing key.
    #[arg(long, short = 'k')]
    pub routing_key: String,

    /// Message body as a UTF-8 string.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,

    /// Message body as JSON (validated before sending).
    #[arg(long, conflicts_with = "file")]
    pub json: Option<String>,

    /// Message body read from a file.
    #[arg(long, value_name = "PATH")]
    pub file: Option<std::path::PathBuf>,

    /// Content-type property.
    #[arg(long)]
    pub content_type: Option<String>,

    /// Mark the message persistent.
    #[arg(long)]
    pub persistent: bool,
}

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Queue to consume from.
    pub queue: String,

    /// Outstanding-delivery limit requested from the server (0 = none).
    #[arg(long, default_value_t = 0)]
    pub prefetch: u16,

    /// Consume without acknowledgements.
    #[arg(long)]
    pub no_ack: bool,

    /// Stop after this many deliveries (default: until disconnect).
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Include build and feature details.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}
