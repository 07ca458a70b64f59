use std::path::PathBuf;

use anyhow::{anyhow, Result};
use apns_worker::Environment;
use clap::Parser;
use humantime::parse_duration;
use time::{format_description::well_known::Iso8601, OffsetDateTime};

/// Send a single notification through the legacy binary Apple Push
/// Notification service and wait for it to clear the queue.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// PEM-encoded client certificate used to authenticate to APNs.
    #[arg(long, env)]
    pub cert_pem_file: PathBuf,

    /// PEM-encoded private key matching `--cert-pem-file`.
    #[arg(long, env)]
    pub key_pem_file: PathBuf,

    /// Which APNs environment to connect to.
    #[arg(long, env, default_value = "sandbox")]
    pub environment: EnvironmentArg,

    /// A hex-encoded device token to send to. May be repeated.
    #[arg(long = "token", required = true, num_args = 1..)]
    pub tokens: Vec<String>,

    /// The notification payload as a JSON string. Mutually exclusive with
    /// `--payload-file`.
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Path to a file containing the notification payload as JSON.
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// The date at which APNs should stop trying to deliver the
    /// notification, as an ISO-8601 timestamp or a relative duration (e.g.
    /// `1h`).
    #[arg(long, env, value_parser = parse_expiration)]
    pub expiration: Option<OffsetDateTime>,

    /// Delivery priority: `5` (power-considerate) or `10` (immediate).
    #[arg(long, env)]
    pub priority: Option<u8>,

    /// Seconds to leave a sent notification in the replay queue before
    /// presuming it was delivered.
    #[arg(long, env, default_value_t = apns_worker::DEFAULT_GRACE_SECS)]
    pub grace: f64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum EnvironmentArg {
    Sandbox,
    Production,
}

impl From<EnvironmentArg> for Environment {
    fn from(value: EnvironmentArg) -> Self {
        match value {
            EnvironmentArg::Sandbox => Environment::Sandbox,
            EnvironmentArg::Production => Environment::Production,
        }
    }
}

fn parse_expiration(arg: &str) -> Result<OffsetDateTime> {
    match OffsetDateTime::parse(arg, &Iso8601::DEFAULT) {
        Ok(timestamp) => Ok(timestamp),
        Err(timestamp_err) => match parse_duration(arg) {
            Ok(duration) => Ok(OffsetDateTime::now_utc() + duration),
            Err(duration_err) => Err(anyhow!(
                "invalid expiration; invalid timestamp: {timestamp_err}; invalid duration: {duration_err}"
            )),
        },
    }
}
