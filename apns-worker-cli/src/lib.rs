use std::fs;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use apns_worker::{ApnsClient, Message};
use clap::Parser;

mod cli;

pub use cli::Cli;

pub fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let cert_pem = fs::read(&cli.cert_pem_file)?;
    let key_pem = fs::read(&cli.key_pem_file)?;

    let payload = match (&cli.payload, &cli.payload_file) {
        (Some(payload), None) => serde_json::from_str(payload)?,
        (None, Some(path)) => serde_json::from_slice(&fs::read(path)?)?,
        (None, None) => serde_json::json!({"aps": {}}),
        (Some(_), Some(_)) => unreachable!("clap enforces --payload and --payload-file are exclusive"),
    };

    let had_error = Arc::new(AtomicBool::new(false));
    let handler_had_error = had_error.clone();

    let mut builder = ApnsClient::builder().error_handler(move |error| {
        eprintln!("{error}");
        handler_had_error.store(true, Ordering::SeqCst);
    });
    builder.environment = cli.environment.into();
    builder.message_grace = Duration::from_secs_f64(cli.grace);

    let client = builder.build(&cert_pem, &key_pem)?;

    let message = Message::new(&cli.tokens, &payload, cli.expiration, cli.priority.map(i32::from))?;

    client.send_message(message)?;
    client.flush_messages()?;

    if had_error.load(Ordering::SeqCst) {
        Err(anyhow!("one or more notifications were rejected by APNs"))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
