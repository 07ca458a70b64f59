//! The feedback-service consumer. Independent of the delivery engine: it
//! opens its own transport to the feedback endpoint and runs until EOF.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::codec;
use crate::message::Feedback;
use crate::transport::TransportFactory;

const READ_CHUNK: usize = 4096;

/// Starts a background thread that reads feedback records until the
/// connection closes, delivering each one to `callback`.
pub fn start(
    factory: Arc<dyn TransportFactory>,
    callback: Arc<dyn Fn(Feedback) + Send + Sync>,
) -> JoinHandle<()> {
    thread::spawn(move || run(factory, callback))
}

fn run(factory: Arc<dyn TransportFactory>, callback: Arc<dyn Fn(Feedback) + Send + Sync>) {
    debug!("feedback thread starting");

    let transport = match factory.new_transport() {
        Ok(transport) => transport,
        Err(err) => {
            info!(%err, "failed to open feedback connection");
            return;
        }
    };

    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = match transport.recv(&mut chunk) {
            Ok(read) => read,
            Err(err) => {
                info!(%err, "transport error while reading feedback");
                break;
            }
        };

        if read == 0 {
            break;
        }

        buffer.extend_from_slice(&chunk[..read]);

        loop {
            let (record, remainder) = codec::parse_feedback_record(&buffer);
            let consumed = buffer.len() - remainder.len();

            match record {
                Some(record) => {
                    buffer.drain(..consumed);

                    if let Ok(when) = OffsetDateTime::from_unix_timestamp(record.timestamp as i64) {
                        callback(Feedback {
                            token: hex::encode(record.encoded_token),
                            when,
                        });
                    }
                }
                None => break,
            }
        }
    }

    transport.close();
    debug!("feedback thread terminating");
}
