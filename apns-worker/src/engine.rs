//! The delivery engine: a reader thread and a writer thread pipelining
//! notifications over one transport, reacting to server error frames, and
//! resetting the connection on failure.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{self, ErrorResponse};
use crate::message::DeliveryError;
use crate::queue::NotificationQueue;
use crate::result::Result;
use crate::transport::{Transport, TransportFactory};

/// Callback invoked for each unrecoverable per-token delivery error.
pub type ErrorHandler = dyn Fn(DeliveryError) + Send + Sync;

/// Owns the reader thread and coordinates the writer thread spawned under
/// it. Dropping the engine does not stop it; call [`Engine::stop`]
/// explicitly.
pub struct Engine {
    reader: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<NotificationQueue>,
    current_transport: Arc<Mutex<Option<Arc<dyn Transport>>>>,
}

impl Engine {
    pub fn start(
        queue: Arc<NotificationQueue>,
        factory: Arc<dyn TransportFactory>,
        error_handler: Option<Arc<ErrorHandler>>,
    ) -> Result<Self> {
        let transport = factory.new_transport()?;
        let current_transport = Arc::new(Mutex::new(Some(transport.clone())));

        let reader_queue = queue.clone();
        let reader_current = current_transport.clone();
        let reader = thread::spawn(move || {
            reader_loop(reader_queue, factory, transport, error_handler, reader_current);
        });

        Ok(Self {
            reader: Mutex::new(Some(reader)),
            queue,
            current_transport,
        })
    }

    /// Requests termination and waits for the reader thread to exit.
    ///
    /// Termination alone only wakes a reader that's idle waiting for
    /// notifications; one blocked in a read waiting for an error frame
    /// would otherwise never notice, so this also closes whatever transport
    /// the reader currently holds to force that read to return.
    pub fn stop(&self) {
        if self.queue.request_termination().is_err() {
            warn!("queue lock poisoned while requesting termination");
        }

        if let Ok(current) = self.current_transport.lock() {
            if let Some(transport) = current.as_ref() {
                transport.close();
            }
        }

        let handle = self.reader.lock().ok().and_then(|mut guard| guard.take());

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
    }
}

fn reader_loop(
    queue: Arc<NotificationQueue>,
    factory: Arc<dyn TransportFactory>,
    mut transport: Arc<dyn Transport>,
    error_handler: Option<Arc<ErrorHandler>>,
    current_transport: Arc<Mutex<Option<Arc<dyn Transport>>>>,
) {
    debug!("reader thread starting");

    loop {
        match queue.wait_for_unclaimed() {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                warn!(%err, "queue error while waiting for notifications");
                break;
            }
        }

        if let Err(err) = queue.reset_writer_stop() {
            warn!(%err, "queue error while resetting writer state");
        }

        let writer_queue = queue.clone();
        let writer_transport = transport.clone();
        let writer = thread::spawn(move || writer_loop(writer_queue, writer_transport));

        wait_for_error(&queue, &transport, &error_handler);

        transport.close();

        // The writer may be idle with nothing to claim; wake it explicitly
        // so this join can't deadlock waiting for a writer that will never
        // notice the connection is gone on its own.
        if let Err(err) = queue.signal_writer_stop() {
            warn!(%err, "queue error while signaling the writer to stop");
        }

        if writer.join().is_err() {
            warn!("writer thread panicked");
        }

        if queue.is_terminated().unwrap_or(true) {
            break;
        }

        transport = match factory.new_transport() {
            Ok(t) => t,
            Err(err) => {
                warn!(%err, "failed to create a new transport; retrying");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        if let Ok(mut current) = current_transport.lock() {
            *current = Some(transport.clone());
        }
    }

    transport.close();
    debug!("reader thread terminating");
}

fn wait_for_error(
    queue: &NotificationQueue,
    transport: &Arc<dyn Transport>,
    error_handler: &Option<Arc<ErrorHandler>>,
) {
    let buf = match transport.recv_exact(6) {
        Ok(buf) => buf,
        Err(err) => {
            info!(%err, "transport error while reading");
            return;
        }
    };

    if buf.len() != 6 {
        debug!("connection dropped while waiting for an error frame");
        return;
    }

    debug!("received error response from APNs");
    handle_response(queue, &buf, error_handler);
}

fn handle_response(
    queue: &NotificationQueue,
    buf: &[u8],
    error_handler: &Option<Arc<ErrorHandler>>,
) {
    let response = match codec::parse_error_response(buf) {
        Some(response) => response,
        None => {
            warn!(frame = ?buf, "failed to parse APNs response; treating as connection loss");
            return;
        }
    };

    match response {
        ErrorResponse::Shutdown { ident } => {
            debug!(ident, "server shutdown signal");
            let _ = queue.backtrack(ident);
        }
        ErrorResponse::Rejected { reason, ident } => {
            match queue.backtrack(ident) {
                Ok(Some(notification)) => {
                    let error = DeliveryError {
                        reason,
                        message: notification.message().clone(),
                        token: notification.token(),
                    };

                    if let Some(handler) = error_handler {
                        handler(error);
                    } else {
                        warn!(%error, "dropped delivery error; no error handler configured");
                    }
                }
                Ok(None) => {
                    debug!(ident, "error frame referenced an unknown identifier");
                }
                Err(err) => {
                    warn!(%err, "queue error while backtracking");
                }
            }
        }
    }
}

fn writer_loop(queue: Arc<NotificationQueue>, transport: Arc<dyn Transport>) {
    debug!("writer thread starting");

    loop {
        let notification = match queue.wait_and_claim() {
            Ok(Some(notification)) => notification,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "queue error while claiming a notification");
                break;
            }
        };

        let frame = codec::encode_frame(&notification);

        if let Err(err) = transport.send(&frame) {
            info!(%err, "transport error while writing; the reader will reset");
            let _ = queue.unclaim(&notification);
            break;
        }

        if transport.is_closed() {
            let _ = queue.unclaim(&notification);
            break;
        }
    }

    debug!("writer thread terminating");
}
