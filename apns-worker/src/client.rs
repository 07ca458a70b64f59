use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::endpoint::Environment;
use crate::engine::{Engine, ErrorHandler};
use crate::feedback;
use crate::message::{Feedback, Message};
use crate::queue::{Clock, NotificationQueue, SystemClock};
use crate::result::Result;
use crate::transport::{TlsIdentity, TlsTransportFactory, TransportFactory};

/// Default grace window, in seconds, for a claimed notification.
pub const DEFAULT_GRACE_SECS: f64 = 5.0;

/// [`ApnsClient`] builder.
pub struct ApnsClientBuilder {
    pub environment: Environment,
    pub message_grace: Duration,
    pub error_handler: Option<Arc<ErrorHandler>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ApnsClientBuilder {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            message_grace: Duration::from_secs_f64(DEFAULT_GRACE_SECS),
            error_handler: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ApnsClientBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(crate::message::DeliveryError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Builds a client that authenticates to APNs with a PEM-encoded client
    /// certificate and key, and starts its delivery engine immediately.
    pub fn build(self, cert_pem: &[u8], key_pem: &[u8]) -> Result<ApnsClient> {
        let identity = TlsIdentity::from_pem(cert_pem, key_pem)?;

        let gateway_factory: Arc<dyn TransportFactory> = Arc::new(TlsTransportFactory::new(
            self.environment.gateway(),
            identity.clone(),
        )?);

        let feedback_factory: Arc<dyn TransportFactory> =
            Arc::new(TlsTransportFactory::new(self.environment.feedback(), identity)?);

        let queue = Arc::new(NotificationQueue::with_clock(self.message_grace, self.clock));
        let engine = Engine::start(queue.clone(), gateway_factory, self.error_handler)?;

        Ok(ApnsClient {
            queue,
            engine,
            feedback_factory,
        })
    }
}

/// Top-level handle for sending Apple push notifications.
///
/// One instance manages a single connection to APNs and a single queue of
/// notifications to send. For high volumes, create multiple instances
/// against different queues rather than sharing one engine.
pub struct ApnsClient {
    queue: Arc<NotificationQueue>,
    engine: Engine,
    feedback_factory: Arc<dyn TransportFactory>,
}

impl ApnsClient {
    pub fn builder() -> ApnsClientBuilder {
        ApnsClientBuilder::new()
    }

    /// Queues a message for delivery. Returns once the message has been
    /// appended; delivery happens asynchronously on the engine's threads.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.queue.append(Arc::new(message))
    }

    /// Blocks until all queued messages have been delivered (or presumed
    /// delivered, per the grace window). Only useful to drain the queue
    /// before terminating a process.
    pub fn flush_messages(&self) -> Result<()> {
        let mut delay = self.queue.purge_expired()?;

        while !self.queue.is_empty()? {
            thread::sleep(Duration::from_secs_f64(delay));
            delay = self.queue.purge_expired()?;
        }

        Ok(())
    }

    /// Starts retrieving tokens from the APNs feedback service in the
    /// background. `callback` may be invoked multiple times, once per
    /// record, until the feedback connection reaches EOF.
    pub fn get_feedback<F>(&self, callback: F)
    where
        F: Fn(Feedback) + Send + Sync + 'static,
    {
        feedback::start(self.feedback_factory.clone(), Arc::new(callback));
    }

    /// Stops the delivery engine's threads.
    pub fn stop(&self) {
        self.engine.stop();
    }
}

impl Drop for ApnsClient {
    fn drop(&mut self) {
        self.engine.stop();
    }
}
