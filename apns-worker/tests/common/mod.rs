//! An in-memory `Transport` double. Stands in for `wiremock`, which only
//! speaks HTTP: the engine here drives a raw, bidirectional byte stream, so
//! the double needs to model a blocking socket directly.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use apns_worker::result::Result;
use apns_worker::transport::{Transport, TransportFactory};

/// A frame sent by the writer thread, decoded just enough for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub ident: u32,
    pub token: [u8; 32],
}

fn decode_sent_frame(buf: &[u8]) -> SentFrame {
    let content = &buf[5..];
    let mut token = [0u8; 32];
    let mut ident = 0u32;
    let mut i = 0;

    while i < content.len() {
        let id = content[i];
        let len = u16::from_be_bytes([content[i + 1], content[i + 2]]) as usize;
        let data = &content[i + 3..i + 3 + len];

        match id {
            1 => token.copy_from_slice(data),
            3 => ident = u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            _ => {}
        }

        i += 3 + len;
    }

    SentFrame { ident, token }
}

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<SentFrame>>,
    connections_opened: Mutex<u32>,
}

/// Produces [`MockTransport`]s that all report into the same `Shared` log,
/// and tracks the most recently created one so a test can drive its
/// incoming side.
pub struct MockTransportFactory {
    shared: Arc<Shared>,
    current: Mutex<Option<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared::default()),
            current: Mutex::new(None),
        })
    }

    /// The transport most recently handed out by `new_transport`.
    pub fn current(&self) -> Arc<MockTransport> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .expect("no transport created yet")
    }

    pub fn connections_opened(&self) -> u32 {
        *self.shared.connections_opened.lock().unwrap()
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Blocks the calling (test) thread until at least `n` frames have been
    /// sent across all connections, or a short timeout elapses.
    pub fn wait_for_sent_count(&self, n: usize) {
        for _ in 0..200 {
            if self.sent_frames().len() >= n {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!(
            "timed out waiting for {n} sent frames, got {}",
            self.sent_frames().len()
        );
    }

    pub fn wait_for_connections(&self, n: u32) {
        for _ in 0..200 {
            if self.connections_opened() >= n {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("timed out waiting for {n} connections");
    }
}

impl TransportFactory for MockTransportFactory {
    fn new_transport(&self) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(MockTransport {
            shared: self.shared.clone(),
            incoming: Mutex::new(VecDeque::new()),
            eof: Mutex::new(false),
            closed: std::sync::atomic::AtomicBool::new(false),
            cond: Condvar::new(),
        });

        *self.shared.connections_opened.lock().unwrap() += 1;
        *self.current.lock().unwrap() = Some(transport.clone());

        Ok(transport)
    }
}

/// One simulated connection: every `send` is logged as a whole frame, and
/// `recv` blocks until the test pushes bytes, signals EOF, or closes it.
pub struct MockTransport {
    shared: Arc<Shared>,
    incoming: Mutex<VecDeque<u8>>,
    eof: Mutex<bool>,
    closed: std::sync::atomic::AtomicBool,
    cond: Condvar,
}

impl MockTransport {
    /// Feeds bytes to the reader side of this connection, as if the server
    /// had written them.
    pub fn push_response(&self, bytes: &[u8]) {
        let mut incoming = self.incoming.lock().unwrap();
        incoming.extend(bytes);
        self.cond.notify_all();
    }

    /// Pushes a pre-encoded error frame for `ident`.
    pub fn push_error(&self, status: u8, ident: u32) {
        let mut frame = vec![8u8, status];
        frame.extend_from_slice(&ident.to_be_bytes());
        self.push_response(&frame);
    }

    /// Simulates the server closing the connection with no further data.
    pub fn signal_eof(&self) {
        *self.eof.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

impl Transport for MockTransport {
    fn send(&self, buf: &[u8]) -> Result<()> {
        self.shared.sent.lock().unwrap().push(decode_sent_frame(buf));
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut incoming = self.incoming.lock().unwrap();

        while incoming.is_empty()
            && !*self.eof.lock().unwrap()
            && !self.closed.load(std::sync::atomic::Ordering::SeqCst)
        {
            incoming = self.cond.wait(incoming).unwrap();
        }

        if self.closed.load(std::sync::atomic::Ordering::SeqCst) || incoming.is_empty() {
            return Ok(0);
        }

        let n = buf.len().min(incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = incoming.pop_front().unwrap();
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
