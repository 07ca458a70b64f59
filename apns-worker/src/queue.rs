//! The claimable notification queue: the producer->sender channel and the
//! post-rejection replay log rolled into one structure.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::message::{Message, Notification};
use crate::result::{Error, Result};

/// Supplies the current instant. Exists so tests can substitute a fake clock
/// to exercise the grace window deterministically; the production default
/// (`SystemClock`) just wraps `Instant::now`.
///
/// This clock is used only for internal deadlines (the grace window). The
/// wall-clock instant that goes on the wire as a message's `expiration` is
/// captured once at [`Message`] construction and is independent of this
/// trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default [`Clock`], backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct QueuedNotification {
    notification: Notification,
    expires: Option<Instant>,
}

impl QueuedNotification {
    fn is_claimed(&self) -> bool {
        self.expires.is_some()
    }
}

struct Inner {
    queue: VecDeque<QueuedNotification>,
    next: usize,
    next_ident: u32,
    auto_purge_at: Instant,
    terminated: bool,
    /// Set by the engine's reader thread to wake a writer thread that is
    /// idle (blocked in [`NotificationQueue::wait_and_claim`] with nothing
    /// to claim) so it can exit before a reconnect, without tearing down
    /// the whole queue the way `terminated` does. Cleared before each new
    /// writer is spawned.
    writer_stop: bool,
}

/// An ordered, claimable buffer of pending notifications.
///
/// Entries at `[0, next)` are claimed (currently on the wire, or presumed
/// delivered but not yet purged); entries at `[next, len)` are unclaimed and
/// waiting for the writer. `backtrack` is the only operation that can pop
/// from the claimed region out of expiration order, since it must undo a
/// whole run of presumed-in-flight notifications at once.
pub struct NotificationQueue {
    grace: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl NotificationQueue {
    pub fn new(grace: Duration) -> Self {
        Self::with_clock(grace, Arc::new(SystemClock))
    }

    pub fn with_clock(grace: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();

        Self {
            grace,
            clock,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                next: 0,
                next_ident: 0,
                auto_purge_at: now + grace,
                terminated: false,
                writer_stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Expands `message` into one notification per token, assigning fresh
    /// identifiers, and appends them to the unclaimed tail.
    pub fn append(&self, message: Arc<Message>) -> Result<()> {
        {
            let mut inner = self.lock()?;

            for encoded_token in &message.encoded_tokens {
                let ident = inner.next_ident;
                inner.next_ident = inner.next_ident.wrapping_add(1);

                inner.queue.push_back(QueuedNotification {
                    notification: Notification {
                        message: message.clone(),
                        encoded_token: *encoded_token,
                        ident: Some(ident),
                    },
                    expires: None,
                });
            }

            self.cond.notify_all();
        }

        self.auto_purge()?;

        Ok(())
    }

    /// Claims the next unclaimed notification, if any.
    pub fn claim(&self) -> Result<Option<Notification>> {
        let mut inner = self.lock()?;

        if inner.next < inner.queue.len() {
            let now = self.clock.now();
            let expires = now + self.grace;
            let idx = inner.next;
            inner.queue[idx].expires = Some(expires);
            inner.next += 1;

            Ok(Some(inner.queue[idx].notification.clone()))
        } else {
            Ok(None)
        }
    }

    /// Restores the most recently claimed notification to the unclaimed
    /// region. Returns `true` if `notification` was in fact the most
    /// recently claimed entry.
    pub fn unclaim(&self, notification: &Notification) -> Result<bool> {
        let mut inner = self.lock()?;

        if inner.next == 0 {
            return Ok(false);
        }

        let idx = inner.next - 1;
        if inner.queue[idx].notification == *notification {
            inner.queue[idx].expires = None;
            inner.next -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Rewinds the queue after a server error frame.
    ///
    /// Searches the claimed region backwards from `next - 1` for `ident`.
    /// Everything up to and including the match is now known to have
    /// succeeded, failed permanently, or (if no match is found at all) is
    /// simply unaccounted for; either way it's dropped. Everything after the
    /// match is re-queued for replay by clearing its `expires` and resetting
    /// `next` to zero.
    pub fn backtrack(&self, ident: u32) -> Result<Option<Notification>> {
        let mut inner = self.lock()?;

        let mut i = if inner.next > 0 { inner.next - 1 } else { 0 };
        while i > 0 && inner.queue[i].notification.ident != Some(ident) {
            i -= 1;
        }

        let found = i < inner.queue.len() && inner.queue[i].notification.ident == Some(ident);

        let result = if found {
            Some(inner.queue[i].notification.clone())
        } else {
            None
        };

        let drop_count = if found { i + 1 } else { 0 };

        for _ in 0..drop_count {
            inner.queue.pop_front();
        }

        for item in inner.queue.iter_mut() {
            item.expires = None;
        }

        inner.next = 0;

        self.cond.notify_all();

        Ok(result)
    }

    /// Drops every claimed notification at the front whose grace window has
    /// elapsed. Returns a recommended number of seconds to wait before
    /// calling again (never less than 1.0).
    pub fn purge_expired(&self) -> Result<f64> {
        let mut inner = self.lock()?;

        let now = self.clock.now();

        while let Some(front) = inner.queue.front() {
            if front.is_claimed() && front.expires.unwrap() <= now {
                inner.queue.pop_front();
                inner.next -= 1;
            } else {
                break;
            }
        }

        let delay = match inner.queue.front() {
            Some(front) if front.is_claimed() => {
                (front.expires.unwrap() - now).as_secs_f64()
            }
            _ => self.grace.as_secs_f64(),
        };

        Ok(delay.max(1.0))
    }

    pub fn has_unclaimed(&self) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.next < inner.queue.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.queue.is_empty())
    }

    /// Blocks until the queue has an unclaimed notification or termination is
    /// requested. Returns `false` if woken by termination.
    pub fn wait_for_unclaimed(&self) -> Result<bool> {
        let mut inner = self.lock()?;

        while !inner.terminated && inner.next >= inner.queue.len() {
            inner = self
                .cond
                .wait(inner)
                .map_err(|_| Error::Poisoned)?;
        }

        Ok(!inner.terminated)
    }

    /// Blocks until a notification can be claimed, termination is
    /// requested, or the current writer is told to stop (see
    /// [`Self::signal_writer_stop`]).
    pub fn wait_and_claim(&self) -> Result<Option<Notification>> {
        let mut inner = self.lock()?;

        loop {
            if inner.terminated || inner.writer_stop {
                return Ok(None);
            }

            if inner.next < inner.queue.len() {
                let now = self.clock.now();
                let idx = inner.next;
                inner.queue[idx].expires = Some(now + self.grace);
                inner.next += 1;
                return Ok(Some(inner.queue[idx].notification.clone()));
            }

            inner = self.cond.wait(inner).map_err(|_| Error::Poisoned)?;
        }
    }

    /// Clears the per-cycle writer-stop flag before the reader spawns a new
    /// writer thread.
    pub fn reset_writer_stop(&self) -> Result<()> {
        self.lock()?.writer_stop = false;
        Ok(())
    }

    /// Wakes a writer thread blocked in [`Self::wait_and_claim`] so it
    /// exits even though nothing is unclaimed, letting the reader thread
    /// join it before reconnecting.
    pub fn signal_writer_stop(&self) -> Result<()> {
        self.lock()?.writer_stop = true;
        self.cond.notify_all();
        Ok(())
    }

    pub fn request_termination(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.terminated = true;
        self.cond.notify_all();
        Ok(())
    }

    pub fn is_terminated(&self) -> Result<bool> {
        Ok(self.lock()?.terminated)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn auto_purge(&self) -> Result<()> {
        let now = self.clock.now();

        let should_purge = {
            let inner = self.lock()?;
            now > inner.auto_purge_at
        };

        if should_purge {
            let delay = self.purge_expired()?;
            let mut inner = self.lock()?;
            inner.auto_purge_at = now + Duration::from_secs_f64(delay);
        }

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::Poisoned)
    }
}
