//! Credit-based flow controller (C5).
//!
//! A single integer credit pool, seeded by `START_ACK.initial_credits` and
//! replenished by `FRAME_ACK.credits_returned`. `acquire()` is the sole
//! backpressure point on the source (§5): the capture/encode/send task
//! blocks there when the sink stops returning credits.

use std::sync::Mutex;
use tokio::sync::Notify;

struct Inner {
    current: u32,
    maximum: u32,
    /// Set by `reset()`; wakes every waiter with no credit granted so they
    /// can observe shutdown and exit instead of blocking forever.
    closed: bool,
}

/// Credit-based flow control shared between a pipeline's send task (which
/// consumes) and its receive task (which returns credits from `FRAME_ACK`s).
pub struct FlowController {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FlowController {
    /// Creates a controller with zero credits; call [`Self::set_initial`]
    /// once the handshake negotiates a real value.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: 0,
                maximum: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Installs `n` as both the current and maximum credit count, and wakes
    /// any waiters that can now proceed. Called once, right after a
    /// successful `START_ACK`.
    pub fn set_initial(&self, n: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = n as u32;
        inner.maximum = n as u32;
        inner.closed = false;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Atomically decrements the credit count if at least one is available.
    /// Returns whether it did.
    pub fn try_consume(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.current >= 1 {
            inner.current -= 1;
            true
        } else {
            false
        }
    }

    /// Suspends until at least one credit is available, or the controller
    /// is reset. Does **not** consume a credit — call [`Self::try_consume`]
    /// afterwards. Returns `false` if woken by [`Self::reset`] rather than
    /// by an actual credit becoming available; callers should treat that as
    /// a cancellation signal.
    pub async fn acquire(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().unwrap();
                if inner.closed {
                    return false;
                }
                if inner.current >= 1 {
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Returns `n` credits, clamped so the total never exceeds the
    /// negotiated maximum, and wakes waiters that can now proceed.
    pub fn return_credits(&self, n: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = (inner.current + n as u32).min(inner.maximum);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Tears the controller down: current and maximum both go to zero, and
    /// every blocked `acquire()` wakes up and returns `false`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = 0;
        inner.maximum = 0;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Current available credit count.
    pub fn current(&self) -> u32 {
        self.inner.lock().unwrap().current
    }

    /// Negotiated maximum credit count.
    pub fn maximum(&self) -> u32 {
        self.inner.lock().unwrap().maximum
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_initial_then_consume_and_clamp_on_return() {
        let flow = FlowController::new();
        flow.set_initial(8);
        assert_eq!(flow.current(), 8);

        for _ in 0..8 {
            assert!(flow.try_consume());
        }
        assert!(!flow.try_consume());
        assert_eq!(flow.current(), 0);

        flow.return_credits(3);
        assert_eq!(flow.current(), 3);

        // Clamp: returning way more than maximum never exceeds it.
        flow.return_credits(100);
        assert_eq!(flow.current(), 8);
    }

    #[tokio::test]
    async fn acquire_blocks_until_a_credit_is_returned() {
        let flow = Arc::new(FlowController::new());
        flow.set_initial(1);
        assert!(flow.try_consume());
        assert_eq!(flow.current(), 0);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flow.return_credits(1);
        let acquired = waiter.await.unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn reset_unblocks_waiters_without_granting_credit() {
        let flow = Arc::new(FlowController::new());
        flow.set_initial(0);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flow.reset();
        let acquired = waiter.await.unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn credit_exhaustion_then_resume_e5() {
        // E5: initial_credits=2, three single-segment sends back to back
        // while the "ack task" is paused; the third blocks until a credit
        // returns, then all three are accounted for.
        let flow = Arc::new(FlowController::new());
        flow.set_initial(2);

        assert!(flow.acquire().await);
        assert!(flow.try_consume());
        assert!(flow.acquire().await);
        assert!(flow.try_consume());
        assert_eq!(flow.current(), 0);

        let third = {
            let flow = flow.clone();
            tokio::spawn(async move {
                let ok = flow.acquire().await;
                if ok {
                    flow.try_consume();
                }
                ok
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        flow.return_credits(1); // first FRAME_ACK arrives
        assert!(third.await.unwrap());
        assert_eq!(flow.current(), 0);

        flow.return_credits(1);
        flow.return_credits(1);
        flow.return_credits(1);
        assert_eq!(flow.current(), 2); // clamped at maximum
    }
}
