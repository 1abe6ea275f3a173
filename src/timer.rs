//! Named, self-cancelling timer handles (spec §9, "Timer soup")
//!
//! Every timer in the session — capture idle/max, barge-in assertion,
//! response silence watchdog, thought loop, and so on — is represented as a
//! [`TimerHandle`] stored on a named field. Scheduling a new deadline
//! cancels whatever was previously scheduled on that handle, and dropping
//! the handle aborts the backing task, so session teardown only has to
//! drop its `Timers`/`Capture` structs to guarantee every timer is
//! cancelled regardless of which exit path was taken.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// A single named timer. Not `Clone`: ownership of the backing task lives
/// here and nowhere else.
#[derive(Debug, Default)]
pub struct TimerHandle {
    handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Cancel any previously scheduled deadline on this handle and spawn a
    /// fresh one that sends `event` on `tx` after `delay`.
    pub fn schedule<E>(&mut self, delay_ms: u64, tx: mpsc::UnboundedSender<E>, event: E)
    where
        E: Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(event);
        }));
    }

    /// Cancel the in-flight deadline, if any. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_fires_and_sends_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TimerHandle::new();
        timer.schedule(100, tx, "fired");

        tokio::time::advance(Duration::from_millis(150)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event, "fired");
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_cancels_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TimerHandle::new();
        timer.schedule(100, tx.clone(), 1u32);
        timer.schedule(200, tx, 2u32);

        tokio::time::advance(Duration::from_millis(250)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        {
            let mut timer = TimerHandle::new();
            timer.schedule(100, tx, 1u32);
        }
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mut timer = TimerHandle::new();
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_scheduled());
    }
}
