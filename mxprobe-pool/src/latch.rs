use tokio::sync::watch;

/// A completion latch with a dynamic count.
///
/// The count starts above zero, [`done`](Self::done) releases one count, and
/// [`wait`](Self::wait) unblocks every waiter once the count reaches zero.
/// Unlike a plain wait group the count may be raised again after reaching
/// zero — a cache refresh re-arms the latch of its entry — so waiters that
/// arrive during a refresh block until that refresh completes.
#[derive(Debug)]
pub struct Latch {
    count: watch::Sender<u32>,
}

impl Latch {
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            count: watch::Sender::new(count),
        }
    }

    /// Raises the count by `n`.
    pub fn add(&self, n: u32) {
        self.count.send_modify(|count| *count += n);
    }

    /// Releases one count.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero; releasing an open latch is a
    /// bookkeeping bug in the owning pool.
    pub fn done(&self) {
        self.count.send_modify(|count| {
            *count = count.checked_sub(1).expect("latch released below zero");
        });
    }

    /// Whether the count is currently zero.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.count.borrow() == 0
    }

    /// Waits until the count reaches zero.
    pub async fn wait(&self) {
        let mut count = self.count.subscribe();
        // The sender lives as long as `self`, so the channel cannot close
        // from under the waiter.
        let _ = count.wait_for(|count| *count == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn open_latch_does_not_block() {
        let latch = Latch::new(0);
        assert!(latch.is_open());
        latch.wait().await;
    }

    #[tokio::test]
    async fn waiters_unblock_at_zero() {
        let latch = Arc::new(Latch::new(1));

        let waiter = tokio::spawn({
            let latch = Arc::clone(&latch);
            async move { latch.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        latch.done();
        waiter.await.unwrap();
        assert!(latch.is_open());
    }

    #[tokio::test]
    async fn count_can_be_raised_after_reaching_zero() {
        let latch = Latch::new(1);
        latch.done();
        assert!(latch.is_open());

        latch.add(1);
        assert!(!latch.is_open());

        latch.done();
        latch.wait().await;
    }
}
