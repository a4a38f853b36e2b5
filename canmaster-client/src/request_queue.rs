//! FIFO serialization of SDO transactions
//!
//! Each transaction takes a ticket, numbered in submission order, and may only talk to the
//! server while its ticket is at the head of the queue. Dropping the ticket, on completion,
//! failure or cancellation, releases the head.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    next: u64,
    waiting: VecDeque<u64>,
}

/// A queue of tickets served in the order they were issued
#[derive(Debug, Default)]
pub(crate) struct TicketQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// A place in a [`TicketQueue`]
#[derive(Debug)]
pub(crate) struct Ticket<'a> {
    queue: &'a TicketQueue,
    number: u64,
}

impl Ticket<'_> {
    /// The ticket number
    pub fn number(&self) -> u64 {
        self.number
    }
}

impl TicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a ticket and wait until it reaches the head of the queue
    pub async fn acquire(&self) -> Ticket<'_> {
        let ticket = {
            let mut state = self.lock();
            let number = state.next;
            state.next += 1;
            state.waiting.push_back(number);
            Ticket {
                queue: self,
                number,
            }
        };

        loop {
            // Register before checking, so a release between the check and the await is not lost
            let notified = self.notify.notified();
            if self.lock().waiting.front() == Some(&ticket.number) {
                return ticket;
            }
            notified.await;
        }
    }

    /// The number of tickets waiting or active
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        if let Some(pos) = state.waiting.iter().position(|n| *n == self.number) {
            state.waiting.remove(pos);
        }
        drop(state);
        self.queue.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_tickets_increase() {
        let queue = TicketQueue::new();
        let a = queue.acquire().await.number();
        let b = queue.acquire().await.number();
        assert!(b > a);
        assert_eq!(0, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let queue = Arc::new(TicketQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = queue.acquire().await;

        let mut tasks = Vec::new();
        for n in 0..3 {
            let queue = queue.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let _ticket = queue.acquire().await;
                log.lock().unwrap().push(n);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }));
            // Let the task take its ticket before the next one is spawned
            tokio::task::yield_now().await;
        }

        assert_eq!(4, queue.len());
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(vec![0, 1, 2], *log.lock().unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let queue = TicketQueue::new();
        let head = queue.acquire().await;
        {
            let waiter = queue.acquire();
            futures::pin_mut!(waiter);
            assert!(futures::poll!(waiter.as_mut()).is_pending());
            assert_eq!(2, queue.len());
        }
        assert_eq!(1, queue.len());
        drop(head);
        assert_eq!(0, queue.len());
    }
}
