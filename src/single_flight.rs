//! Coalescing of concurrent cache populations.
//!
//! The first request to miss on a key becomes the leader and performs the
//! origin fetch and store upload. Requests that miss on the same key while that
//! work is in flight join it and receive a clone of the leader's outcome.
//!
//! The ticket map is only locked for lookup-or-insert and removal, never across
//! an await point. Leader work runs on its own task, so a client that disconnects
//! does not cancel a populate other requests may be waiting on.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

type Tickets<K, T> = Arc<Mutex<HashMap<K, watch::Receiver<Option<T>>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

pub struct SingleFlight<K, T> {
    tickets: Tickets<K, T>,
}

/// Result of [`SingleFlight::acquire`].
pub enum Flight<K: Eq + Hash, T> {
    /// No populate was running for the key; the caller must run it and call
    /// [`FlightGuard::complete`].
    Leader(FlightGuard<K, T>),
    /// Another request is already populating the key.
    Follower(FlightWaiter<T>),
}

/// Held by the leader. Dropping it without completing releases the key and
/// wakes every waiter with no value.
pub struct FlightGuard<K: Eq + Hash, T> {
    key: K,
    sender: watch::Sender<Option<T>>,
    tickets: Tickets<K, T>,
    completed: bool,
}

pub struct FlightWaiter<T> {
    receiver: watch::Receiver<Option<T>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Become the leader for `key`, or join the populate already running for it.
    pub fn acquire(&self, key: K) -> Flight<K, T> {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);

        match tickets.entry(key) {
            Entry::Occupied(ticket) => Flight::Follower(FlightWaiter {
                receiver: ticket.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(None);
                let key = slot.key().clone();
                slot.insert(receiver);

                Flight::Leader(FlightGuard {
                    key,
                    sender,
                    tickets: Arc::clone(&self.tickets),
                    completed: false,
                })
            }
        }
    }

    /// Number of keys with a populate in flight.
    pub fn in_flight_count(&self) -> usize {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Clone + Eq + Hash + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Run `work` at most once per key at a time and wait for its outcome.
    ///
    /// `work` is only invoked when this caller becomes the leader; it is spawned
    /// so it completes even if the returned future is dropped. `None` means the
    /// leader's task ended without producing a value.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (FlightRole, Option<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        match self.acquire(key) {
            Flight::Leader(guard) => {
                let waiter = guard.subscribe();
                let work = work();
                tokio::spawn(async move {
                    let value = work.await;
                    guard.complete(value);
                });
                (FlightRole::Leader, waiter.wait().await)
            }
            Flight::Follower(waiter) => (FlightRole::Follower, waiter.wait().await),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, T> FlightGuard<K, T> {
    /// A waiter for the leader's own outcome.
    pub fn subscribe(&self) -> FlightWaiter<T> {
        FlightWaiter {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish the outcome to every waiter, then release the key so the next
    /// miss starts a fresh populate.
    pub fn complete(mut self, value: T) {
        self.completed = true;
        self.sender.send_replace(Some(value));
        self.release();
    }

    fn release(&self) {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        if !self.completed {
            self.release();
        }
    }
}

impl<T: Clone> FlightWaiter<T> {
    pub async fn wait(mut self) -> Option<T> {
        // The ticket map holds a receiver, so the sender outlives it only while
        // the guard is alive. A dropped guard surfaces here as an error.
        match self.receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}
