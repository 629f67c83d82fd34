use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::error::CacheError;
use crate::utils::defer;

type CallResult<V> = Result<V, CacheError>;

// Inner result channel shared between all waiters of one in-flight call.
type CallChannel<V> = Shared<oneshot::Receiver<CallResult<V>>>;

/// Deduplicates concurrent executions per key.
///
/// For any key there is at most one in-flight computation at any instant.
/// The first caller spawns it as a detached task and every concurrent caller
/// for the same key subscribes to its result channel instead of starting a
/// second execution. Once the result is sent, the in-flight record is gone;
/// a later call starts a fresh execution.
///
/// Dropping a waiter abandons only that waiter: the computation runs on its
/// own task and completes for everyone else regardless.
pub struct CallGroup<K, V> {
    calls: Arc<Mutex<HashMap<K, CallChannel<V>>>>,
}

impl<K, V> Clone for CallGroup<K, V> {
    fn clone(&self) -> Self {
        CallGroup {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<K, V> Default for CallGroup<K, V> {
    fn default() -> Self {
        CallGroup {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> CallGroup<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `computation` for `key` unless one is already in flight, and
    /// waits for the shared result.
    ///
    /// The returned flag is `true` when this caller piggy-backed on another
    /// caller's execution rather than triggering it. On a piggy-backed call
    /// the passed future is dropped without ever being polled.
    pub async fn run<Fut>(&self, key: K, computation: Fut) -> (CallResult<V>, bool)
    where
        Fut: Future<Output = CallResult<V>> + Send + 'static,
    {
        let (channel, shared) = {
            let mut calls = self.calls.lock().unwrap();
            if let Some(channel) = calls.get(&key) {
                (channel.clone(), true)
            } else {
                let channel = self.spawn_call(key.clone(), computation);
                calls.insert(key, channel.clone());
                (channel, false)
            }
        };

        let result = channel.await.unwrap_or(Err(CacheError::Dropped));
        (result, shared)
    }

    /// Spawns the computation as a detached task and returns the channel
    /// carrying its result.
    ///
    /// The in-flight record is evicted *before* the result is sent, so late
    /// arrivers either join a channel that will still receive data, or start
    /// a new call. Eviction also happens when the task dies without sending,
    /// in which case waiters observe a closed channel.
    fn spawn_call<Fut>(&self, key: K, computation: Fut) -> CallChannel<V>
    where
        Fut: Future<Output = CallResult<V>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let calls = Arc::clone(&self.calls);
        let evict_guard = defer(move || {
            calls.lock().unwrap().remove(&key);
        });

        let call = async move {
            let result = computation.await;
            drop(evict_guard);
            sender.send(result).ok();
        };
        tokio::spawn(call);

        receiver.shared()
    }
}
