//! The event bus proper: envelope, subscriptions, delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default retry budget for a handler.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default delay between handler retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A domain event travelling over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: uuid::Uuid,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    pub version: u32,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Event {
            event_id: uuid::Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: None,
            version: 1,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Handler execution priority. Lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn value(&self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SyncFn = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncFn),
    Async(AsyncFn),
}

#[derive(Clone)]
struct Subscription {
    name: String,
    handler: Handler,
    priority: Priority,
    retry_count: u32,
    retry_delay: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Priority-ordered pub/sub with per-handler retry and an in-memory
/// history ring for debugging.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Subscription>>>,
    history: Mutex<VecDeque<Event>>,
    max_history: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(1000)
    }

    pub fn with_history_capacity(max_history: usize) -> Self {
        EventBus {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    /// Subscribe a sync handler with the default retry budget.
    pub fn subscribe<F>(&self, event_type: &str, name: &str, priority: Priority, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(
            event_type,
            name,
            priority,
            DEFAULT_RETRY_COUNT,
            DEFAULT_RETRY_DELAY,
            handler,
        );
    }

    pub fn subscribe_with<F>(
        &self,
        event_type: &str,
        name: &str,
        priority: Priority,
        retry_count: u32,
        retry_delay: Duration,
        handler: F,
    ) where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(
            event_type,
            Subscription {
                name: name.to_string(),
                handler: Handler::Sync(Arc::new(handler)),
                priority,
                retry_count,
                retry_delay,
            },
        );
    }

    /// Subscribe an async handler with the default retry budget.
    pub fn subscribe_async<F, Fut>(
        &self,
        event_type: &str,
        name: &str,
        priority: Priority,
        handler: F,
    ) where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_async_with(
            event_type,
            name,
            priority,
            DEFAULT_RETRY_COUNT,
            DEFAULT_RETRY_DELAY,
            handler,
        );
    }

    pub fn subscribe_async_with<F, Fut>(
        &self,
        event_type: &str,
        name: &str,
        priority: Priority,
        retry_count: u32,
        retry_delay: Duration,
        handler: F,
    ) where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: AsyncFn = Arc::new(move |event| {
            let handler = handler.clone();
            Box::pin(async move { handler(event).await })
        });
        self.insert(
            event_type,
            Subscription {
                name: name.to_string(),
                handler: Handler::Async(boxed),
                priority,
                retry_count,
                retry_delay,
            },
        );
    }

    fn insert(&self, event_type: &str, subscription: Subscription) {
        let mut handlers = self.handlers.write();
        let subs = handlers.entry(event_type.to_string()).or_default();
        tracing::debug!(
            event_type = %event_type,
            handler = %subscription.name,
            priority = subscription.priority.value(),
            "subscribed event handler"
        );
        subs.push(subscription);
        // Stable sort keeps registration order within one priority.
        subs.sort_by_key(|s| s.priority.value());
    }

    /// Remove a named handler. Returns true if one was removed.
    pub fn unsubscribe(&self, event_type: &str, name: &str) -> bool {
        let mut handlers = self.handlers.write();
        if let Some(subs) = handlers.get_mut(event_type) {
            let before = subs.len();
            subs.retain(|s| s.name != name);
            return subs.len() < before;
        }
        false
    }

    /// Publish an event, running all handlers before returning.
    ///
    /// Sync handlers execute inline in priority order. Async handlers
    /// are spawned onto the current runtime fire-and-forget; outside a
    /// runtime they are skipped with a warning.
    pub fn publish(&self, event: Event) {
        self.remember(&event);
        let subs = self.snapshot(&event.event_type);
        if subs.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no handlers for event");
            return;
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            handlers = subs.len(),
            "publishing event"
        );

        for sub in subs {
            if matches!(sub.handler, Handler::Sync(_)) {
                run_sync_blocking(&sub, &event);
                continue;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let event = event.clone();
                    handle.spawn(async move { run_with_retry_async(&sub, &event).await });
                }
                Err(_) => {
                    tracing::warn!(
                        handler = %sub.name,
                        event_type = %event.event_type,
                        "async handler skipped: no runtime in blocking publish"
                    );
                }
            }
        }
    }

    /// Publish an event, awaiting every handler.
    ///
    /// Sync handlers run sequentially in priority order first; async
    /// handlers then run concurrently and are all awaited.
    pub async fn publish_async(&self, event: Event) {
        self.remember(&event);
        let subs = self.snapshot(&event.event_type);
        if subs.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no handlers for event");
            return;
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            handlers = subs.len(),
            "publishing async event"
        );

        let mut tasks = Vec::new();
        for sub in subs {
            if matches!(sub.handler, Handler::Sync(_)) {
                run_with_retry_async(&sub, &event).await;
                continue;
            }
            let event = event.clone();
            tasks.push(async move { run_with_retry_async(&sub, &event).await });
        }

        join_all(tasks).await;
    }

    fn snapshot(&self, event_type: &str) -> Vec<Subscription> {
        self.handlers
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn remember(&self, event: &Event) {
        let mut history = self.history.lock();
        history.push_back(event.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Recent events, newest last, optionally filtered by type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Handler count per event type.
    pub fn subscription_counts(&self) -> HashMap<String, usize> {
        self.handlers
            .read()
            .iter()
            .map(|(t, subs)| (t.clone(), subs.len()))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn run_sync_blocking(sub: &Subscription, event: &Event) {
    let Handler::Sync(f) = &sub.handler else { return };
    for attempt in 0..=sub.retry_count {
        match f(event) {
            Ok(()) => return,
            Err(e) if attempt < sub.retry_count => {
                tracing::warn!(
                    handler = %sub.name,
                    attempt = attempt + 1,
                    error = %e,
                    "event handler failed, retrying"
                );
                std::thread::sleep(sub.retry_delay);
            }
            Err(e) => {
                tracing::error!(
                    handler = %sub.name,
                    attempts = sub.retry_count + 1,
                    error = %e,
                    "event handler exhausted retries"
                );
            }
        }
    }
}

async fn run_with_retry_async(sub: &Subscription, event: &Event) {
    for attempt in 0..=sub.retry_count {
        let result = match &sub.handler {
            Handler::Sync(f) => f(event),
            Handler::Async(f) => f(event.clone()).await,
        };
        match result {
            Ok(()) => return,
            Err(e) if attempt < sub.retry_count => {
                tracing::warn!(
                    handler = %sub.name,
                    attempt = attempt + 1,
                    error = %e,
                    "event handler failed, retrying"
                );
                tokio::time::sleep(sub.retry_delay).await;
            }
            Err(e) => {
                tracing::error!(
                    handler = %sub.name,
                    attempts = sub.retry_count + 1,
                    error = %e,
                    "event handler exhausted retries"
                );
            }
        }
    }
}
