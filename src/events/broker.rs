//! Event subscription broker
//!
//! One subscription per request id, shared by every concurrent caller. Each
//! subscription owns a pair of single-assignment futures; whichever producer
//! (live listener or backfill scan) delivers an event first resolves them, and
//! later deliveries are dropped.
//!
//! Subscriptions are reference counted and also expire after a maximum age so
//! abandoned sagas cannot leak entries.

use super::{EventOrigin, ObservedEvent, ReadResponseEvent, SignatureEvent, SignerEvent};
use crate::chain::SignerLogSource;
use crate::crypto::RequestId;
use crate::error::BridgeResult;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Resolves to the event, or `None` if the subscription was torn down first
pub type EventFuture<T> = Shared<BoxFuture<'static, Option<T>>>;

/// Futures handed to every subscriber of one request id
#[derive(Clone)]
pub struct EventPromises {
    pub signature: EventFuture<SignatureEvent>,
    pub read_response: EventFuture<ReadResponseEvent>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Subscriptions older than this are swept regardless of subscriber count
    pub max_subscription_age: Duration,
    /// Number of recent signer-program transactions a backfill scan covers
    pub backfill_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_subscription_age: Duration::from_millis(7_200_000),
            backfill_limit: 100,
        }
    }
}

struct Subscription {
    signature_tx: Option<oneshot::Sender<SignatureEvent>>,
    read_response_tx: Option<oneshot::Sender<ReadResponseEvent>>,
    promises: EventPromises,
    subscribers: usize,
    created_at: Instant,
}

impl Subscription {
    fn new() -> Self {
        let (signature_tx, signature_rx) = oneshot::channel();
        let (read_response_tx, read_response_rx) = oneshot::channel();

        Self {
            signature_tx: Some(signature_tx),
            read_response_tx: Some(read_response_tx),
            promises: EventPromises {
                signature: signature_rx.map(Result::ok).boxed().shared(),
                read_response: read_response_rx.map(Result::ok).boxed().shared(),
            },
            subscribers: 0,
            created_at: Instant::now(),
        }
    }
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub request_id: RequestId,
    pub subscribers: usize,
    pub age: Duration,
    pub signature_received: bool,
    pub read_response_received: bool,
}

pub struct EventSubscriptionBroker {
    subscriptions: DashMap<RequestId, Subscription>,
    log_source: Option<Arc<dyn SignerLogSource>>,
    config: BrokerConfig,
}

impl EventSubscriptionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            subscriptions: DashMap::new(),
            log_source: None,
            config,
        }
    }

    /// Attach the signer-program log source used for backfill scans
    pub fn with_log_source(mut self, source: Arc<dyn SignerLogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    /// Register interest in `request_id`, reusing an existing subscription if present
    pub fn subscribe(&self, request_id: RequestId) -> EventPromises {
        let promises = {
            let mut entry = self
                .subscriptions
                .entry(request_id)
                .or_insert_with(Subscription::new);
            entry.subscribers += 1;
            debug!(
                "Subscribed to {} ({} subscribers)",
                request_id, entry.subscribers
            );
            entry.promises.clone()
        };
        self.update_gauge();
        promises
    }

    /// Drop one subscriber; the subscription is removed when none remain
    pub fn unsubscribe(&self, request_id: RequestId) {
        if let Some(mut entry) = self.subscriptions.get_mut(&request_id) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
        }
        if self
            .subscriptions
            .remove_if(&request_id, |_, s| s.subscribers == 0)
            .is_some()
        {
            debug!("Subscription {} released", request_id);
        }
        self.update_gauge();
    }

    /// Remove the subscription regardless of how many subscribers hold it
    pub fn force_cleanup(&self, request_id: RequestId) {
        if self.subscriptions.remove(&request_id).is_some() {
            debug!("Subscription {} force-removed", request_id);
        }
        self.update_gauge();
    }

    /// Deliver an event. Returns true if it resolved a pending future.
    pub fn dispatch(&self, event: SignerEvent, origin: EventOrigin) -> bool {
        let request_id = event.request_id();
        let kind = event.name();

        let delivered = match self.subscriptions.get_mut(&request_id) {
            Some(mut subscription) => match event {
                SignerEvent::Signature(e) => match subscription.signature_tx.take() {
                    Some(tx) => tx.send(e).is_ok(),
                    None => false,
                },
                SignerEvent::ReadResponse(e) => match subscription.read_response_tx.take() {
                    Some(tx) => tx.send(e).is_ok(),
                    None => false,
                },
            },
            None => return false,
        };

        if delivered {
            debug!("{} event for {} delivered via {}", kind, request_id, origin.as_str());
            crate::metrics::record_event_dispatched(kind, origin.as_str());
        } else {
            debug!("Duplicate {} event for {} ignored", kind, request_id);
            crate::metrics::record_duplicate_event(kind);
        }
        delivered
    }

    /// Scan recent signer-program transactions and deliver anything still pending.
    /// Returns the number of futures resolved.
    pub async fn backfill(&self, request_id: RequestId) -> BridgeResult<usize> {
        let Some(source) = &self.log_source else {
            return Ok(0);
        };
        if !self.is_waiting(request_id) {
            return Ok(0);
        }

        let events = source.recent_events(self.config.backfill_limit).await?;
        let mut resolved = 0;
        for observed in events {
            if observed.event.request_id() != request_id {
                continue;
            }
            if self.dispatch(observed.event, EventOrigin::Backfill) {
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!("Backfill resolved {} event(s) for {}", resolved, request_id);
        }
        Ok(resolved)
    }

    fn is_waiting(&self, request_id: RequestId) -> bool {
        self.subscriptions
            .get(&request_id)
            .map(|s| s.signature_tx.is_some() || s.read_response_tx.is_some())
            .unwrap_or(false)
    }

    /// Remove subscriptions older than the maximum age. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let max_age = self.config.max_subscription_age;
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, s| s.created_at.elapsed() < max_age);
        let removed = before.saturating_sub(self.subscriptions.len());

        if removed > 0 {
            info!("Swept {} expired subscription(s)", removed);
        }
        self.update_gauge();
        removed
    }

    /// Forward live events from the listener channel until it closes
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ObservedEvent>,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(observed) => {
                        broker.dispatch(observed.event, EventOrigin::Live);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Skipped events stay recoverable through backfill
                        warn!("Event dispatcher lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Event dispatcher stopped");
        })
    }

    /// Run `sweep_expired` every `interval`
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.sweep_expired();
            }
        })
    }

    pub fn active_subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscription(&self, request_id: RequestId) -> Option<SubscriptionSnapshot> {
        self.subscriptions.get(&request_id).map(|s| SubscriptionSnapshot {
            request_id,
            subscribers: s.subscribers,
            age: s.created_at.elapsed(),
            signature_received: s.signature_tx.is_none(),
            read_response_received: s.read_response_tx.is_none(),
        })
    }

    /// Drop every subscription; pending futures resolve to `None`
    pub fn shutdown(&self) {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        self.update_gauge();
        info!("Event broker shut down, {} subscription(s) cleared", count);
    }

    fn update_gauge(&self) {
        crate::metrics::set_active_subscriptions(self.subscriptions.len());
    }
}
