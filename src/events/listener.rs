//! Signer event listener with HTTP polling
//!
//! Scans the signing program's events slot by slot and broadcasts them to the
//! broker's dispatcher. The cursor only advances after a successful scan, so a
//! failed poll is retried from the same slot.

use super::ObservedEvent;
use crate::chain::SignerLogSource;
use crate::error::BridgeResult;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Scan position in the signer log
#[derive(Debug, Default)]
struct Cursor {
    /// Every event at or below this slot was broadcast
    slot: u64,
    /// Events of slot `slot + 1` already broadcast from a truncated page
    held: HashSet<String>,
}

pub struct SignerEventListener {
    source: Arc<dyn SignerLogSource>,
    event_tx: broadcast::Sender<ObservedEvent>,
    cursor: RwLock<Cursor>,
    poll_interval: Duration,
    events_per_poll: usize,
}

impl SignerEventListener {
    pub fn new(
        source: Arc<dyn SignerLogSource>,
        event_tx: broadcast::Sender<ObservedEvent>,
        poll_interval: Duration,
        events_per_poll: usize,
    ) -> Self {
        Self {
            source,
            event_tx,
            cursor: RwLock::new(Cursor::default()),
            poll_interval,
            events_per_poll,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservedEvent> {
        self.event_tx.subscribe()
    }

    /// Last slot whose events were all broadcast
    pub async fn last_processed_slot(&self) -> u64 {
        self.cursor.read().await.slot
    }

    /// Main listening loop
    pub async fn listen(&self) -> BridgeResult<()> {
        // Start at the tip; older events are reached by backfill
        let start = loop {
            match self.source.latest_slot().await {
                Ok(slot) => break slot,
                Err(e) => {
                    warn!("Failed to read signer log tip: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };
        *self.cursor.write().await = Cursor {
            slot: start,
            held: HashSet::new(),
        };
        info!("Signer event listener starting at slot {}", start);

        loop {
            if let Err(e) = self.poll_once().await {
                warn!("Signer event poll failed: {}", e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Fetch and broadcast events after the cursor. Returns how many were broadcast.
    ///
    /// A full page may stop partway through its newest slot. That slot is then
    /// queried again with the page widened by what was already broadcast from it.
    pub async fn poll_once(&self) -> BridgeResult<usize> {
        let mut cursor = self.cursor.write().await;
        let limit = self.events_per_poll + cursor.held.len();
        let events = self.source.events_since(cursor.slot, limit).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let boundary = cursor.slot + 1;
        let mut newest = cursor.slot;
        let mut broadcast_count = 0;
        for observed in &events {
            newest = newest.max(observed.slot);
            if observed.slot == boundary && cursor.held.contains(&observed.source_tx) {
                continue;
            }
            debug!(
                "Signer {} event for {} at slot {}",
                observed.event.name(),
                observed.event.request_id(),
                observed.slot
            );
            // No receivers is fine; the broker may not be attached yet
            let _ = self.event_tx.send(observed.clone());
            broadcast_count += 1;
        }

        if events.len() >= limit && newest > cursor.slot {
            let mut held: HashSet<String> = events
                .iter()
                .filter(|e| e.slot == newest)
                .map(|e| e.source_tx.clone())
                .collect();
            if newest == boundary {
                held.extend(cursor.held.drain());
            }
            cursor.slot = newest - 1;
            cursor.held = held;
        } else {
            cursor.slot = newest;
            cursor.held.clear();
        }

        crate::metrics::record_source_slot(cursor.slot);
        Ok(broadcast_count)
    }
}
