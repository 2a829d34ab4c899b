//! # Sync Session
//!
//! Background tasks that keep a [`Tracker`] in step with its backend:
//!
//! - the feed loop: one task consuming the device, location and geofence
//!   feeds, so all merges for an owner happen in a single logical sequence.
//!   A feed that fails or ends is resubscribed with exponential backoff.
//! - the staleness sweep, on the same loop.
//! - the alert writer: persists derived alerts off the hot path.
//!
//! All three feeds share one cancellation token and are torn down together.

use std::pin::Pin;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconnectConfig;
use crate::error::TrackerError;
use crate::facade::Tracker;
use tracker_feed::{FeedError, FeedEvent, FeedStream};

/// Queued alert writes before new ones are dropped
const ALERT_QUEUE_CAPACITY: usize = 256;

/// Handle to the running background tasks
pub(crate) struct Session {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start the alert writer, seed state from one-shot reads, then spawn
    /// the feed loop. Seeding failures are logged; the feeds catch up later.
    pub(crate) async fn start(tracker: Tracker) -> Self {
        let cancel = CancellationToken::new();
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_QUEUE_CAPACITY);
        tracker.install_alert_sink(Some(alert_tx));
        let writer = tokio::spawn(alert_writer(tracker.clone(), alert_rx, cancel.clone()));

        // Subscribe before seeding so nothing written in between is missed
        let feeds = Feeds::subscribe(&tracker, tracker.config().reconnect.clone());
        seed(&tracker).await;
        let reader = tokio::spawn(feed_loop(tracker, feeds, cancel.clone()));

        Self {
            cancel,
            tasks: vec![reader, writer],
        }
    }

    /// Cancel every task and wait for them to finish
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }
    }
}

async fn seed(tracker: &Tracker) {
    let backend = tracker.backend().clone();
    let scope = tracker.scope().clone();

    match backend.fetch_geofences(&scope).await {
        Ok(rows) => {
            for raw in rows {
                tracker.apply_geofence_event(FeedEvent::Upsert(raw)).await;
            }
        }
        Err(e) => warn!(error = %e, "initial geofence fetch failed"),
    }

    match backend.fetch_devices(&scope).await {
        Ok(rows) => {
            for raw in rows {
                tracker.apply_device_event(FeedEvent::Upsert(raw)).await;
            }
        }
        Err(e) => warn!(error = %e, "initial device fetch failed"),
    }

    match backend
        .fetch_locations(&scope, tracker.config().history_window)
        .await
    {
        // Newest first from the backend; replay oldest first
        Ok(rows) => {
            for raw in rows.into_iter().rev() {
                tracker.apply_location_event(raw).await;
            }
        }
        Err(e) => warn!(error = %e, "initial location fetch failed"),
    }
}

// =============================================================================
// FEED SLOTS
// =============================================================================

type Subscribe<T> = Box<dyn Fn() -> FeedStream<T> + Send>;

/// What a slot produced
enum Signal<T> {
    Item(T),
    Failed(Option<FeedError>),
    Resubscribe,
}

/// One feed and its reconnection state
struct FeedSlot<T> {
    name: &'static str,
    subscribe: Subscribe<T>,
    stream: Option<FeedStream<T>>,
    retry: Option<Pin<Box<Sleep>>>,
    attempt: u32,
}

impl<T> FeedSlot<T> {
    fn new(name: &'static str, subscribe: Subscribe<T>) -> Self {
        let stream = Some(subscribe());
        Self {
            name,
            subscribe,
            stream,
            retry: None,
            attempt: 0,
        }
    }

    /// Next signal. Cancel-safe: dropping the future loses nothing.
    async fn next(&mut self) -> Signal<T> {
        if let Some(stream) = self.stream.as_mut() {
            return match stream.next().await {
                Some(Ok(item)) => {
                    self.attempt = 0;
                    Signal::Item(item)
                }
                Some(Err(e)) => Signal::Failed(Some(e)),
                None => Signal::Failed(None),
            };
        }
        if let Some(delay) = self.retry.as_mut() {
            delay.await;
            self.retry = None;
            return Signal::Resubscribe;
        }
        std::future::pending().await
    }

    fn fail(&mut self, error: Option<FeedError>, reconnect: &ReconnectConfig) {
        let delay = reconnect.delay(self.attempt);
        match error {
            Some(e) => warn!(
                feed = self.name,
                error = %e,
                attempt = self.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "feed failed, resubscribing after backoff"
            ),
            None => info!(feed = self.name, attempt = self.attempt, "feed ended, resubscribing"),
        }
        self.stream = None;
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
        self.attempt = self.attempt.saturating_add(1);
    }

    fn resubscribe(&mut self) {
        debug!(feed = self.name, "resubscribing");
        self.stream = Some((self.subscribe)());
    }
}

struct Feeds {
    devices: FeedSlot<FeedEvent<tracker_feed::RawDeviceEvent>>,
    locations: FeedSlot<tracker_feed::RawLocationEvent>,
    geofences: FeedSlot<FeedEvent<tracker_feed::RawGeofenceEvent>>,
    reconnect: ReconnectConfig,
}

impl Feeds {
    fn subscribe(tracker: &Tracker, reconnect: ReconnectConfig) -> Self {
        let (b, s) = (tracker.backend().clone(), tracker.scope().clone());
        let devices = FeedSlot::new("devices", Box::new(move || b.subscribe_devices(&s)));

        let (b, s) = (tracker.backend().clone(), tracker.scope().clone());
        let locations = FeedSlot::new("locations", Box::new(move || b.subscribe_locations(&s)));

        let (b, s) = (tracker.backend().clone(), tracker.scope().clone());
        let geofences = FeedSlot::new("geofences", Box::new(move || b.subscribe_geofences(&s)));

        Self {
            devices,
            locations,
            geofences,
            reconnect,
        }
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

/// Single consumer of all three feeds plus the staleness sweep
async fn feed_loop(tracker: Tracker, mut feeds: Feeds, cancel: CancellationToken) {
    let mut sweep = tokio::time::interval(tracker.config().sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            signal = feeds.devices.next() => match signal {
                Signal::Item(event) => tracker.apply_device_event(event).await,
                Signal::Failed(e) => feeds.devices.fail(e, &feeds.reconnect),
                Signal::Resubscribe => feeds.devices.resubscribe(),
            },
            signal = feeds.locations.next() => match signal {
                Signal::Item(raw) => tracker.apply_location_event(raw).await,
                Signal::Failed(e) => feeds.locations.fail(e, &feeds.reconnect),
                Signal::Resubscribe => feeds.locations.resubscribe(),
            },
            signal = feeds.geofences.next() => match signal {
                Signal::Item(event) => tracker.apply_geofence_event(event).await,
                Signal::Failed(e) => feeds.geofences.fail(e, &feeds.reconnect),
                Signal::Resubscribe => feeds.geofences.resubscribe(),
            },
            _ = sweep.tick() => tracker.sweep(Utc::now()).await,
        }
    }

    // Dropping the slots unsubscribes all three feeds at once
    drop(feeds);
    debug!(scope = %tracker.scope(), "feed loop exiting");
}

/// Persist derived alerts; failures are logged, never fatal
async fn alert_writer(tracker: Tracker, mut rx: mpsc::Receiver<Uuid>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            id = rx.recv() => {
                let Some(id) = id else { break };
                match tracker.persist_alert(id).await {
                    Ok(()) => debug!(alert_id = %id, "alert persisted"),
                    Err(TrackerError::NotFound { .. }) => {
                        debug!(alert_id = %id, "alert dropped before it was persisted");
                    }
                    Err(e) => warn!(alert_id = %id, error = %e, "alert persistence failed"),
                }
            }
        }
    }
}
