//! Catch-up subscriptions.
//!
//! History is read in batches from the checkpoint up to the end of the stream, then a
//! volatile subscription takes over. Live events are parked in a bounded queue while the
//! gap between the last historical read and the subscription's starting point is read,
//! and any later gap in event numbers is filled by reading the stream again.
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, TrySendError};
use log::{debug, info, warn};

use crate::{
    client::Client,
    error::{ClientError, ClientResult},
    event::{ResolvedEvent, SliceReadStatus},
    protocol::Credentials,
    settings::ConnectionSettings,
};

use super::{Dropped, HandlerError, SubscriptionDropReason, VolatileSubscription};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSettings {
    pub max_live_queue_size: usize,
    pub read_batch_size: usize,
    pub resolve_link_tos: bool,
}

impl Default for CatchUpSettings {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for CatchUpSettings {
    fn from(value: &ConnectionSettings) -> Self {
        Self {
            max_live_queue_size: value.max_live_queue_size,
            read_batch_size: value.read_batch_size,
            resolve_link_tos: false,
        }
    }
}

struct Shared {
    stream: String,
    stop: AtomicBool,
    live: AtomicBool,
    last_processed: Mutex<Option<i64>>,
    outcome: Mutex<Option<Dropped>>,
    live_subscription: Mutex<Option<VolatileSubscription>>,
    done: Receiver<()>,
}

/// Handle to a running catch-up subscription. Cheap to clone.
#[derive(Clone)]
pub struct CatchUpSubscription {
    shared: Arc<Shared>,
}

impl CatchUpSubscription {
    pub(crate) fn start<F>(
        client: Client,
        stream: String,
        checkpoint: Option<i64>,
        settings: CatchUpSettings,
        credentials: Option<Credentials>,
        handler: F,
    ) -> ClientResult<Self>
    where
        F: FnMut(&Self, &ResolvedEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let (done_tx, done) = crossbeam::channel::bounded::<()>(0);
        let subscription = Self {
            shared: Arc::new(Shared {
                stream: stream.clone(),
                stop: AtomicBool::new(false),
                live: AtomicBool::new(false),
                last_processed: Mutex::new(checkpoint),
                outcome: Mutex::new(None),
                live_subscription: Mutex::new(None),
                done,
            }),
        };

        let mut worker = Worker {
            client,
            subscription: subscription.clone(),
            settings,
            credentials,
            handler,
            last: checkpoint,
        };
        thread::Builder::new()
            .name(format!("eventlink-catchup-{stream}"))
            .spawn(move || {
                let _done = done_tx;
                let dropped = worker.run();
                worker.subscription.finish(dropped);
            })
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(subscription)
    }

    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    /// True once history has been processed and events come from the live subscription.
    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Number of the last event handed to the handler.
    pub fn last_processed_event_number(&self) -> Option<i64> {
        self.shared.last_processed.lock().ok().and_then(|last| *last)
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Ok(live) = self.shared.live_subscription.lock() {
            if let Some(live) = live.as_ref() {
                live.unsubscribe();
            }
        }
    }

    pub fn dropped(&self) -> Option<Dropped> {
        self.shared.outcome.lock().ok().and_then(|o| o.clone())
    }

    pub fn wait_dropped(&self, timeout: Duration) -> Option<Dropped> {
        match self.shared.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.dropped(),
            _ => None,
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn finish(&self, dropped: Dropped) {
        info!(
            "catch-up subscription on '{}' dropped: {:?}",
            self.shared.stream, dropped.reason
        );
        if let Ok(live) = self.shared.live_subscription.lock() {
            if let Some(live) = live.as_ref() {
                live.unsubscribe();
            }
        }
        if let Ok(mut outcome) = self.shared.outcome.lock() {
            *outcome = Some(dropped);
        }
    }
}

fn dropped(reason: SubscriptionDropReason, error: Option<ClientError>) -> Dropped {
    Dropped { reason, error }
}

struct Worker<F> {
    client: Client,
    subscription: CatchUpSubscription,
    settings: CatchUpSettings,
    credentials: Option<Credentials>,
    handler: F,
    last: Option<i64>,
}

impl<F> Worker<F>
where
    F: FnMut(&CatchUpSubscription, &ResolvedEvent) -> Result<(), HandlerError>,
{
    fn run(&mut self) -> Dropped {
        match self.catch_up() {
            Ok(()) => dropped(SubscriptionDropReason::Unsubscribed, None),
            Err(dropped) => dropped,
        }
    }

    fn catch_up(&mut self) -> Result<(), Dropped> {
        let stream = self.subscription.stream().to_string();
        debug!("catch-up on '{stream}' reading from {:?}", self.last);
        self.read_history(None)?;

        let (live_tx, live_rx) = crossbeam::channel::bounded(self.settings.max_live_queue_size);
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflowed);
        let live = self
            .client
            .subscribe_to_stream(
                &stream,
                self.settings.resolve_link_tos,
                self.credentials.clone(),
                move |_, event| match live_tx.try_send(event.clone()) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        overflow_flag.store(true, Ordering::Release);
                        Err("live queue overflow".into())
                    }
                    Err(TrySendError::Disconnected(_)) => Err("catch-up stopped".into()),
                },
            )
            .map_err(|e| dropped(SubscriptionDropReason::CatchUpError, Some(e)))?;

        let subscribed_at = live.last_event_number();
        if let Ok(mut slot) = self.subscription.shared.live_subscription.lock() {
            *slot = Some(live.clone());
        }
        if self.subscription.is_stopped() {
            return Ok(());
        }

        self.read_history(subscribed_at)?;
        self.subscription.shared.live.store(true, Ordering::Release);
        info!("catch-up on '{stream}' is live after {:?}", self.last);

        loop {
            if self.subscription.is_stopped() {
                return Ok(());
            }
            match live_rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.on_live_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if overflowed.load(Ordering::Acquire) {
                        return Err(dropped(SubscriptionDropReason::ProcessingQueueOverflow, None));
                    }
                    return Err(live.dropped().unwrap_or_else(|| {
                        dropped(SubscriptionDropReason::ConnectionClosed, None)
                    }));
                }
            }
        }
    }

    fn on_live_event(&mut self, event: ResolvedEvent) -> Result<(), Dropped> {
        let number = event.original_event_number();
        let next = self.last.map_or(0, |n| n + 1);
        if number < next {
            return Ok(());
        }
        if number > next {
            debug!("gap before {number} on '{}', re-reading", self.subscription.stream());
            self.read_history(Some(number - 1))?;
            if self.last.is_some_and(|last| number <= last) {
                return Ok(());
            }
        }
        self.process(&event)
    }

    /// Reads forward from the last processed event up to `until` (inclusive) or the end
    /// of the stream.
    fn read_history(&mut self, until: Option<i64>) -> Result<(), Dropped> {
        let batch = self.settings.read_batch_size.max(1);
        let mut from = self.last.map_or(0, |n| n + 1);
        loop {
            if self.subscription.is_stopped() {
                return Ok(());
            }
            if until.is_some_and(|until| from > until) {
                return Ok(());
            }
            let slice = self
                .client
                .read_stream_events_forward(
                    self.subscription.stream(),
                    from,
                    batch,
                    self.settings.resolve_link_tos,
                    self.credentials.clone(),
                )
                .map_err(|e| dropped(SubscriptionDropReason::CatchUpError, Some(e)))?;

            match slice.status {
                SliceReadStatus::Success => {}
                SliceReadStatus::StreamNotFound => return Ok(()),
                SliceReadStatus::StreamDeleted => {
                    let error = ClientError::StreamDeleted(slice.stream);
                    return Err(dropped(SubscriptionDropReason::CatchUpError, Some(error)));
                }
            }

            for event in &slice.events {
                let number = event.original_event_number();
                if until.is_some_and(|until| number > until) {
                    return Ok(());
                }
                if self.last.is_some_and(|last| number <= last) {
                    continue;
                }
                self.process(event)?;
            }
            if slice.is_end_of_stream {
                return Ok(());
            }
            from = slice.next_event_number;
        }
    }

    fn process(&mut self, event: &ResolvedEvent) -> Result<(), Dropped> {
        if let Err(e) = (self.handler)(&self.subscription, event) {
            warn!("catch-up handler on '{}' failed: {e}", self.subscription.stream());
            return Err(dropped(
                SubscriptionDropReason::EventHandlerError,
                Some(ClientError::EventHandler(e.to_string())),
            ));
        }
        let number = event.original_event_number();
        self.last = Some(number);
        if let Ok(mut last) = self.subscription.shared.last_processed.lock() {
            *last = Some(number);
        }
        Ok(())
    }
}
