//! Job lifecycle event stream
//!
//! One broadcast channel per app. Sequence numbers are assigned and the
//! event is sent while the app's entry is locked, so every subscriber sees
//! an app's events in sequence order. Subscribers only see events published
//! after they attach.
//!
//! Each subscriber's backlog is bounded by the channel capacity. A
//! subscriber that falls further behind either skips the oldest events or
//! is disconnected with [`ShipyardError::StreamOverflow`], depending on
//! [`OverflowPolicy`].

use crate::config::schema::{EventsConfig, OverflowPolicy};
use crate::error::{ShipyardError, ShipyardResult};
use crate::scheduler::JobState;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};
use uuid::Uuid;

/// One job state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub app_id: Uuid,
    pub job_id: Uuid,
    pub release_id: Uuid,
    pub process_type: String,
    pub state: JobState,
    /// Per-app, strictly increasing from 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Narrows a subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub process_type: Option<String>,
    pub job_id: Option<Uuid>,
}

impl EventFilter {
    pub fn process_type(process_type: impl Into<String>) -> Self {
        Self {
            process_type: Some(process_type.into()),
            job_id: None,
        }
    }

    fn matches(&self, event: &JobEvent) -> bool {
        self.process_type
            .as_deref()
            .is_none_or(|t| t == event.process_type)
            && self.job_id.is_none_or(|id| id == event.job_id)
    }
}

struct Channel {
    sender: broadcast::Sender<JobEvent>,
    next_seq: u64,
}

/// Per-app pub/sub of job events
pub struct EventStream {
    capacity: usize,
    overflow: OverflowPolicy,
    channels: Mutex<HashMap<Uuid, Channel>>,
}

impl EventStream {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            capacity: config.subscriber_buffer.max(1),
            overflow: config.overflow,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel<'a>(&self, channels: &'a mut HashMap<Uuid, Channel>, app_id: Uuid) -> &'a mut Channel {
        channels.entry(app_id).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            next_seq: 1,
        })
    }

    /// Publish a transition, returning the event with its sequence number
    pub fn publish(
        &self,
        app_id: Uuid,
        job_id: Uuid,
        release_id: Uuid,
        process_type: &str,
        state: JobState,
    ) -> JobEvent {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = self.channel(&mut channels, app_id);

        let event = JobEvent {
            app_id,
            job_id,
            release_id,
            process_type: process_type.to_string(),
            state,
            seq: channel.next_seq,
            timestamp: Utc::now(),
        };
        channel.next_seq += 1;

        // No receivers is fine: nobody is watching
        let receivers = channel.sender.send(event.clone()).unwrap_or(0);
        trace!(
            "event app={} job={} {} seq={} ({} receivers)",
            app_id,
            job_id,
            state,
            event.seq,
            receivers
        );
        event
    }

    /// Attach a subscriber; it sees only events published from now on
    pub fn subscribe(&self, app_id: Uuid, filter: EventFilter) -> Subscription {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = self.channel(&mut channels, app_id).sender.subscribe();
        Subscription {
            app_id,
            receiver,
            filter,
            overflow: self.overflow,
        }
    }

    /// Drop an app's channel; subscribers drain and then end
    pub fn close(&self, app_id: Uuid) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
    }
}

/// A live view of one app's events
pub struct Subscription {
    app_id: Uuid,
    receiver: broadcast::Receiver<JobEvent>,
    filter: EventFilter,
    overflow: OverflowPolicy,
}

impl Subscription {
    /// Next matching event, or `None` once the app's channel is closed
    pub async fn recv(&mut self) -> ShipyardResult<Option<JobEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(RecvError::Closed) => return Ok(None),
                Err(RecvError::Lagged(missed)) => match self.overflow {
                    OverflowPolicy::DropOldest => {
                        warn!(
                            "Subscriber for app {} lagged, {} events dropped",
                            self.app_id, missed
                        );
                    }
                    OverflowPolicy::Disconnect => {
                        return Err(ShipyardError::StreamOverflow {
                            app: self.app_id.to_string(),
                            missed,
                        });
                    }
                },
            }
        }
    }

    /// Adapt into a stream that ends on close or overflow
    pub fn into_stream(self) -> impl Stream<Item = ShipyardResult<JobEvent>> {
        stream::unfold(Some(self), |state| async move {
            let mut sub = state?;
            match sub.recv().await {
                Ok(Some(event)) => Some((Ok(event), Some(sub))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn stream(buffer: usize, overflow: OverflowPolicy) -> EventStream {
        EventStream::new(&EventsConfig {
            subscriber_buffer: buffer,
            overflow,
        })
    }

    #[tokio::test]
    async fn subscribers_see_only_later_events_in_order() {
        let events = stream(16, OverflowPolicy::DropOldest);
        let app = Uuid::new_v4();
        let (job, release) = (Uuid::new_v4(), Uuid::new_v4());

        events.publish(app, job, release, "web", JobState::Pending);
        let mut sub = events.subscribe(app, EventFilter::default());
        events.publish(app, job, release, "web", JobState::Starting);
        events.publish(app, job, release, "web", JobState::Up);

        let first = sub.recv().await.unwrap().unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Starting);
        assert_eq!(second.state, JobState::Up);
        assert_eq!((first.seq, second.seq), (2, 3));
    }

    #[tokio::test]
    async fn sequences_are_per_app() {
        let events = stream(16, OverflowPolicy::DropOldest);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let ea = events.publish(a, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);
        let eb = events.publish(b, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);
        assert_eq!(ea.seq, 1);
        assert_eq!(eb.seq, 1);
    }

    #[tokio::test]
    async fn filter_by_process_type() {
        let events = stream(16, OverflowPolicy::DropOldest);
        let app = Uuid::new_v4();
        let mut sub = events.subscribe(app, EventFilter::process_type("web"));

        events.publish(app, Uuid::new_v4(), Uuid::new_v4(), "worker", JobState::Pending);
        events.publish(app, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);

        assert_eq!(sub.recv().await.unwrap().unwrap().process_type, "web");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let events = stream(2, OverflowPolicy::DropOldest);
        let app = Uuid::new_v4();
        let mut sub = events.subscribe(app, EventFilter::default());

        for _ in 0..5 {
            events.publish(app, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);
        }

        // Three oldest are gone; the rest arrive in order
        assert_eq!(sub.recv().await.unwrap().unwrap().seq, 4);
        assert_eq!(sub.recv().await.unwrap().unwrap().seq, 5);
    }

    #[tokio::test]
    async fn slow_subscriber_disconnects() {
        let events = stream(2, OverflowPolicy::Disconnect);
        let app = Uuid::new_v4();
        let mut slow = events.subscribe(app, EventFilter::default());
        let mut fast = events.subscribe(app, EventFilter::default());

        for _ in 0..5 {
            events.publish(app, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);
            fast.recv().await.unwrap().unwrap();
        }

        assert!(matches!(
            slow.recv().await,
            Err(ShipyardError::StreamOverflow { missed: 3, .. })
        ));
    }

    #[tokio::test]
    async fn close_ends_stream() {
        let events = stream(16, OverflowPolicy::DropOldest);
        let app = Uuid::new_v4();
        let sub = events.subscribe(app, EventFilter::default());

        events.publish(app, Uuid::new_v4(), Uuid::new_v4(), "web", JobState::Pending);
        events.close(app);

        let collected: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
        assert!(collected[0].is_ok());
    }
}
