//! Event-driven communication system for inter-service messaging.

use anyhow::Result;
use tokio::sync::broadcast;

/// Application events for inter-service communication.
///
/// Events are published through the EventBus and consumed by interested services.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The host is about to sleep.
    SuspendRequested,
    /// The host woke up.
    ResumeRequested,
    /// The EC has been told about the upcoming sleep; safe to let the host go.
    EcSuspended,
    /// Reporting resumed after sleep.
    EcResumed,
    /// A temperature (°C) was delivered to the EC.
    TemperatureReported(f32),
    /// The reporting loop gave up; carries the reason.
    DaemonStopped(String),
}

/// Event bus for publish-subscribe messaging between services.
///
/// # Example
///
/// ```no_run
/// use arm_ecd::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::TemperatureReported(52.5));
///
/// // In async context, receive events:
/// // let event = subscriber.recv().await;
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each subscriber receives all events published after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::{Duration, sleep};

    #[test]
    fn event_bus_clone_creates_shared_channel() {
        let event_bus1 = EventBus::new();
        let event_bus2 = event_bus1.clone();

        let _receiver1 = event_bus1.subscribe();
        let _receiver2 = event_bus2.subscribe();

        assert_eq!(event_bus1.sender.receiver_count(), 2);
        assert_eq!(event_bus2.sender.receiver_count(), 2);
    }

    #[tokio::test]
    async fn publish_and_subscribe_basic_event() {
        let event_bus = EventBus::new();
        let mut receiver = event_bus.subscribe();

        event_bus.publish(Event::SuspendRequested).unwrap();

        assert_eq!(receiver.recv().await.unwrap(), Event::SuspendRequested);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let event_bus = EventBus::new();
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        event_bus.publish(Event::TemperatureReported(61.5)).unwrap();

        assert_eq!(
            receiver1.recv().await.unwrap(),
            Event::TemperatureReported(61.5)
        );
        assert_eq!(
            receiver2.recv().await.unwrap(),
            Event::TemperatureReported(61.5)
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_error() {
        let event_bus = EventBus::new();
        assert!(event_bus.publish(Event::EcResumed).is_err());
    }

    #[tokio::test]
    async fn sequential_events_received_in_order() {
        let event_bus = EventBus::new();
        let mut receiver = event_bus.subscribe();

        event_bus.publish(Event::SuspendRequested).unwrap();
        event_bus.publish(Event::EcSuspended).unwrap();
        event_bus.publish(Event::ResumeRequested).unwrap();
        event_bus.publish(Event::EcResumed).unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(receiver.recv().await.unwrap());
        }
        assert_eq!(
            received,
            vec![
                Event::SuspendRequested,
                Event::EcSuspended,
                Event::ResumeRequested,
                Event::EcResumed,
            ]
        );
    }

    #[tokio::test]
    async fn event_bus_works_across_async_tasks() {
        let event_bus = EventBus::new();
        let mut receiver = event_bus.subscribe();
        let publisher_bus = event_bus.clone();

        let publisher_handle = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            publisher_bus
                .publish(Event::DaemonStopped("bus gone".into()))
                .unwrap();
        });

        let receiver_handle = tokio::spawn(async move { receiver.recv().await.unwrap() });

        publisher_handle.await.unwrap();
        assert_eq!(
            receiver_handle.await.unwrap(),
            Event::DaemonStopped("bus gone".into())
        );
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let event_bus = EventBus::with_capacity(4);
        let mut receiver = event_bus.subscribe();

        for i in 0..10 {
            event_bus
                .publish(Event::TemperatureReported(i as f32))
                .unwrap();
        }

        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 6),
            other => panic!("Expected lag, got {other:?}"),
        }
        assert_eq!(
            receiver.recv().await.unwrap(),
            Event::TemperatureReported(6.0)
        );
    }
}
