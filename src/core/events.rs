// In-process event bus + notification fan-out.
//
// Events are published over a `tokio::sync::broadcast` channel so listeners
// run on their own background task and can never block the publisher.
// `EventBus::fan_out` additionally drives the per-controller notification
// push for the five broadcastable event kinds.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::session::Session;

#[derive(Debug, Clone)]
pub enum Event {
    AuthenticationFailed { username: String },
    AuthenticationSucceeded { user_id: String, session_id: String },
    SessionStarted { session_id: String },
    SessionEnded { session_id: String },
    SessionActivity { session_id: String },
    CapabilitiesChanged { session_id: String },
    PlaybackStart { session_id: String, item_id: String },
    PlaybackProgress { session_id: String, item_id: String, is_automated: bool },
    PlaybackStopped { session_id: String, item_id: String },
    ServerRestart,
    ServerShutdown,
    RestartRequired,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Typed publish-subscribe bus. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish to in-process listeners. A lagging/absent listener is not an
    /// error — broadcast semantics are best-effort by design.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Fan out a notification to every active session's controller,
    /// concurrently, joining on completion. Individual failures are logged
    /// and never abort siblings.
    pub async fn fan_out<F, Fut>(sessions: &[Arc<Session>], dispatch: F)
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let active: Vec<Arc<Session>> = sessions
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect();

        let tasks: Vec<_> = active
            .into_iter()
            .map(|session| {
                let session_id = session.id.clone();
                let fut = dispatch(session);
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::warn!("notification delivery to session {} failed: {}", session_id, e);
                    }
                })
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("notification fan-out task panicked: {}", e);
            }
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

    #[tokio::test]
    async fn publish_does_not_block_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(Event::ServerRestart);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::SessionStarted {
            session_id: "abc".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::SessionStarted { session_id } if session_id == "abc"));
    }
}
