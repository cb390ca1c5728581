use tokio::sync::broadcast;
use uuid::Uuid;

/// Connection and channel lifecycle, published for observers outside the
/// protocol engine. Publishing never blocks; slow subscribers lag.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ConnectionOpened {
        connection_id: Uuid,
        host: String,
    },
    ConnectionRegistered {
        connection_id: Uuid,
        nick: String,
        account: Option<String>,
    },
    ConnectionClosed {
        connection_id: Uuid,
        reason: String,
    },
    ChannelCreated {
        channel: String,
    },
    ChannelDestroyed {
        channel: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventFeed { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[tokio::test]
async fn subscribers_see_events_in_order() {
    // Arrange
    let feed = EventFeed::new(8);
    let mut receiver = feed.subscribe();

    // Act
    feed.publish(LifecycleEvent::ChannelCreated {
        channel: "#a".to_string(),
    });
    feed.publish(LifecycleEvent::ChannelDestroyed {
        channel: "#a".to_string(),
    });

    // Assert
    assert!(matches!(
        receiver.recv().await,
        Ok(LifecycleEvent::ChannelCreated { .. })
    ));
    assert!(matches!(
        receiver.recv().await,
        Ok(LifecycleEvent::ChannelDestroyed { .. })
    ));
}

#[test]
fn publish_without_subscribers_is_silent() {
    let feed = EventFeed::new(1);
    feed.publish(LifecycleEvent::ChannelCreated {
        channel: "#a".to_string(),
    });
}
