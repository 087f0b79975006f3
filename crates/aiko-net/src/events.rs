//! Events surfaced by the transport task.

/// What the broker connection reports back to the process runtime.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connected (or reconnected) and all outstanding subscriptions restored.
    Connected,

    /// Connection lost; reconnection is being attempted.
    Disconnected,

    /// An inbound publish on a subscribed topic. `retain` marks a retained
    /// message replayed on subscription.
    Message {
        topic: String,
        payload: String,
        retain: bool,
    },

    /// Reconnection gave up after repeated failures. Fatal to the process.
    Failed { reason: String },
}
