#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport task has stopped")]
    TaskStopped,

    #[error("broker connection failed: {0}")]
    Connection(String),
}
