#[derive(Debug, Clone, thiserror::Error)]
pub enum AikoError {
    #[error("invalid topic path: {0}")]
    TopicPath(String),

    #[error("invalid service record: {0}")]
    ServiceRecord(String),

    #[error("configuration error: {0}")]
    Config(String),
}
