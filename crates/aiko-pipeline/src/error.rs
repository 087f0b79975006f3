#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pipeline definition document could not be parsed or validated.
    #[error("definition error: {0}")]
    Definition(String),

    /// `deploy.local` names a module/class the registry does not provide.
    #[error("element {element}: {module}.{class_name} could not be {problem}")]
    Load {
        element: String,
        module: String,
        class_name: String,
        problem: String,
    },

    /// Graph cycle, duplicate element, undefined reference, multiple heads.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// `start_stream` / `stop_stream` failed.
    #[error("element {element}: stream {stream_id}: {diagnostic}")]
    Lifecycle {
        element: String,
        stream_id: String,
        diagnostic: String,
    },

    /// Per-frame failure, isolated to the frame.
    #[error("element {element}: stream {stream_id} frame {frame_id}: {diagnostic}")]
    Frame {
        element: String,
        stream_id: String,
        frame_id: i64,
        diagnostic: String,
    },

    /// Zero or ambiguous matches for a required remote service filter.
    #[error("discovery error: {0}")]
    Discovery(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
