#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Metrics(#[from] metrics::Error),

    #[error(transparent)]
    Rpc(#[from] client::Error),

    #[error("failed to render configuration: {0}")]
    Render(#[from] serde_json::Error),

    #[error("failed to bind {listener} listener on port {port}: {source}")]
    Bind {
        listener: &'static str,
        port: u16,
        source: std::io::Error,
    },

    #[error("{listener} listener failed: {source}")]
    Serve {
        listener: &'static str,
        source: std::io::Error,
    },
}

impl Error {
    /// 1 for configuration problems, 2 for listener bind failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bind { .. } => 2,
            _ => 1,
        }
    }
}
