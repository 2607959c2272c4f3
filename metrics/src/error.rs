#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// The crate result type.
pub type Result<T> = std::result::Result<T, Error>;
