use thiserror::Error;

/// Errors returned by the registry and by container storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObserveError {
    /// The wrapper passed as a root does not own a registered context.
    #[error("no observation context registered for this root")]
    ContextNotFound,
    /// `create` was given something that is not a container.
    #[error("value is not a container")]
    InvalidContainer,
    /// The container was frozen and rejects writes.
    #[error("container is read-only")]
    ReadOnly,
    /// A list write landed past the end of the list.
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    /// The key cannot address a slot of this container kind.
    #[error("invalid key `{0}` for this container")]
    InvalidKey(String),
    /// A list `length` write carried something other than a non-negative integer.
    #[error("invalid list length")]
    InvalidLength,
}

pub type Result<T, E = ObserveError> = std::result::Result<T, E>;

/// Errors raised while loading an [`EngineConfig`](crate::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
