use thiserror::Error;

/// Failure of an append or summary upsert. Recovered locally by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("read rejected: {0}")]
    Rejected(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// The live feed stopped producing snapshots. The producer keeps retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("live feed interrupted after {attempts} attempt(s): {source}")]
    Interrupted { attempts: u32, source: ReadError },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("role lookup failed: {0}")]
    Lookup(#[from] ReadError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboxError {
    #[error("support inbox requires an admin identity")]
    NotAdmin,
    #[error("reply text is empty")]
    EmptyMessage,
    #[error("cannot move conversation {id} from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Read(#[from] ReadError),
}
