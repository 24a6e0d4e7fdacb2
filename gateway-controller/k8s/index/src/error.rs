use std::net::AddrParseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The namespace's cache entry is being torn down. The sync must be retried once the teardown
    /// has completed.
    #[error("namespace {0} is currently being deleted")]
    DeletionInProgress(String),

    #[error("policy {policy} has an invalid static next hop {ip:?}: {source}")]
    InvalidPolicy {
        policy: String,
        ip: String,
        #[source]
        source: AddrParseError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
