use thiserror::Error;

/// Failure categories for the agent core. Only initialization failures that
/// leave the agent without any channel are fatal; everything else is
/// recovered locally.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("unable to determine host information: {0}")]
    HostInfoUnavailable(String),

    #[error("no C2 communication channels registered")]
    NoContactsRegistered,

    #[error("contact `{0}` is not registered")]
    ContactUnknown(String),

    #[error("requirements not met for C2 channel {protocol} at {address}")]
    RequirementsNotMet { protocol: String, address: String },

    #[error("no peer proxy receivers available to connect to")]
    NoPeersAvailable,

    #[error("all available peer proxy receivers have been tried")]
    AllExhausted,

    #[error("no compatible peer proxy receivers found")]
    NoCompatiblePeers,

    #[error("malformed beacon received: {0}")]
    MalformedBeacon(String),

    #[error("malformed beacon instructions received: {0}")]
    MalformedInstructions(String),

    #[error("payload fetch failed for `{0}`")]
    PayloadFetch(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("receiver `{0}` failed to initialize: {1}")]
    ReceiverInit(String, String),

    #[error("receiver `{receiver}` cannot relay for upstream contact `{upstream}`")]
    ReceiverIncompatibleUpstream { receiver: String, upstream: String },

    #[error("tunnel `{0}` failed to initialize: {1}")]
    TunnelInit(String, String),

    #[error("tunnel `{0}` failed to start")]
    TunnelStart(String),

    #[error("file upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
