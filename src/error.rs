use std::convert::Infallible;

use thiserror::Error;

/// Every way a connection can fail, tagged by the taxonomy of `SPEC_FULL.md` §7.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Packet(#[from] ssh_packet::Error<Infallible>),

    #[error(transparent)]
    PacketCipher(#[from] ssh_packet::Error<aes_gcm::Error>),

    #[error(transparent)]
    Key(#[from] ssh_key::Error),

    #[error(transparent)]
    Signature(#[from] signature::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),

    /// A pattern in the app registry failed to compile.
    #[error(transparent)]
    Pattern(#[from] regex::Error),

    #[error("The session has been disconnected")]
    Disconnected,

    // -- crypto errors (fatal) --
    #[error("Key-exchange failed")]
    KexError,

    #[error("AEAD tag verification failed")]
    TagMismatch,

    #[error("Unable to load or generate the host key: {0}")]
    HostKey(String),

    // -- framing errors (fatal after repeated occurrence) --
    #[error("Packet framing error: {0}")]
    Framing(String),

    #[error("Incoming buffer exceeded the maximum allowed size")]
    BufferOverflow,

    #[error("Too many consecutive parse failures")]
    TooManyParseFailures,

    // -- auth errors (non-fatal, answered with USERAUTH_FAILURE) --
    #[error("Authentication method unsupported or already attempted")]
    UnsupportedMethod,

    // -- channel errors (non-fatal, answered with CHANNEL_FAILURE) --
    #[error("Unknown channel id {0}")]
    UnknownChannel(u32),

    #[error("Unsupported channel type `{0}`")]
    UnsupportedChannelType(String),

    #[error("Failed to allocate a pty: {0}")]
    PtyFailure(String),

    #[error("No app registered for `{0}`")]
    UnknownApp(String),

    // -- resource errors --
    #[error("Failed to spawn the app process: {0}")]
    Spawn(String),

    // -- inactivity --
    #[error("Connection inactive for too long")]
    Inactive,

    /// The embedding listener asked this worker to shut down
    /// (`spec.md` §5: "a cooperative worker must arrange for the next loop
    /// iteration to observe a termination flag and tear down").
    #[error("Server is shutting down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
