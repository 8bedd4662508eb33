//! Error kinds surfaced by the core (spec §7).

use core::fmt;

/// Errors returned by the public entry points of this crate.
///
/// Construction errors (`new_client`/`new_server`) unwind any partial state
/// before returning; `reap` never surfaces an error to its caller and
/// lookups use `Option`, not `Result` (see module docs on each).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The underlying allocator (packet buffers, backing storage) refused.
    AllocationFailure,
    /// The socket is shutting down; no new RPC may be published.
    Shutdown,
    /// The peer registry could not resolve an address.
    PeerResolutionFailed,
    /// Inbound message state setup rejected the request (e.g. bad length).
    MsginInitFailed,
    /// A `BufferPool` was configured with a region that doesn't satisfy
    /// its geometry requirements.
    InvalidArgument,
    /// `BufferPool` cannot currently satisfy an allocation.
    ResourceExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::AllocationFailure => "allocation failure",
            Error::Shutdown => "socket is shutting down",
            Error::PeerResolutionFailed => "peer resolution failed",
            Error::MsginInitFailed => "inbound message initialization failed",
            Error::InvalidArgument => "invalid argument",
            Error::ResourceExhausted => "resource exhausted",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
