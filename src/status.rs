/*!
Status codes shared by the AMO and UDT subsystems.

Every fallible operation in the crate returns `Result<T, Error>`. The
variants mirror the transport's status vocabulary:
- `InvalidParam`: a precondition violation (misaligned address, out-of-range
  active-message id, oversized payload). Surfaced immediately, before any
  provider call.
- `NoResource`: transient exhaustion. The AMO path retries internally after
  progressing; the UDT send path returns it to the caller, who typically
  queues a pending request and retries on progress.
- `InProgress`: an operation was accepted and will complete via the
  completion queue. Internal to the AMO facade; never escapes the public
  atomic surface.
- `NoDevice`: the provider failed to produce an endpoint at init time.
- `Provider`: any other provider failure, carried through unchanged with the
  provider's own description.
*/

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A caller-supplied argument violated a documented precondition.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Resources are transiently exhausted; the operation may be retried
    /// after progress.
    #[error("no resources available")]
    NoResource,

    /// The operation was queued and will complete asynchronously.
    #[error("operation in progress")]
    InProgress,

    /// The provider could not supply a device endpoint.
    #[error("no device")]
    NoDevice,

    /// Provider failure passed through unchanged.
    #[error("provider failure: {0}")]
    Provider(String),
}
