//! tapline core types shared by every component: the error taxonomy,
//! pod references, the readiness record and the retry/debounce helpers.

#![forbid(unsafe_code)]

pub mod debounce;
pub mod error;
pub mod names;
pub mod pod;
pub mod readiness;
pub mod retry;

pub use debounce::Debouncer;
pub use error::{Component, Error, ErrorKind, Result};
pub use names::{PlatformNames, ALL_NAMESPACES, PROGRAM};
pub use pod::{ContainerStatusRef, PodKey, PodRef};
pub use readiness::{ReadinessFlag, ReadinessRecord, ReadinessState};
pub use retry::{retry_with_context, RetryPolicy};

/// Root cancellation handle threaded through every long-running loop.
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use super::{
        CancellationToken, Component, Error, ErrorKind, PlatformNames, PodKey, PodRef, ReadinessFlag,
        ReadinessRecord, RetryPolicy,
    };
}
