//! KVWARD Coord - Coordination Primitives
//!
//! Cross-process coordination built only on the store's atomic operations:
//! - [`DistributedMutex`]: token-owned, TTL-bound locks
//! - [`IdGenerator`]: time-prefixed ids from a per-day atomic counter

pub mod id;
pub mod mutex;

pub use id::{IdGenerator, IdParts};
pub use mutex::{DistributedMutex, LockLease};

use kvward_core::CoordError;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;
