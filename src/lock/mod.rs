// ============================================================================
// Distributed Lock
// ============================================================================
//
// Lease-based mutual exclusion over a CAS store:
// - acquisition is one atomic add-if-absent with a TTL
// - release and renewal are compare-and-delete / compare-and-extend on the
//   owner token, so a stale holder can never touch a lease it lost
// - a fencing counter per key orders successive acquisitions
//
// ============================================================================

pub mod distributed;
pub mod store;

pub use distributed::{DistributedLock, LockManager};
pub use store::{InMemoryLockStore, LockStore};
