// ============================================================================
// Try-Confirm-Cancel
// ============================================================================
//
// Producer side: `TccCoordinator::register_try` captures a `TryInfo` on the
// current transaction; when the transaction ends, exactly one Confirm
// (committed) or Cancel (rolled back) `Stage` is published to
// `{prefix}.{target}`.
//
// Consumer side: `TccConsumer` decodes stages and runs the participant's
// handler. Delivery is at-least-once, so handlers are idempotent.
//
// ============================================================================

pub mod consumer;
pub mod coordinator;
pub mod stage;
pub mod transport;
pub mod try_info;

pub use consumer::{ConsumerStats, TccConsumer, TccParticipant};
pub use coordinator::{CoordinatorStats, StageLedger, TccCoordinator, routing_key};
pub use stage::{PayloadCodec, Stage, StageName, StageState};
pub use transport::{DeadLetter, InMemoryTransport, MessageHandler, Transport, TransportStats};
pub use try_info::TryInfo;
