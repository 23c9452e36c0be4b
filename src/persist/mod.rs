pub mod backoff;
pub mod backpressure;
mod persister;
pub mod store;

pub use backoff::BackoffPolicy;
pub use backpressure::{throttle_multiplier, Backpressure};
pub use persister::{
    Ack, PersistFault, PersistSettings, ResultPersister, ShutdownReport, RETRIES_EXHAUSTED,
    UNDELIVERED_AT_SHUTDOWN,
};
pub use store::{wire_body, RestStore, StoreError, StoreWriter, WriteOutcome};
