pub mod event;
pub mod store;
pub mod traffic;

pub use event::{extra_keys, saturating_add, saturating_sub, Event, ExtraFields, RawEvent};
pub use store::{EventStore, EventStoreSettings, LogEntry};
pub use traffic::{TrafficRecord, TrafficStats};
