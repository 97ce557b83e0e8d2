pub mod aggregator;
pub mod alert;

pub use aggregator::{AggregationOutcome, AggregatorSettings, AggregatorSweep, AlertAggregator, AlertStatistics};
pub use alert::{Alert, AlertKey, AlertRecord, LiveAlert, RelatedAlert};
