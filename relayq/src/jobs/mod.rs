//! Jobs: the core contract of the broker.
//!
//! [`job`] holds the data model (ids, statuses, records, events),
//! [`tracker`] owns submissions and lifecycle updates, and [`pump`] turns
//! the store's event stream into webhook and subscription fan-out.

mod job;
mod pump;
mod tracker;

pub use job::{
    metadata_string, JobEvent, JobEventKind, JobId, JobRecord, JobStatus, JobUpdateEntry,
};
pub use pump::EventPump;
pub use tracker::{JobTracker, JobUpdateRequest, ListFilter, NewJob, DEFAULT_LIST_LIMIT};
