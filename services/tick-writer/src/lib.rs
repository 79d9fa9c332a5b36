//! Tick persistence worker
//!
//! Stateless consumer of the `ticks` queue: batch up to `BATCH_SIZE`
//! messages or `BATCH_TIMEOUT_SECONDS`, then one bulk UPSERT keyed on
//! `(time, instrument_token)`. The queue is durable, so a database
//! failure nacks the batch back rather than dropping it; per-message
//! decode failures dead-letter after three attempts. Multiple workers
//! may run side by side; the UPSERT makes cross-worker replays
//! idempotent.

pub mod consumer;
pub mod db;

pub use consumer::run;
