//! Event sinks for engine observability.
//!
//! Pipelines, the resource manager and the job manager report lifecycle
//! events (`waterfall.*`, `stage.*`, `resource.*`, `job.*`) through an
//! [`EventSink`] handed to them at construction time.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};

use std::sync::Arc;

/// Returns the sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}
