//! Metrics and observability infrastructure.
//!
//! - `events`: the `InternalEvent` trait and every event type
//! - `server`: Prometheus recorder and the `/metrics` HTTP endpoint

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit an internal event.
///
/// ```ignore
/// use freshet_core::emit;
/// use freshet_core::metrics::events::QueueDepth;
///
/// emit!(QueueDepth { depth: 12, target: "orders".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
