//! Internal events for metrics emission.
//!
//! Each struct is one measurable occurrence. Emitting it records the matching
//! Prometheus metric. Events that belong to a configured component carry a
//! `target` label with its key (e.g. `"orders-cdc"`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::dlq::FailureStage;

pub trait InternalEvent {
    fn emit(self);
}

// ============ Source ============

/// A change event was read from the feed.
pub struct EventReceived {
    pub target: String,
}

impl InternalEvent for EventReceived {
    fn emit(self) {
        counter!("freshet_events_received_total", "target" => self.target).increment(1);
    }
}

/// An event was dropped by the collection allow-list.
pub struct EventFiltered {
    pub target: String,
}

impl InternalEvent for EventFiltered {
    fn emit(self) {
        counter!("freshet_events_filtered_total", "target" => self.target).increment(1);
    }
}

pub struct SourceReconnect {
    pub attempt: u32,
    pub target: String,
}

impl InternalEvent for SourceReconnect {
    fn emit(self) {
        trace!(attempt = self.attempt, target = %self.target, "Source reconnect");
        counter!("freshet_source_reconnects_total", "target" => self.target).increment(1);
    }
}

// ============ Queue ============

pub struct QueueDepth {
    pub depth: usize,
    pub target: String,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        gauge!("freshet_queue_depth", "target" => self.target).set(self.depth as f64);
    }
}

/// The queue crossed its high or low watermark.
pub struct BackpressureChanged {
    pub active: bool,
    pub target: String,
}

impl InternalEvent for BackpressureChanged {
    fn emit(self) {
        trace!(active = self.active, target = %self.target, "Backpressure changed");
        gauge!("freshet_backpressure_active", "target" => self.target.clone())
            .set(if self.active { 1.0 } else { 0.0 });
        if self.active {
            counter!("freshet_backpressure_pauses_total", "target" => self.target).increment(1);
        }
    }
}

// ============ Publisher ============

/// Final outcome for one dequeued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    DeadLettered,
    ShortCircuited,
}

impl PublishOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Published => "published",
            PublishOutcome::DeadLettered => "dead_lettered",
            PublishOutcome::ShortCircuited => "short_circuited",
        }
    }
}

pub struct EventPublished {
    pub outcome: PublishOutcome,
    pub target: String,
}

impl InternalEvent for EventPublished {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), target = %self.target, "Event finished");
        counter!(
            "freshet_events_published_total",
            "outcome" => self.outcome.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// One failed publish attempt (timeouts included).
pub struct PublishAttemptFailed {
    pub target: String,
}

impl InternalEvent for PublishAttemptFailed {
    fn emit(self) {
        counter!("freshet_publish_failures_total", "target" => self.target).increment(1);
    }
}

pub struct PublishDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for PublishDuration {
    fn emit(self) {
        histogram!("freshet_publish_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Breaker state as a gauge: 0 closed, 1 half-open, 2 open.
pub struct CircuitStateChanged {
    pub state: &'static str,
    pub level: u8,
    pub target: String,
}

impl InternalEvent for CircuitStateChanged {
    fn emit(self) {
        trace!(state = self.state, target = %self.target, "Circuit state changed");
        gauge!("freshet_circuit_state", "target" => self.target.clone()).set(f64::from(self.level));
        counter!(
            "freshet_circuit_transitions_total",
            "state" => self.state,
            "target" => self.target
        )
        .increment(1);
    }
}

// ============ Checkpoint ============

pub struct CheckpointSaved {
    pub target: String,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(target = %self.target, "Checkpoint saved");
        counter!("freshet_checkpoints_saved_total", "target" => self.target).increment(1);
    }
}

pub struct CheckpointFailed {
    pub target: String,
}

impl InternalEvent for CheckpointFailed {
    fn emit(self) {
        counter!("freshet_checkpoint_failures_total", "target" => self.target).increment(1);
    }
}

/// Events delivered to the queue but not yet covered by the checkpoint.
pub struct CheckpointLag {
    pub events: u64,
    pub target: String,
}

impl InternalEvent for CheckpointLag {
    fn emit(self) {
        gauge!("freshet_checkpoint_lag_events", "target" => self.target).set(self.events as f64);
    }
}

/// A loaded checkpoint is older than the source's retention window.
pub struct StaleCheckpoint {
    pub age: Duration,
    pub target: String,
}

impl InternalEvent for StaleCheckpoint {
    fn emit(self) {
        gauge!("freshet_checkpoint_age_seconds", "target" => self.target.clone())
            .set(self.age.as_secs_f64());
        counter!("freshet_stale_checkpoints_total", "target" => self.target).increment(1);
    }
}

// ============ Router ============

pub struct MessagesPolled {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for MessagesPolled {
    fn emit(self) {
        counter!("puffin_messages_polled_total", "target" => self.target).increment(self.count);
    }
}

pub struct RecordTransformed {
    pub collection: String,
    pub target: String,
}

impl InternalEvent for RecordTransformed {
    fn emit(self) {
        counter!(
            "puffin_records_transformed_total",
            "collection" => self.collection,
            "target" => self.target
        )
        .increment(1);
    }
}

/// Message skipped because its collection has no registered mapping.
pub struct EventSkipped {
    pub target: String,
}

impl InternalEvent for EventSkipped {
    fn emit(self) {
        counter!("puffin_events_skipped_total", "target" => self.target).increment(1);
    }
}

/// A new collection registry snapshot became active.
pub struct RegistryReloaded {
    pub generation: u64,
    pub collections: usize,
    pub target: String,
}

impl InternalEvent for RegistryReloaded {
    fn emit(self) {
        gauge!("puffin_registry_generation", "target" => self.target.clone())
            .set(self.generation as f64);
        gauge!("puffin_registry_collections", "target" => self.target)
            .set(self.collections as f64);
    }
}

/// A reload was rejected; the previous snapshot stays active.
pub struct RegistryReloadFailed {
    pub target: String,
}

impl InternalEvent for RegistryReloadFailed {
    fn emit(self) {
        counter!("puffin_registry_reload_failures_total", "target" => self.target).increment(1);
    }
}

/// Destination kind for write metrics.
#[derive(Debug, Clone, Copy)]
pub enum Destination {
    Raw,
    Typed,
}

impl Destination {
    fn as_str(&self) -> &'static str {
        match self {
            Destination::Raw => "raw",
            Destination::Typed => "typed",
        }
    }
}

pub struct ObjectWritten {
    pub destination: Destination,
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for ObjectWritten {
    fn emit(self) {
        trace!(destination = self.destination.as_str(), bytes = self.bytes, "Object written");
        counter!(
            "puffin_objects_written_total",
            "destination" => self.destination.as_str(),
            "target" => self.target.clone()
        )
        .increment(1);
        counter!(
            "puffin_bytes_written_total",
            "destination" => self.destination.as_str(),
            "target" => self.target
        )
        .increment(self.bytes);
    }
}

// ============ Dead letters ============

pub struct DeadLettered {
    pub stage: FailureStage,
    pub target: String,
}

impl InternalEvent for DeadLettered {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), target = %self.target, "Dead-lettered");
        counter!(
            "freshet_dead_letters_total",
            "stage" => self.stage.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

// ============ Storage ============

#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Delete,
    List,
    Rename,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
            StorageOperation::Rename => "rename",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "freshet_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "freshet_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============ Polling ============

#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    Empty,
    Shutdown,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::Empty => "empty",
            IterationResultType::Shutdown => "shutdown",
        }
    }
}

pub struct IterationCompleted {
    pub result: IterationResultType,
    pub service: &'static str,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        counter!(
            "polling_iterations_total",
            "service" => self.service,
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

pub struct IterationDuration {
    pub duration: Duration,
    pub service: &'static str,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        histogram!(
            "polling_iteration_duration_seconds",
            "service" => self.service,
            "target" => self.target
        )
        .record(self.duration.as_secs_f64());
    }
}
