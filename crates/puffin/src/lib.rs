//! Puffin: change-event router.
//!
//! This crate handles:
//! - Archiving every bus message unmodified under a deterministic raw key
//! - Flattening documents and mapping them onto registered collection schemas
//! - Hot-reloading the collection registry as immutable snapshots
//! - Writing typed records as Parquet objects
//! - Isolating per-event failures into the dead-letter queue

pub mod config;
pub mod error;
pub mod flatten;
pub mod mapping;
pub mod pipeline;
pub mod router;
pub mod schema;
pub mod sink;
pub mod transform;

pub use config::Config;
pub use error::{MappingError, PipelineError, TransformError, WriterError};
pub use pipeline::{ConsumerProcessor, PuffinConsumer};
pub use router::{Disposition, RouteReport, Router, RouterStats};
pub use schema::{CollectionSchema, FieldType, FieldValue, SchemaRegistry};
pub use transform::{TransformOutcome, TransformedRecord, Transformer};

pub use freshet_core::{Application, BusMessage, StorageProvider, StorageProviderRef};
