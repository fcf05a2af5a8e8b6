//! Find every event photo a face appears in.
//!
//! Organizers upload photos into events; encode workers turn each photo into
//! face embeddings; anyone holding an event's access code can search it with
//! a probe face.

pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod faces;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod matching;
pub mod scope;
pub mod status;
pub mod storage;
pub mod tasks;

pub use config::Config;
pub use context::RequestContext;
pub use engine::{Engine, Probe, SearchRequest};
pub use error::{Error, Result};
