//! `pipemesh` Pipe Router
//!
//! Routes named bidirectional pipes between the replicas of a service:
//! - [`DistributedPipeRouter`] records end ownership in a consistent KV store
//!   and bridges pipes whose ends live on different replicas
//! - [`LocalPipeRouter`] keeps every pipe in process
//! - a private websocket API through which replicas stream pipe halves to
//!   each other

pub mod bridge;
pub mod error;
pub mod local;
pub mod private_api;
pub mod reaper;
pub mod reconcile;
pub mod record;
pub mod router;
pub mod ws;

pub use error::PipeError;
pub use local::{LocalPipeRouter, LocalRouterConfig};
pub use record::PipeRecord;
pub use router::{DistributedPipeRouter, PipeRouter, SharedPipeRouter};
