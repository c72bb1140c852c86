//! HTTP adapter for gateway collaborators.
//!
//! Thin translation layer: JSON in, `IngestionCoordinator::handle` in the
//! middle, JSON out. Routes are nested under `/api/`.

pub mod error;
pub mod router;
pub mod server;

pub use error::ApiError;
pub use router::{moderation_router, ApiContext};
pub use server::{start_api_server, ApiServer};
