pub mod cadence;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod params;
pub mod preview;
pub mod reflector;
pub mod schema;
pub mod template;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cadence::*;
pub use config::*;
pub use dispatch::*;
pub use engine::*;
pub use error::*;
pub use outcome::*;
pub use params::*;
pub use preview::*;
pub use reflector::*;
pub use schema::*;
pub use template::{expand, Template};
pub use transport::*;

use std::path::Path;

/// Parse a `.proto` file, resolving imports relative to its directory.
pub fn resolve_schema(path: impl AsRef<Path>) -> Result<ParsedSchema, SchemaError> {
    SchemaReflector::new().resolve(path)
}
