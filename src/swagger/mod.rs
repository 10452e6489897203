//! The OpenAPI v2 (Swagger) document model and the filtering engine.

pub mod document;
pub mod filter;

pub use document::{Operation, PathItem, SwaggerDoc};
pub use filter::filter;
