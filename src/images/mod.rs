//! Image URL resolution for the content-addressed gateway.

pub mod gateway;
pub mod resolver;

pub use gateway::Dimensions;
pub use resolver::SignedUrlResolver;
