pub mod catalog;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod inference;
pub mod models;
pub mod profiler;
pub mod queue;
pub mod raw;
pub mod schema;
pub mod scrape;
pub mod socrata;
pub mod worker;

pub use engine::Pipeline;
pub use error::PipelineError;
