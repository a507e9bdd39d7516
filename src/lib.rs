pub mod aggregation;
pub mod config;
pub mod error;
pub mod fetch;
pub mod query;
pub mod sink;
pub mod source;
