pub mod bus;
pub mod config;
pub mod error;
pub mod pipeline;
