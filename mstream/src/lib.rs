pub mod config;
pub mod handler;
pub mod metrics;
pub mod model;
pub mod mongo;
pub mod persistent;
pub mod rabbitmq;
pub mod streamer;
pub use streamer::Streamer;
