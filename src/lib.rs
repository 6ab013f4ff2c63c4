pub mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod messaging;
pub mod models;
pub mod paths;
pub mod protocol;
pub mod routes;
pub mod store;
pub mod stream;
pub mod worker_scheduler;
