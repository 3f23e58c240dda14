pub mod adapters;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod models;
pub mod registry;
pub mod retriever;
pub mod settings;
