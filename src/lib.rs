pub mod builder;
pub mod errors;
pub mod locking;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod repo_config;
pub mod runtime;
pub mod server_config;
pub mod workspace;
