pub mod ack;
pub mod broadcast;
pub mod capability;
pub mod config;
pub mod directory;
pub mod executor;
pub mod ingest;
pub mod journal;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod server;
pub mod store;
