pub mod cache;
pub mod chain;
pub mod config;
pub mod guard;
pub mod history;
pub mod orchestrator;
pub mod services;
pub mod status;
