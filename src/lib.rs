pub mod agent;
pub mod config;
pub mod controller;
pub mod directory;
pub mod download;
pub mod error;
pub mod health;
pub mod manifest;
pub mod notify;
pub mod observability;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod supervisor;
