//! Rollout Agent Library
//!
//! Core modules for the blue-green rollout agent.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
