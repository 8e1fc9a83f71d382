//! Deployment module

pub mod backup;
pub mod builder;
pub mod fsm;
pub mod health;
pub mod locks;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod reporter;
pub mod runtime;
pub mod source;
pub mod traffic;
