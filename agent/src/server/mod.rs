//! Local HTTP server module

pub mod handlers;
pub mod serve;
pub mod state;
