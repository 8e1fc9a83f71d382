//! Backend HTTP module

pub mod client;
pub mod deployments;
pub mod secrets;
