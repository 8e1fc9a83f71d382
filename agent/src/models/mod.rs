//! Models module

pub mod deployment;
