//! Workers module

pub mod control;
