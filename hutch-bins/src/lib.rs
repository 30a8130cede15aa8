//! Shared code for the Hutch binaries

pub mod common;
