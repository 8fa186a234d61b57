//! Data models

pub mod app;
pub mod deployment;
