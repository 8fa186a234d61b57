//! webmgr library
//!
//! Deploys Next.js, FastAPI, Node.js and static web applications on a single
//! host behind nginx, with one systemd unit per application process.

pub mod app;
pub mod cmd;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod progress;
pub mod services;
pub mod storage;
pub mod utils;
