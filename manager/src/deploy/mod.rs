//! Deployment module

pub mod cancel;
pub mod deployer;
pub mod diagnose;
pub mod fastapi;
pub mod fsm;
pub mod git;
pub mod locks;
pub mod nextjs;
pub mod nodejs;
pub mod orchestrator;
pub mod static_site;
pub mod validate;
