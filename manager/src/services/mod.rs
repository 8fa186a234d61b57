//! Host services the manager drives: nginx, systemd and the maintenance pages

pub mod maintenance;
pub mod nginx;
pub mod systemd;
