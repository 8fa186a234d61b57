//! Manager state: host layout, settings, records, ports and backups

pub mod backup;
pub mod layout;
pub mod ports;
pub mod records;
pub mod settings;
