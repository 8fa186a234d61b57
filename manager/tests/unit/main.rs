//! Unit and workflow tests

mod common;
mod test_deployers;
mod test_progress;
mod test_source;
mod test_systemd;
