//! TUI module for terminal user interfaces

mod dashboard;

pub use dashboard::Dashboard;
