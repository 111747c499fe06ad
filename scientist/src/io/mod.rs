//! I/O helpers: config, templates, delegates, and process supervision.

pub mod config;
pub mod delegates;
pub mod fs_tree;
pub mod process;
pub mod prompt_store;
pub mod reaper;
