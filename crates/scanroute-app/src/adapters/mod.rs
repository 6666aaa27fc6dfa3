//! Concrete collaborators shipped with the watcher binary.

pub mod catalog;
pub mod mirror;
pub mod terminal;

pub use catalog::{CatalogOrder, CatalogOrderDirectory, JournalEntry};
pub use mirror::LocalMirrorStorage;
pub use terminal::TerminalPrompt;
