#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_panics_doc)]

//! Shared test helpers used across unit and integration suites.
//! Layout: fixtures.rs (scan folders on disk), mocks.rs (collaborator fakes).

pub mod fixtures;
pub mod mocks;

pub use mocks::{FakeDirectory, FakeStorage, ScriptedPrompt};
