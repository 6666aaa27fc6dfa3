//! Command handlers grouped by concern.

pub(crate) mod activity;
pub(crate) mod jobs;
pub(crate) mod staging;
