pub mod app;
pub mod archive;
pub mod catalog;
pub mod config;
pub mod delta;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod output;
pub mod revisions;
pub mod scheduler;
pub mod store;
pub mod updates;
