pub mod app;
pub mod catalog;
pub mod config;
pub mod dap;
pub mod domain;
pub mod error;
pub mod granule;
pub mod grid;
pub mod output;
pub mod query;
pub mod registry;
pub mod session;
pub mod store;
