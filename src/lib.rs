// ABOUTME: table-sync library root
// ABOUTME: Stage-to-main table synchronization with an audit history

pub mod catalog;
pub mod config;
pub mod error;
pub mod postgres;
pub mod query;
pub mod sync;
pub mod utils;
