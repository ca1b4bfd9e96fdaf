pub mod alf;
pub mod app;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod filter;
pub mod fs_util;
pub mod ledger;
pub mod output;
pub mod store;
pub mod sync;
