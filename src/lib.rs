pub mod admission;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod mgrast;
pub mod output;
pub mod rarefaction;
pub mod table;
