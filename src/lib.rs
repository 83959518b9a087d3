//! Frontend performance and error monitoring.
//!
//! A browser-side [`collector`] batches web vitals, errors and replay frames
//! and ships them to the [`server`], which validates and enriches them in
//! [`ingest`], persists them in a [`store`], raises [`alert`]s and answers
//! dashboard queries through [`aggregate`].

pub mod aggregate;
pub mod alert;
pub mod clock;
pub mod codec;
pub mod collector;
pub mod config;
pub mod event;
pub mod ingest;
pub mod insight;
pub mod migrate;
pub mod server;
pub mod store;
pub mod symbolicate;
