//! minik8s - cluster state store with a shared change-notification relay
//!
//! Consumers that watch the same key share one store watch: the control
//! plane's [`watch::WatchRegistry`] relays store events onto a [`bus`] topic
//! named after the key, and each consumer's [`watch::ListerWatcher`] follows
//! that topic. [`cache::ReconciliationCache`] merges relayed events with
//! periodic re-lists.

pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod server;
pub mod store;
pub mod watch;
