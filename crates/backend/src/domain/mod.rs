//! Domain types shared across the daemon.

pub mod config;
