//! Core crate for genvid: provider clients, remote task polling and the
//! in-process task manager behind the HTTP API.

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod poller;
pub mod provider;
pub mod server;
pub mod task;
