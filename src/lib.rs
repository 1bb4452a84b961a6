//! Pipewatch: the library
//!
//! This is the library behind the `pipewatch` CLI tool. It watches a
//! directory tree and, whenever something relevant changes, cancels the
//! pipeline of commands that is currently running and starts it afresh.
//!
//! The pieces talk over an in-process [`exchange::Exchange`]: the
//! [`monitor::Monitor`] publishes rebuild requests, the
//! [`run::Orchestrator`] answers them with a new [`pipeline::Pipeline`], and
//! the pipeline publishes the progress of each of its stages.
//!
//! **The library interface follows the CLI tool and may change between
//! patch releases.** Please use exact version matching.

#![deny(unsafe_code, clippy::missing_const_for_fn)]
#![allow(clippy::default_trait_access, clippy::cognitive_complexity)]

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod exchange;
pub mod gitignore;
pub mod monitor;
mod notification_filter;
pub mod pathop;
pub mod pipeline;
mod process;
pub mod run;
mod signal;
mod watcher;

pub use run::run;
