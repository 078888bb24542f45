#![doc = "ff2zim-core: project state, target lifecycle and build pipeline for ff2zim."]

//! Everything that decides *what* happens lives here: the option store, the
//! target registry and its state machine, update detection, project tree
//! resolution and the build pipeline. Everything that talks to the outside
//! world (fanficfare, zimwriterfs, mailboxes, HTTP) is behind the traits in
//! [`contract`] and implemented by the `ff2zim` crate.
//!
//! Every operation takes an explicit [`project::Project`]; there is no
//! ambient "current project" in this crate.

pub mod build;
pub mod bundle;
pub mod config;
pub mod contract;
pub mod detector;
pub mod error;
pub mod identifier;
pub mod lifecycle;
pub mod project;
pub mod registry;
pub mod resolve;

mod persist;

pub use persist::list_lines;
