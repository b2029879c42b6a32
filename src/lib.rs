//! Telepresence session controller.
//!
//! Gives a local shell the network identity of a pod inside a remote
//! Kubernetes cluster: service-discovery environment projected in, outbound
//! traffic dialed through an in-pod SOCKS proxy, and selected local ports
//! reachable from the cluster. kubectl, ssh, and torsocks are external
//! collaborators; this crate supervises them and owns the session lifetime.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod envproj;
pub mod error;
pub mod kubectl;
pub mod pod;
pub mod preflight;
pub mod report;
pub mod runner;
pub mod session;
pub mod shell;
pub mod tunnel;
pub mod ui;

pub use config::{Cli, Settings};
pub use error::Error;
