//! beamline-tcp: a line-oriented TCP command server for beamline
//! instrument backends.
//!
//! A client (typically a beamline control macro) sends one command per line:
//!
//! ```text
//! <COMMAND> [<ARG1> <ARG2> ...]\n
//! ```
//!
//! and reads one status line back, optionally followed by binary data.
//! The engine (framing, sessions, server lifecycle) is independent of the
//! command set; backends plug in through [`dispatcher::Dispatcher`].
//!
//! Backends:
//! - Echo: upper-cased echo of each command
//! - Image: display frames with regions of interest and count limits
//! - Detector: pixel detector acquisition with binary frame readout

pub mod backends;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod framer;
pub mod server;
pub mod session;
