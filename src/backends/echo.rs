//! Echo backend.
//!
//! Answers every command with the command and its arguments upper-cased,
//! without a status token. Useful for checking connectivity from a client.

use crate::command::Response;
use crate::dispatcher::Dispatcher;

pub struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    fn process(&self, name: &str, args: &[String]) -> Response {
        let mut line = name.to_ascii_uppercase();
        for arg in args {
            line.push(' ');
            line.push_str(&arg.to_ascii_uppercase());
        }
        Response::bare(line)
    }
}
