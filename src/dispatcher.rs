//! The backend customization point.
//!
//! A [`Dispatcher`] turns one command into one response. The session
//! engine knows nothing about the command set; backends register their
//! handlers in a [`CommandTable`] and look them up by name.

use crate::command::Response;
use std::collections::HashMap;

/// Backend command processor shared by all sessions.
///
/// Implementations must be total: every `(name, args)` pair gets a
/// response. `process` may be called concurrently from several sessions,
/// so implementations serialize access to their own state.
pub trait Dispatcher: Send + Sync + 'static {
    /// Compute the response for an upper-cased command name and its arguments.
    fn process(&self, name: &str, args: &[String]) -> Response;

    /// Release backend resources. Called once after the server stops serving.
    fn close(&self) {}
}

/// Handler signature for a single command.
pub type Handler<B> = fn(&B, &[String]) -> Response;

/// Name-indexed handler table for a backend type `B`.
pub struct CommandTable<B> {
    handlers: HashMap<&'static str, Handler<B>>,
}

impl<B> CommandTable<B> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. `name` must be upper case.
    pub fn register(mut self, name: &'static str, handler: Handler<B>) -> Self {
        debug_assert_eq!(name, name.to_ascii_uppercase(), "command names are upper case");
        debug_assert!(!self.contains(name), "command {name} registered twice");
        self.handlers.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `name`, or answer with an unknown-command error.
    pub fn dispatch(&self, backend: &B, name: &str, args: &[String]) -> Response {
        match self.handlers.get(name) {
            Some(handler) => handler(backend, args),
            None => Response::unknown_command(name),
        }
    }
}

impl<B> Default for CommandTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a numeric argument, mapping failure to `None`.
pub fn arg<T: std::str::FromStr>(args: &[String], index: usize) -> Option<T> {
    args.get(index)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        base: i64,
    }

    fn add(counter: &Counter, args: &[String]) -> Response {
        match (args.len(), arg::<i64>(args, 0)) {
            (1, Some(n)) => Response::ok(format!("add {}", counter.base + n)),
            _ => Response::illegal_arguments("ADD"),
        }
    }

    fn table() -> CommandTable<Counter> {
        CommandTable::new().register("ADD", add)
    }

    #[test]
    fn test_dispatch_registered() {
        let counter = Counter { base: 40 };
        let resp = table().dispatch(&counter, "ADD", &["2".to_string()]);
        assert_eq!(resp.line(), "OK add 42");
    }

    #[test]
    fn test_dispatch_unknown() {
        let counter = Counter { base: 0 };
        let resp = table().dispatch(&counter, "SUB", &[]);
        assert_eq!(resp.line(), "ERROR:101 SUB unknown_command");
    }

    #[test]
    fn test_illegal_arguments() {
        let counter = Counter { base: 0 };
        let resp = table().dispatch(&counter, "ADD", &["two".to_string()]);
        assert_eq!(resp.line(), "ERROR:102 add illegal_arguments");
    }

    #[test]
    fn test_names() {
        let table = table().register("SUB", add);
        assert_eq!(table.names(), vec!["ADD", "SUB"]);
        assert!(table.contains("SUB"));
        assert!(!table.contains("sub"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration() {
        let _ = table().register("ADD", add);
    }

    #[test]
    fn test_arg_parsing() {
        let args = vec!["3".to_string(), "1.5".to_string(), "x".to_string()];
        assert_eq!(arg::<usize>(&args, 0), Some(3));
        assert_eq!(arg::<f64>(&args, 1), Some(1.5));
        assert_eq!(arg::<i32>(&args, 2), None);
        assert_eq!(arg::<i32>(&args, 3), None);
    }
}
