//! Command lines and responses.
//!
//! Request format:
//!
//! ```text
//! <COMMAND> [<ARG1> <ARG2> ...]\n
//! ```
//!
//! Response format:
//!
//! ```text
//! OK <message>\n
//! ERROR:<code> <message>\n
//! UNKNOWN <message>\n
//! ```
//!
//! A response may be followed by a raw binary payload whose element count
//! and type are declared in the message (e.g. `OK last_frame int16 65536`).
//! There is no byte-level length prefix; clients read in lockstep.

use bytes::{BufMut, BytesMut};

/// Reserved command that ends the session and shuts the server down.
pub const QUIT: &str = "QUIT";

/// The dispatcher panicked while computing a response.
pub const ERR_INTERNAL: i32 = 100;
/// No handler for the command name.
pub const ERR_UNKNOWN_COMMAND: i32 = 101;
/// Wrong number of arguments, or an argument failed to parse.
pub const ERR_ILLEGAL_ARGUMENTS: i32 = 102;
/// The requested data does not exist yet.
pub const ERR_NO_DATA: i32 = 103;
/// A conflicting operation is in progress.
pub const ERR_BUSY: i32 = 104;

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Upper-cased command name.
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Split a framed line into name and arguments.
    ///
    /// Returns `None` for a line with no tokens.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?.to_ascii_uppercase();
        let args = tokens.map(str::to_string).collect();
        Some(Self { name, args })
    }

    /// Whether this is the reserved termination command.
    pub fn is_quit(&self) -> bool {
        self.name == QUIT
    }
}

/// Re-join variadic trailing arguments, starting at `from`.
pub fn rest(args: &[String], from: usize) -> String {
    args.get(from..).map(|tail| tail.join(" ")).unwrap_or_default()
}

/// Status token at the start of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error(i32),
    /// Operation started but not completed (fire-and-forget).
    Pending,
    /// No status token; the message is the whole line.
    Bare,
}

/// What the session does after writing a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum After {
    #[default]
    Continue,
    /// Close the session and signal server shutdown.
    Shutdown,
}

/// Binary data following a response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Little-endian signed 16-bit elements.
    Int16(Vec<i16>),
}

impl Payload {
    fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Payload::Int16(values) => {
                out.reserve(values.len() * 2);
                for v in values {
                    out.put_i16_le(*v);
                }
            }
        }
    }
}

/// A dispatcher response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub payload: Option<Payload>,
    pub after: After,
}

impl Response {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
            after: After::Continue,
        }
    }

    /// `OK <message>`
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::Ok, message)
    }

    /// `ERROR:<code> <message>`
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::new(Status::Error(code), message)
    }

    /// `UNKNOWN <message>`
    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(Status::Pending, message)
    }

    /// A line with no status token.
    pub fn bare(message: impl Into<String>) -> Self {
        Self::new(Status::Bare, message)
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::error(ERR_UNKNOWN_COMMAND, format!("{name} unknown_command"))
    }

    pub fn illegal_arguments(name: &str) -> Self {
        Self::error(
            ERR_ILLEGAL_ARGUMENTS,
            format!("{} illegal_arguments", name.to_ascii_lowercase()),
        )
    }

    pub fn internal_error() -> Self {
        Self::error(ERR_INTERNAL, "internal_error")
    }

    pub fn busy() -> Self {
        Self::error(ERR_BUSY, "busy")
    }

    /// Acknowledgment for the reserved `QUIT` command.
    pub fn quit() -> Self {
        Self::ok("quit")
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn then_shutdown(mut self) -> Self {
        self.after = After::Shutdown;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Format the text line, without terminator.
    pub fn line(&self) -> String {
        let token = match self.status {
            Status::Ok => "OK".to_string(),
            Status::Error(code) => format!("ERROR:{code}"),
            Status::Pending => "UNKNOWN".to_string(),
            Status::Bare => return self.message.clone(),
        };
        if self.message.is_empty() {
            token
        } else {
            format!("{token} {}", self.message)
        }
    }

    /// Encode the line, terminator, and payload for the socket.
    pub fn encode(&self) -> BytesMut {
        let line = self.line();
        let mut out = BytesMut::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.put_u8(b'\n');
        if let Some(payload) = &self.payload {
            payload.encode_into(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upper_cases_name_only() {
        let cmd = Command::parse("image 0 Data/Scan.txt").unwrap();
        assert_eq!(cmd.name, "IMAGE");
        assert_eq!(cmd.args, vec!["0", "Data/Scan.txt"]);
    }

    #[test]
    fn test_parse_collapses_whitespace() {
        let cmd = Command::parse("RECT  0\t1   2 3 4").unwrap();
        assert_eq!(cmd.args, vec!["0", "1", "2", "3", "4"]);
        assert!(Command::parse("   ").is_none());
    }

    #[test]
    fn test_quit_is_case_insensitive() {
        for line in ["quit", "QUIT", "Quit"] {
            assert!(Command::parse(line).unwrap().is_quit());
        }
        assert!(!Command::parse("quitter").unwrap().is_quit());
    }

    #[test]
    fn test_rest_rejoins_tail() {
        let cmd = Command::parse("IMAGE 0 my scan file.txt").unwrap();
        assert_eq!(rest(&cmd.args, 1), "my scan file.txt");
        assert_eq!(rest(&cmd.args, 4), "");
        assert_eq!(rest(&cmd.args, 9), "");
    }

    #[test]
    fn test_response_lines() {
        assert_eq!(Response::ok("set_frame 2").line(), "OK set_frame 2");
        assert_eq!(Response::ok("").line(), "OK");
        assert_eq!(Response::error(2, "set_image 0 x").line(), "ERROR:2 set_image 0 x");
        assert_eq!(Response::pending("acquire_nowait").line(), "UNKNOWN acquire_nowait");
        assert_eq!(Response::bare("FRAME 3").line(), "FRAME 3");
        assert_eq!(Response::quit().line(), "OK quit");
    }

    #[test]
    fn test_generic_errors() {
        assert_eq!(
            Response::unknown_command("FOO").line(),
            "ERROR:101 FOO unknown_command"
        );
        assert_eq!(
            Response::illegal_arguments("FRAME").line(),
            "ERROR:102 frame illegal_arguments"
        );
        assert_eq!(Response::busy().line(), "ERROR:104 busy");
        assert_eq!(Response::internal_error().line(), "ERROR:100 internal_error");
    }

    #[test]
    fn test_encode_with_int16_payload() {
        let resp = Response::ok("last_frame int16 2").with_payload(Payload::Int16(vec![1, -2]));
        let encoded = resp.encode();
        assert_eq!(&encoded[..], b"OK last_frame int16 2\n\x01\x00\xfe\xff");
    }

    #[test]
    fn test_then_shutdown() {
        assert_eq!(Response::ok("kill").after, After::Continue);
        assert_eq!(Response::ok("kill").then_shutdown().after, After::Shutdown);
    }
}
