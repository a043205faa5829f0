//! pipewrench: pipes HTTP message bodies through external filter commands.
//!
//! Reads an HTTP byte stream (requests or responses, auto-detected) from an
//! input descriptor, routes each message's body through a freshly spawned
//! shell command, and re-emits the message with its framing corrected for
//! the filtered body. Messages whose `Content-Type` does not match an
//! optional glob pattern pass through untouched.

pub mod buffer;
pub mod channel;
pub mod intercept;
pub mod parser;
pub mod stream;

pub use buffer::StreamBuffer;
pub use channel::{ChannelState, PipeChannel, SpawnError};
pub use intercept::{InterceptConfig, Interceptor};
pub use parser::{Event, Head, MessageKind, ParseError, Tokenizer};
pub use stream::{PipelineError, run_pipeline};

/// Exit codes reported to the shell, mirroring BSD sysexits.
pub mod exit {
    pub const OK: i32 = 0;
    /// Command line could not be understood.
    pub const USAGE: i32 = 64;
    /// The filter subprocess could not be spawned.
    pub const UNAVAILABLE: i32 = 69;
    /// The system shell is missing or another OS-level failure occurred.
    pub const OSERR: i32 = 71;
    /// The input stream could not be read or parsed.
    pub const IOERR: i32 = 74;
}
