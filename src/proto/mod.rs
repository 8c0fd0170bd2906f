//! Wire protocol: line framing and SMTP command dispatch

pub mod codec;
pub mod smtp;

pub use codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec};
pub use smtp::{Action, Command, Context, Reply, Response, ResponseCode, dispatch};
