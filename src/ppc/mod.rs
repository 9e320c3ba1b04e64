//! Parent-procedure-call protocol.
//!
//! Workers ask the parent to act on their behalf over a private socket pair:
//! spawn a sibling worker, append a line to a centralized log. Every request
//! gets exactly one response, in order.

pub mod channel;
pub mod codec;
pub mod command;
pub mod dispatch;
mod handlers;

pub use channel::{pair, PpcChannel, PpcClient};
pub use codec::{read_frame, write_frame, Frame, MAX_PAYLOAD};
pub use command::Opcode;
pub use dispatch::{Dispatcher, Handler, Origin, PpcHost};
