//! Client for the gradio queue-join websocket protocol.
//!
//! A client opens `ws://<host>/queue/join`, waits for the server to ask for
//! its session hash and call arguments, then receives streamed generation
//! events terminating in `process_completed`.

pub mod connection;
pub mod decoder;
pub mod invocation;
pub mod messages;
pub mod session;

pub use invocation::{Invocation, Phase, PhaseKind};
pub use messages::{ImageDescriptor, PacketOutput, ServerPacket};
pub use session::{Session, SessionProvider};
