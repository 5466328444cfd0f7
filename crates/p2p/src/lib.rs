//! Peer RPC between federators: fire-and-forget messages, and questions answered by topic.
//!
//! [`Network`] is the seam the bridges use. [`QuicNetwork`] runs it over the authenticated QUIC
//! transport; [`InMemoryNetwork`] runs it inside one process for tests.

pub mod dispatch;
pub mod errors;
pub mod memory;
pub mod messages;
pub mod network;
pub mod quic;

pub use dispatch::{MessageListener, QuestionHandler};
pub use errors::{AnswerError, NetworkError};
pub use memory::{InMemoryHub, InMemoryNetwork};
pub use messages::{Answer, Message, MessageEnvelope, NodeId, Question, Topic};
pub use network::Network;
pub use quic::{PeerConfig, QuicNetwork};
