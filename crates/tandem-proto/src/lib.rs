//! Wire protocol spoken between tandem peers and the rendezvous server.
//!
//! Every transport frame carries exactly one JSON document. Keepalives are
//! bare strings (`"ping"` / `"pong"`); everything else is an object tagged by
//! `msgType`. Negotiation payloads (`data`) are opaque to the server and are
//! only interpreted by peers, see [`payload`].

mod codec;
mod messages;
pub mod payload;
mod peer_id;

pub use codec::ProtocolError;
pub use messages::{ClientFrame, ClientMessage, Keepalive, RelayKind, ServerFrame, ServerMessage};
pub use peer_id::PeerId;
