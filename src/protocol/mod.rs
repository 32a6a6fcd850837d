pub(crate) mod client;
pub(crate) mod messages;

pub use client::{ClientInfo, ProtocolVersion};
pub(crate) use client::ProtocolClient;
pub use messages::SUPPORTED_PROTOCOL_VERSIONS;
