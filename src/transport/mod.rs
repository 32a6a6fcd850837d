pub(crate) mod params;
pub(crate) mod stdio;

pub use params::ServerParams;
pub(crate) use stdio::StdioTransport;
