pub mod outbound;

pub use outbound::{SendOutcome, TcpUpstreamClient};
