//! Per-connection session machinery: lifecycle, negotiation, ingest and
//! egress pipelines

pub mod connection;
pub mod negotiate;
pub mod play;
pub mod publish;
pub mod stats;
pub mod switch;

pub use connection::{ConnectionState, RtcConnection, SendSummary};
pub use play::RtcPlayStream;
pub use publish::RtcPublishStream;
pub use stats::ConnectionStats;
pub use switch::{StreamSwitchContext, SwitchDecision};
