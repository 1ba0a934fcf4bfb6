//! Server-side WebRTC media session core
//!
//! One [`session::RtcConnection`] terminates ICE-lite/DTLS/SRTP with a
//! remote peer and moves real-time audio and video between the peer and an
//! in-process media bus: as a publisher it ingests RTP into a
//! [`bus::Source`], as a player it drains a consumer and transmits. The
//! crate covers the per-connection state machine and the RTP/RTCP data
//! plane: SDP capability negotiation, the security handshake sequencing,
//! the publish ingest pipeline (header parse, TWCC accounting, SRTP
//! unprotect, track demultiplex), the play egress pipeline (consumer
//! drain, track dispatch, SRTP protect, transmit), and RTCP handling
//! (NACK retransmission, PLI, SR/RR, XR round-trip time, TWCC feedback).
//!
//! The UDP listener, the DTLS/SRTP primitives, the media bus, SDP text
//! parsing and the configuration store are external collaborators,
//! consumed through the traits in [`net`], [`transport`], [`bus`] and
//! [`server`].

pub mod bus;
pub mod error;
pub mod gcc;
pub mod net;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod server;
pub mod session;
pub mod stun;
pub mod track;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorKind, Result, RtcError};
pub use server::{ConfigProvider, ServerEnv, StaticConfig, StreamRequest};
pub use session::{ConnectionState, RtcConnection, RtcPlayStream, RtcPublishStream};
