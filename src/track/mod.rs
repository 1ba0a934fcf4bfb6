//! Track descriptions and per-SSRC send/receive state

pub mod description;
pub mod recv;
pub mod ring;
pub mod send;

pub use description::{
    AuxKind, AuxPayload, CodecAttrs, MediaPayload, StreamDescription, TrackConfig,
    TrackDescription,
};
pub use recv::RecvTrack;
pub use ring::{PacketRing, SeqTracker};
pub use send::SendTrack;
