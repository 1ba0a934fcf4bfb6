//! Error types for the RTC session core
//!
//! Every failure carries a kind plus a chain of contextual messages that is
//! extended as the error propagates out of the pipeline. Receive-side
//! handlers wrap and return; the outer demultiplexer logs and continues, so
//! one bad datagram never kills a session.

/// Classification of a session-core failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SDP offer/answer exchange failed
    SdpExchange,
    /// STUN binding handling failed
    Stun,
    /// RTP packet handling failed
    Rtp,
    /// RTCP packet handling failed
    Rtcp,
    /// Malformed RTCP (length overrun, unknown type in compound)
    RtcpCheck,
    /// SRTP protect called before or after it is usable
    SrtpProtect,
    /// SRTP unprotect failed or called before handshake completion
    SrtpUnprotect,
    /// Stream description missing or inconsistent
    StreamDesc,
    /// Operation requires a player that does not exist
    NoPlayer,
    /// Socket write failed
    Socket,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SdpExchange => "sdp_exchange",
            ErrorKind::Stun => "stun",
            ErrorKind::Rtp => "rtp",
            ErrorKind::Rtcp => "rtcp",
            ErrorKind::RtcpCheck => "rtcp_check",
            ErrorKind::SrtpProtect => "srtp_protect",
            ErrorKind::SrtpUnprotect => "srtp_unprotect",
            ErrorKind::StreamDesc => "stream_desc",
            ErrorKind::NoPlayer => "no_player",
            ErrorKind::Socket => "socket",
        }
    }
}

/// Error with a wrap-chain of contextual messages
///
/// The chain is stored innermost-first; `Display` prints outermost-first so
/// logs read from the failing operation down to the root cause.
#[derive(Debug, Clone)]
pub struct RtcError {
    kind: ErrorKind,
    chain: Vec<String>,
}

impl RtcError {
    /// Create a new error of the given kind
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            chain: vec![msg.into()],
        }
    }

    /// Add a layer of context while propagating
    pub fn wrap(mut self, msg: impl Into<String>) -> Self {
        self.chain.push(msg.into());
        self
    }

    /// The error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for RtcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        for msg in self.chain.iter().rev() {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for RtcError {}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, RtcError>;
