//! Security transport
//!
//! Wraps the DTLS handshake driver and the SRTP contexts and gates the data
//! plane on handshake completion: SRTP contexts exist iff the handshake
//! finished, and protect/unprotect fail before that. The cryptographic
//! primitives themselves are external capabilities behind [`DtlsCore`] and
//! [`SrtpCore`].

use bytes::Bytes;

use crate::error::{ErrorKind, Result, RtcError};

/// Our DTLS role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// We initiate the handshake
    Active,
    /// We answer the peer's handshake
    Passive,
}

impl DtlsRole {
    /// Parse the SDP setup role string
    pub fn from_setup(setup: &str) -> Self {
        if setup.eq_ignore_ascii_case("active") {
            DtlsRole::Active
        } else {
            DtlsRole::Passive
        }
    }
}

/// External DTLS handshake driver
///
/// Implementations consume handshake records, queue outbound flights and
/// derive the SRTP context once the handshake completes.
pub trait DtlsCore: Send {
    /// Configure role and version before any record is processed
    fn initialize(&mut self, role: DtlsRole, version: &str) -> Result<()>;

    /// Begin the handshake when in the active role
    fn start_active_handshake(&mut self) -> Result<()>;

    /// Consume one handshake record from the peer
    fn on_handshake(&mut self, data: &[u8]) -> Result<()>;

    /// Drain outbound records queued by the driver
    fn pull_outbound(&mut self) -> Vec<Bytes>;

    /// Whether the handshake has completed
    fn is_done(&self) -> bool;

    /// Derive the SRTP context from the negotiated keys; valid once
    /// `is_done` returns true
    fn take_srtp(&mut self) -> Result<Box<dyn SrtpCore>>;
}

/// External SRTP protect/unprotect contexts (send and receive keys)
pub trait SrtpCore: Send {
    /// Encrypt one RTP packet
    fn protect_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes>;

    /// Encrypt one RTCP packet
    fn protect_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes>;

    /// Decrypt one RTP packet
    fn unprotect_rtp(&mut self, cipher: &[u8]) -> Result<Bytes>;

    /// Decrypt one RTCP packet
    fn unprotect_rtcp(&mut self, cipher: &[u8]) -> Result<Bytes>;
}

/// Result of feeding one DTLS record through the transport
#[derive(Debug, Default)]
pub struct DtlsOutcome {
    /// Records to write to the peer
    pub outbound: Vec<Bytes>,
    /// True exactly once, on the record that completed the handshake
    pub established: bool,
}

/// DTLS handshake and SRTP gating for one connection
pub struct SecurityTransport {
    dtls: Box<dyn DtlsCore>,
    srtp: Option<Box<dyn SrtpCore>>,
    handshake_done: bool,
}

impl SecurityTransport {
    /// Wrap a DTLS driver
    pub fn new(dtls: Box<dyn DtlsCore>) -> Self {
        Self {
            dtls,
            srtp: None,
            handshake_done: false,
        }
    }

    /// Configure the handshake role and version
    pub fn initialize(&mut self, role: DtlsRole, version: &str) -> Result<()> {
        self.dtls.initialize(role, version)
    }

    /// Start the active handshake, returning the first flight
    pub fn start_active_handshake(&mut self) -> Result<Vec<Bytes>> {
        self.dtls.start_active_handshake()?;
        Ok(self.dtls.pull_outbound())
    }

    /// Consume one handshake record
    ///
    /// `established` is reported only on the transition: retransmitted
    /// final flights do not re-trigger it.
    pub fn on_dtls(&mut self, data: &[u8]) -> Result<DtlsOutcome> {
        self.dtls.on_handshake(data)?;

        let mut outcome = DtlsOutcome {
            outbound: self.dtls.pull_outbound(),
            established: false,
        };

        if self.dtls.is_done() && !self.handshake_done {
            self.handshake_done = true;
            self.srtp = Some(
                self.dtls
                    .take_srtp()
                    .map_err(|e| e.wrap("srtp init failed"))?,
            );
            outcome.established = true;
        }

        Ok(outcome)
    }

    /// Whether the handshake completed and SRTP is installed
    pub fn is_established(&self) -> bool {
        self.handshake_done
    }

    /// Encrypt one RTP packet
    pub fn protect_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        match &mut self.srtp {
            Some(srtp) => srtp.protect_rtp(plaintext),
            None => Err(RtcError::new(ErrorKind::SrtpProtect, "rtp protect failed")),
        }
    }

    /// Encrypt one RTCP packet
    pub fn protect_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        match &mut self.srtp {
            Some(srtp) => srtp.protect_rtcp(plaintext),
            None => Err(RtcError::new(ErrorKind::SrtpProtect, "rtcp protect failed")),
        }
    }

    /// Decrypt one RTP packet
    pub fn unprotect_rtp(&mut self, cipher: &[u8]) -> Result<Bytes> {
        match &mut self.srtp {
            Some(srtp) => srtp.unprotect_rtp(cipher),
            None => Err(RtcError::new(
                ErrorKind::SrtpUnprotect,
                "rtp unprotect failed",
            )),
        }
    }

    /// Decrypt one RTCP packet
    pub fn unprotect_rtcp(&mut self, cipher: &[u8]) -> Result<Bytes> {
        match &mut self.srtp {
            Some(srtp) => srtp.unprotect_rtcp(cipher),
            None => Err(RtcError::new(
                ErrorKind::SrtpUnprotect,
                "rtcp unprotect failed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDtls;

    #[test]
    fn test_protect_fails_before_handshake() {
        let mut transport = SecurityTransport::new(Box::new(MockDtls::new()));
        transport.initialize(DtlsRole::Passive, "auto").unwrap();

        assert_eq!(
            transport.protect_rtp(b"x").unwrap_err().kind(),
            ErrorKind::SrtpProtect
        );
        assert_eq!(
            transport.protect_rtcp(b"x").unwrap_err().kind(),
            ErrorKind::SrtpProtect
        );
        assert_eq!(
            transport.unprotect_rtp(b"x").unwrap_err().kind(),
            ErrorKind::SrtpUnprotect
        );
        assert_eq!(
            transport.unprotect_rtcp(b"x").unwrap_err().kind(),
            ErrorKind::SrtpUnprotect
        );
    }

    #[test]
    fn test_established_reported_once() {
        let mut transport = SecurityTransport::new(Box::new(MockDtls::new()));
        transport.initialize(DtlsRole::Passive, "auto").unwrap();

        let outcome = transport.on_dtls(b"flight").unwrap();
        assert!(outcome.established);
        assert!(transport.is_established());

        // The final flight may be retransmitted by the peer.
        let again = transport.on_dtls(b"flight").unwrap();
        assert!(!again.established);
    }

    #[test]
    fn test_srtp_roundtrip_after_handshake() {
        let mut transport = SecurityTransport::new(Box::new(MockDtls::new()));
        transport.initialize(DtlsRole::Passive, "auto").unwrap();
        transport.on_dtls(b"flight").unwrap();

        let cipher = transport.protect_rtp(b"payload").unwrap();
        assert_ne!(&cipher[..], b"payload");
        let plain = transport.unprotect_rtp(&cipher).unwrap();
        assert_eq!(&plain[..], b"payload");
    }

    #[test]
    fn test_corrupt_cipher_fails_unprotect() {
        let mut transport = SecurityTransport::new(Box::new(MockDtls::new()));
        transport.initialize(DtlsRole::Passive, "auto").unwrap();
        transport.on_dtls(b"flight").unwrap();

        let mut cipher = transport.protect_rtp(b"payload").unwrap().to_vec();
        let last = cipher.len() - 1;
        cipher[last] ^= 0xFF;

        let err = transport.unprotect_rtp(&cipher).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SrtpUnprotect);
    }
}
