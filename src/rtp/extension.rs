//! RTP header extension registry
//!
//! Maps negotiated extmap ids to the extensions the core understands. Ids
//! are scoped to one media section, valid range 1..=14 for the one-byte
//! format.

/// Extension URI for transport-wide congestion control sequence numbers
pub const EXT_URI_TWCC: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Extension URI for the picture-id carried alongside encoded frames
pub const EXT_URI_PICTURE_ID: &str = "urn:ietf:params:rtp-hdrext:picture-id";

/// Header extensions the data plane understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    /// Transport-wide sequence number, two bytes
    TransportCc,
    /// Picture id, two bytes
    PictureId,
}

impl ExtensionKind {
    /// The extmap URI of this extension
    pub fn uri(self) -> &'static str {
        match self {
            ExtensionKind::TransportCc => EXT_URI_TWCC,
            ExtensionKind::PictureId => EXT_URI_PICTURE_ID,
        }
    }

    /// Resolve an extmap URI
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            EXT_URI_TWCC => Some(ExtensionKind::TransportCc),
            EXT_URI_PICTURE_ID => Some(ExtensionKind::PictureId),
            _ => None,
        }
    }
}

/// Negotiated id-to-extension mapping for one session
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionMap {
    ids: [Option<ExtensionKind>; 15],
}

impl ExtensionMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension id; ids outside 1..=14 are ignored
    pub fn register(&mut self, id: u8, kind: ExtensionKind) {
        if (1..=14).contains(&id) {
            self.ids[id as usize] = Some(kind);
        }
    }

    /// Register by extmap URI; returns whether the URI was recognized
    pub fn register_by_uri(&mut self, id: u8, uri: &str) -> bool {
        match ExtensionKind::from_uri(uri) {
            Some(kind) => {
                self.register(id, kind);
                true
            }
            None => false,
        }
    }

    /// The extension registered under an id
    pub fn kind_of(&self, id: u8) -> Option<ExtensionKind> {
        if (1..=14).contains(&id) {
            self.ids[id as usize]
        } else {
            None
        }
    }

    /// The id an extension is registered under
    pub fn id_of(&self, kind: ExtensionKind) -> Option<u8> {
        self.ids
            .iter()
            .position(|slot| *slot == Some(kind))
            .map(|id| id as u8)
    }
}
