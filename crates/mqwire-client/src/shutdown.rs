//! Terminal shutdown causes.
//!
//! A connection or channel records exactly one cause (the first trigger
//! wins, later triggers are ignored), and every blocked caller and every
//! registered consumer observes it.

use std::fmt;

/// Who or what initiated the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CauseKind {
    /// The application called close.
    AppInitiated,
    /// The peer sent a close method.
    PeerInitiated,
    /// Transport failure, protocol violation, or heartbeat timeout.
    ConnectionError,
}

/// The immutable, first-recorded reason a connection or channel became
/// unusable.
#[derive(Debug, Clone)]
pub struct ShutdownCause {
    pub kind: CauseKind,
    /// Protocol reply code (200 for a clean close).
    pub reply_code: u16,
    pub reply_text: String,
    /// Description of the originating failure, if any.
    pub source: Option<String>,
}

impl ShutdownCause {
    pub fn app_initiated(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            kind: CauseKind::AppInitiated,
            reply_code,
            reply_text: reply_text.into(),
            source: None,
        }
    }

    pub fn peer_initiated(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            kind: CauseKind::PeerInitiated,
            reply_code,
            reply_text: reply_text.into(),
            source: None,
        }
    }

    pub fn connection_error(reply_text: impl Into<String>) -> Self {
        Self {
            kind: CauseKind::ConnectionError,
            reply_code: 0,
            reply_text: reply_text.into(),
            source: None,
        }
    }

    /// Attach a description of the originating failure.
    pub fn with_source(mut self, source: impl fmt::Display) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// True for a clean, application-initiated close with a success code.
    pub fn is_clean(&self) -> bool {
        self.kind == CauseKind::AppInitiated
            && self.reply_code == mqwire_frame::REPLY_SUCCESS
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CauseKind::AppInitiated => "app-initiated",
            CauseKind::PeerInitiated => "peer-initiated",
            CauseKind::ConnectionError => "connection error",
        };
        write!(f, "{kind} (code {}) {}", self.reply_code, self.reply_text)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}
