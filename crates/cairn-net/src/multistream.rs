//! Multistream-select protocol negotiation.
//!
//! Line-oriented: every message is `varint(len) || utf8 || '\n'`. Both sides
//! open with the `/multistream/1.0.0` header; the initiator then proposes
//! protocol ids until one is echoed back, the responder answers `na` for
//! anything it cannot serve and `ls` requests with a listing.

use std::sync::Arc;

use thiserror::Error;

use cairn_core::stream::{read_lp, write_lp, ByteStream, StreamError};

pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

const NA: &str = "na";
const LS: &str = "ls";

/// Bound on a single negotiation message.
const MAX_MESSAGE: usize = 1024;

/// Bound on an `ls` listing reply.
const MAX_LISTING: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("none of the proposed protocols were accepted: {tried:?}")]
    ProtocolNotSupported { tried: Vec<String> },

    #[error("negotiation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// One registered protocol on the responder side: an exact id plus an
/// optional predicate for family matches (e.g. versioned prefixes).
#[derive(Clone)]
pub struct ProtocolMatcher {
    pub id: String,
    pub matcher: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl ProtocolMatcher {
    pub fn exact(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            matcher: None,
        }
    }

    pub fn with_matcher(
        id: impl Into<String>,
        matcher: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            id: id.into(),
            matcher: Some(matcher),
        }
    }

    pub fn matches(&self, proposed: &str) -> bool {
        match &self.matcher {
            Some(m) => m(proposed),
            None => self.id == proposed,
        }
    }
}

impl std::fmt::Debug for ProtocolMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolMatcher")
            .field("id", &self.id)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

async fn write_msg<S: ByteStream + ?Sized>(io: &S, msg: &str) -> Result<(), StreamError> {
    let mut line = Vec::with_capacity(msg.len() + 1);
    line.extend_from_slice(msg.as_bytes());
    line.push(b'\n');
    write_lp(io, &line).await
}

async fn read_msg<S: ByteStream + ?Sized>(io: &S, max: usize) -> Result<String, NegotiationError> {
    let line = read_lp(io, max).await?;
    match line.last() {
        Some(b'\n') => {}
        _ => return Err(NegotiationError::Failed("message not newline-terminated".into())),
    }
    String::from_utf8(line[..line.len() - 1].to_vec())
        .map_err(|_| NegotiationError::Failed("message not utf-8".into()))
}

async fn exchange_header<S: ByteStream + ?Sized>(io: &S) -> Result<(), NegotiationError> {
    write_msg(io, PROTOCOL_ID).await?;
    let header = read_msg(io, MAX_MESSAGE).await?;
    if header != PROTOCOL_ID {
        return Err(NegotiationError::Failed(format!(
            "unexpected multistream header {header:?}"
        )));
    }
    Ok(())
}

// ── Initiator ─────────────────────────────────────────────────────────────────

/// Propose `candidates` in order; return the accepted id.
pub async fn select<S: ByteStream + ?Sized>(
    io: &S,
    candidates: &[&str],
) -> Result<String, NegotiationError> {
    exchange_header(io).await?;
    for candidate in candidates {
        write_msg(io, candidate).await?;
        let reply = read_msg(io, MAX_MESSAGE).await?;
        if reply == *candidate {
            tracing::debug!(protocol = %candidate, "negotiated");
            return Ok(reply);
        }
        if reply != NA {
            return Err(NegotiationError::Failed(format!(
                "unexpected reply {reply:?} to proposal {candidate:?}"
            )));
        }
    }
    Err(NegotiationError::ProtocolNotSupported {
        tried: candidates.iter().map(|s| s.to_string()).collect(),
    })
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Answer proposals until one matches a registered protocol; return the
/// proposed id that matched (which the caller dispatches on).
pub async fn handle<S: ByteStream + ?Sized>(
    io: &S,
    registry: &[ProtocolMatcher],
) -> Result<String, NegotiationError> {
    exchange_header(io).await?;
    loop {
        let proposed = read_msg(io, MAX_MESSAGE).await?;
        if proposed == LS {
            let mut listing = Vec::new();
            for entry in registry {
                listing.extend_from_slice(entry.id.as_bytes());
                listing.push(b'\n');
            }
            if listing.len() > MAX_LISTING {
                return Err(NegotiationError::Failed("listing too large".into()));
            }
            write_lp(io, &listing).await?;
            continue;
        }
        if registry.iter().any(|entry| entry.matches(&proposed)) {
            write_msg(io, &proposed).await?;
            tracing::debug!(protocol = %proposed, "accepted");
            return Ok(proposed);
        }
        write_msg(io, NA).await?;
    }
}

/// Read an `ls` listing reply (initiator side).
pub async fn list<S: ByteStream + ?Sized>(io: &S) -> Result<Vec<String>, NegotiationError> {
    exchange_header(io).await?;
    write_msg(io, LS).await?;
    let listing = read_lp(io, MAX_LISTING).await?;
    Ok(listing
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
