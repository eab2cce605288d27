//! Hash chain bookkeeping for one endpoint.
//!
//! Every request of a named sequence (its `Test-Name`) carries the hash of
//! the request handled before it in that sequence, so identical requests
//! repeated within one test still hash differently:
//!
//! ```text
//! GET /poll  prev=HEAD_SHA   -> h1
//! GET /poll  prev=h1         -> h2
//! GET /poll  prev=h2         -> h3
//! ```
//!
//! Requests without a test name are never chained.

use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::format::Format;
use crate::request::{RecordedRequest, HEAD_SHA};

/// Where a request sits in its chain once linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub hash: String,
    /// Sanitized test name, if the request carried one.
    pub sequence: Option<String>,
    /// Recording file stem: the sequence name, or the hash.
    pub file_name: String,
    /// No request of its sequence has been handled yet in this run.
    pub first_in_sequence: bool,
}

#[derive(Debug, Default)]
pub struct ChainState {
    heads: HashMap<String, String>,
    seen: HashSet<String>,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps `req` with its previous-request hash and computes its own.
    ///
    /// The head only moves on [`ChainState::advance`], so a request that
    /// fails to be handled does not shift the rest of its sequence.
    pub fn link(&mut self, req: &mut RecordedRequest, format: Format) -> Result<Resolved, StoreError> {
        let sequence = req.test_name()?;
        let (previous, first_in_sequence) = match &sequence {
            Some(name) => (
                self.heads.get(name).cloned().unwrap_or_else(|| HEAD_SHA.to_string()),
                !self.seen.contains(name),
            ),
            None => (HEAD_SHA.to_string(), true),
        };
        req.previous_request = previous;

        let hash = format.compute_sum(req)?;
        let file_name = sequence.clone().unwrap_or_else(|| hash.clone());
        Ok(Resolved {
            hash,
            sequence,
            file_name,
            first_in_sequence,
        })
    }

    /// Moves the head of the request's sequence to its hash and marks the
    /// sequence as started for this run.
    pub fn advance(&mut self, resolved: &Resolved) {
        if let Some(name) = &resolved.sequence {
            self.seen.insert(name.clone());
            self.heads.insert(name.clone(), resolved.hash.clone());
        }
    }
}
