//! Candidate URI management and failover
//!
//! Candidates are tried from the highest source priority down. A failed
//! candidate is never retried by the same downloader.

use crate::protocol::{sort_by_priority, SourceType};

/// One failed attempt
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub uri: String,
    pub error: String,
}

/// Priority-ordered candidate URIs with a failure log
#[derive(Debug, Clone)]
pub struct CandidateQueue {
    /// Remaining URIs, ascending priority; the next candidate is the last one
    remaining: Vec<String>,
    /// URI currently being tried
    current: Option<String>,
    failures: Vec<CandidateFailure>,
}

impl CandidateQueue {
    /// Build a queue from unordered URIs, dropping unrecognised schemes
    /// and duplicates
    pub fn new<S: AsRef<str>>(uris: &[S]) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(uris.len());
        for uri in uris {
            let uri = uri.as_ref().trim();
            if !uri.is_empty() && !unique.iter().any(|u| u == uri) {
                unique.push(uri.to_string());
            }
        }
        Self {
            remaining: sort_by_priority(&unique),
            current: None,
            failures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty() && self.current.is_none()
    }

    /// Candidates not yet tried
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Move on to the next best candidate
    pub fn next_candidate(&mut self) -> Option<(String, SourceType)> {
        let uri = self.remaining.pop()?;
        let kind = SourceType::of(&uri);
        self.current = Some(uri.clone());
        Some((uri, kind))
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Record that the current candidate failed
    pub fn report_failure(&mut self, error: impl Into<String>) {
        if let Some(uri) = self.current.take() {
            let error = error.into();
            tracing::debug!("Candidate {} failed: {}", uri, error);
            self.failures.push(CandidateFailure { uri, error });
        }
    }

    pub fn failures(&self) -> &[CandidateFailure] {
        &self.failures
    }

    /// The most recent failure message
    pub fn last_error(&self) -> Option<&str> {
        self.failures.last().map(|f| f.error.as_str())
    }
}
