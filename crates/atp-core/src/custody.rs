//! HMAC-chained custody log for registry-affecting events.
//!
//! Append-only JSONL file where each line carries the previous entry's HMAC,
//! the event, and `HMAC-SHA256(key, prev_hmac || canonical_event_json)`.
//! Verification re-derives the chain; the first broken link fails the log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::RouterError;
use crate::registry::hex_encode;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A single custody event (build, scan, sign, deploy, promote,
/// registry_update).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodyEvent {
    pub event_type: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// One chained line of the custody log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainEntry {
    prev_hmac: String,
    event: CustodyEvent,
    hmac: String,
}

// ---------------------------------------------------------------------------
// CustodyLog
// ---------------------------------------------------------------------------

pub struct CustodyLog {
    path: PathBuf,
    key: hmac::Key,
    last_hmac: Mutex<Option<String>>,
    clock: std::sync::Arc<dyn Clock>,
}

impl std::fmt::Debug for CustodyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyLog")
            .field("path", &self.path)
            .field("last_hmac", &self.last_hmac)
            .finish_non_exhaustive()
    }
}

impl CustodyLog {
    /// Open (or create) a custody log. If the file already has entries, the
    /// chain is verified so appends continue from the last valid link.
    pub fn open(
        path: impl Into<PathBuf>,
        key_material: &[u8],
        clock: std::sync::Arc<dyn Clock>,
    ) -> Result<Self, RouterError> {
        let path = path.into();
        let key = hmac::Key::new(hmac::HMAC_SHA256, key_material);
        let last = if path.exists() {
            verify_file(&path, &key)?
        } else {
            None
        };
        Ok(Self {
            path,
            key,
            last_hmac: Mutex::new(last),
            clock,
        })
    }

    /// Append an event, returning its chain HMAC.
    pub fn append(
        &self,
        event_type: &str,
        model_id: &str,
        details: serde_json::Value,
    ) -> Result<String, RouterError> {
        let event = CustodyEvent {
            event_type: event_type.to_string(),
            model_id: model_id.to_string(),
            timestamp: self.clock.now(),
            details,
        };

        // Serialize + write under the chain lock so concurrent appends
        // cannot interleave and fork the chain.
        let mut last = self.last_hmac.lock().unwrap_or_else(|e| e.into_inner());
        let prev = last.clone().unwrap_or_default();
        let mac = chain_hmac(&self.key, &prev, &event)?;

        let entry = ChainEntry {
            prev_hmac: prev,
            event,
            hmac: mac.clone(),
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| RouterError::Internal(format!("custody serialization: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RouterError::RepositoryUnavailable(format!("custody open: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| RouterError::RepositoryUnavailable(format!("custody write: {e}")))?;

        *last = Some(mac.clone());
        Ok(mac)
    }

    /// Verify the whole chain. Returns the number of valid entries; the
    /// first broken link yields `CustodyTampered`.
    pub fn verify(&self) -> Result<usize, RouterError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut count = 0usize;
        let mut expected_prev = String::new();
        for (idx, line) in read_lines(&self.path)?.into_iter().enumerate() {
            let entry: ChainEntry = serde_json::from_str(&line)
                .map_err(|_| RouterError::CustodyTampered { entry: idx })?;
            if entry.prev_hmac != expected_prev {
                return Err(RouterError::CustodyTampered { entry: idx });
            }
            let mac = chain_hmac(&self.key, &entry.prev_hmac, &entry.event)?;
            if mac != entry.hmac {
                return Err(RouterError::CustodyTampered { entry: idx });
            }
            expected_prev = entry.hmac;
            count += 1;
        }
        Ok(count)
    }

    /// Read events, optionally filtered by model id.
    pub fn events(&self, model_id: Option<&str>) -> Result<Vec<CustodyEvent>, RouterError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (idx, line) in read_lines(&self.path)?.into_iter().enumerate() {
            let entry: ChainEntry = serde_json::from_str(&line)
                .map_err(|_| RouterError::CustodyTampered { entry: idx })?;
            if model_id.map_or(true, |m| entry.event.model_id == m) {
                out.push(entry.event);
            }
        }
        Ok(out)
    }
}

fn chain_hmac(key: &hmac::Key, prev: &str, event: &CustodyEvent) -> Result<String, RouterError> {
    // Canonical event JSON: serde_json object keys are sorted, so two
    // serializations of the same event always agree.
    let event_json = serde_json::to_value(event)
        .and_then(|v| serde_json::to_string(&v))
        .map_err(|e| RouterError::Internal(format!("custody canonicalization: {e}")))?;
    let mut data = Vec::with_capacity(prev.len() + event_json.len());
    data.extend_from_slice(prev.as_bytes());
    data.extend_from_slice(event_json.as_bytes());
    Ok(hex_encode(hmac::sign(key, &data).as_ref()))
}

fn verify_file(path: &Path, key: &hmac::Key) -> Result<Option<String>, RouterError> {
    let mut expected_prev = String::new();
    let mut last = None;
    for (idx, line) in read_lines(path)?.into_iter().enumerate() {
        let entry: ChainEntry =
            serde_json::from_str(&line).map_err(|_| RouterError::CustodyTampered { entry: idx })?;
        if entry.prev_hmac != expected_prev {
            return Err(RouterError::CustodyTampered { entry: idx });
        }
        let mac = chain_hmac(key, &entry.prev_hmac, &entry.event)?;
        if mac != entry.hmac {
            return Err(RouterError::CustodyTampered { entry: idx });
        }
        expected_prev = entry.hmac.clone();
        last = Some(entry.hmac);
    }
    Ok(last)
}

fn read_lines(path: &Path) -> Result<Vec<String>, RouterError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RouterError::RepositoryUnavailable(format!("custody read: {e}")))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
