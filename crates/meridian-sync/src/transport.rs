//! Boundary to the byte transport.

use meridian_world::SessionId;

use crate::error::RecordError;
use crate::record::Record;

/// Receives encoded records, in order, per session.
pub trait Transport {
    fn send(&mut self, session: SessionId, payload: Vec<u8>);
}

/// Transport that keeps every payload, for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Vec<(SessionId, Vec<u8>)>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded records sent to `session`, oldest first.
    pub fn records_for(&self, session: SessionId) -> Result<Vec<Record>, RecordError> {
        self.sent
            .iter()
            .filter(|(s, _)| *s == session)
            .map(|(_, payload)| Record::decode(payload))
            .collect()
    }

    /// Total bytes sent to all sessions.
    pub fn bytes_sent(&self) -> usize {
        self.sent.iter().map(|(_, p)| p.len()).sum()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, session: SessionId, payload: Vec<u8>) {
        self.sent.push((session, payload));
    }
}
