//! Survey bookkeeping
//!
//! A survey is open from the tick that created it until every client it asked
//! has answered, or until its timeout fires. Closing removes it from the book,
//! so anything arriving later for that timestamp finds nothing and is ignored.

use crate::io::Timestamp;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Registry id of a connected client. Never reused within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One open survey.
#[derive(Debug, Clone)]
pub struct Survey {
    timestamp: i64,
    outstanding: HashSet<ClientId>,
    asked: usize,
    started: Timestamp,
}

impl Survey {
    pub fn new(timestamp: i64, clients: impl IntoIterator<Item = ClientId>, started: Timestamp) -> Self {
        let outstanding: HashSet<ClientId> = clients.into_iter().collect();
        Survey {
            timestamp,
            asked: outstanding.len(),
            outstanding,
            started,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Number of clients the survey was opened with.
    pub fn asked(&self) -> usize {
        self.asked
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, id: ClientId) -> bool {
        self.outstanding.contains(&id)
    }

    pub fn started(&self) -> Timestamp {
        self.started
    }

    pub fn is_done(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// What happened when a client reported completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// No open survey for that timestamp (closed already, or never opened).
    NoSurvey,
    /// The client was not outstanding, e.g. a second `stats_complete`.
    Duplicate,
    /// Recorded. `closed` is set when this was the last outstanding client,
    /// in which case the survey has been removed.
    Recorded { latency: Duration, closed: bool },
}

/// All open surveys keyed by timestamp.
#[derive(Debug, Default)]
pub struct SurveyBook {
    surveys: BTreeMap<i64, Survey>,
}

impl SurveyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a survey. Returns `false`, changing nothing, if one is already
    /// open for `timestamp`.
    pub fn open(&mut self, survey: Survey) -> bool {
        if self.surveys.contains_key(&survey.timestamp) {
            return false;
        }
        self.surveys.insert(survey.timestamp, survey);
        true
    }

    pub fn get(&self, timestamp: i64) -> Option<&Survey> {
        self.surveys.get(&timestamp)
    }

    pub fn in_flight(&self) -> usize {
        self.surveys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surveys.is_empty()
    }

    /// Mark `id` as done for `timestamp`.
    pub fn record_completion(&mut self, id: ClientId, timestamp: i64, now: Timestamp) -> Completion {
        let Some(survey) = self.surveys.get_mut(&timestamp) else {
            return Completion::NoSurvey;
        };
        if !survey.outstanding.remove(&id) {
            return Completion::Duplicate;
        }

        let latency = now.saturating_since(survey.started);
        let closed = survey.is_done();
        if closed {
            self.surveys.remove(&timestamp);
        }
        Completion::Recorded { latency, closed }
    }

    /// Close a survey regardless of who is still outstanding. Returns the
    /// closed survey, or `None` if it had already closed.
    pub fn close(&mut self, timestamp: i64) -> Option<Survey> {
        self.surveys.remove(&timestamp)
    }

    /// Drop `id` from every open survey. Returns the timestamps of surveys
    /// this closed, oldest first.
    pub fn remove_client(&mut self, id: ClientId) -> Vec<i64> {
        let mut closed = Vec::new();
        for (ts, survey) in self.surveys.iter_mut() {
            if survey.outstanding.remove(&id) && survey.is_done() {
                closed.push(*ts);
            }
        }
        for ts in &closed {
            self.surveys.remove(ts);
        }
        closed
    }

    /// Timestamps of open surveys, oldest first.
    pub fn open_timestamps(&self) -> Vec<i64> {
        self.surveys.keys().copied().collect()
    }
}
