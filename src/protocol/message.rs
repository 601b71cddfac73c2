//! Message kinds exchanged between the server and its clients.
//!
//! Bodies are MessagePack maps keyed by the field names existing clients
//! already send (`Timestamp`, `Values`, `Counts`, ...), hence the PascalCase
//! renames.

use super::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// One-byte method code in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Ping = 0x28,
    Pong = 0x29,
    ReportAll = 0x30,
    RegisterProcess = 0x41,
    StatsPartial = 0x42,
    StatsComplete = 0x43,
}

impl Method {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "pair:ping",
            Method::Pong => "pair:pong",
            Method::ReportAll => "report_all",
            Method::RegisterProcess => "register_process",
            Method::StatsPartial => "stats_partial",
            Method::StatsComplete => "stats_complete",
        }
    }
}

impl TryFrom<u8> for Method {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x28 => Ok(Method::Ping),
            0x29 => Ok(Method::Pong),
            0x30 => Ok(Method::ReportAll),
            0x41 => Ok(Method::RegisterProcess),
            0x42 => Ok(Method::StatsPartial),
            0x43 => Ok(Method::StatsComplete),
            other => Err(ProtocolError::UnknownMethod(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatValue {
    pub name: String,
    pub value: f64,
}

impl StatValue {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        StatValue {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatCount {
    pub name: String,
    pub count: f64,
}

impl StatCount {
    pub fn new(name: impl Into<String>, count: f64) -> Self {
        StatCount {
            name: name.into(),
            count,
        }
    }
}

/// Pre-aggregated distribution as `[N, Min, Max, Sum, SumSq]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatDist {
    pub name: String,
    pub dist: [f64; 5],
}

impl StatDist {
    pub fn new(name: impl Into<String>, dist: [f64; 5]) -> Self {
        StatDist {
            name: name.into(),
            dist,
        }
    }
}

/// Go clients send empty slices and maps as `nil`.
fn nil_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Metric fragments a client reports for one timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    pub timestamp: i64,
    #[serde(default, deserialize_with = "nil_as_default")]
    pub values: Vec<StatValue>,
    #[serde(default, deserialize_with = "nil_as_default")]
    pub counts: Vec<StatCount>,
    #[serde(default, deserialize_with = "nil_as_default")]
    pub dists: Vec<StatDist>,
}

impl Stats {
    pub fn new(timestamp: i64) -> Self {
        Stats {
            timestamp,
            ..Default::default()
        }
    }

    /// A single counter delta.
    pub fn count(timestamp: i64, name: &str, count: f64) -> Self {
        Stats {
            timestamp,
            counts: vec![StatCount::new(name, count)],
            ..Default::default()
        }
    }

    /// A single sampled value.
    pub fn value(timestamp: i64, name: &str, value: f64) -> Self {
        Stats {
            timestamp,
            values: vec![StatValue::new(name, value)],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.counts.is_empty() && self.dists.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportAll {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterProcess {
    #[serde(default, deserialize_with = "nil_as_default")]
    pub tags: BTreeMap<String, String>,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    Pong,
    /// Server -> client: report everything for this timestamp.
    ReportAll(ReportAll),
    /// Client -> server: identify the process.
    RegisterProcess(RegisterProcess),
    /// Client -> server: some of the data for a timestamp, more follows.
    StatsPartial(Stats),
    /// Client -> server: the last of the data for a timestamp.
    StatsComplete(Stats),
}

impl Message {
    pub fn report_all(timestamp: i64) -> Self {
        Message::ReportAll(ReportAll { timestamp })
    }

    pub fn method(&self) -> Method {
        match self {
            Message::Ping => Method::Ping,
            Message::Pong => Method::Pong,
            Message::ReportAll(_) => Method::ReportAll,
            Message::RegisterProcess(_) => Method::RegisterProcess,
            Message::StatsPartial(_) => Method::StatsPartial,
            Message::StatsComplete(_) => Method::StatsComplete,
        }
    }

    /// Encode the body (without the frame header).
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Message::Ping | Message::Pong => Vec::new(),
            Message::ReportAll(r) => rmp_serde::to_vec_named(r)?,
            Message::RegisterProcess(r) => rmp_serde::to_vec_named(r)?,
            Message::StatsPartial(s) | Message::StatsComplete(s) => rmp_serde::to_vec_named(s)?,
        };
        Ok(body)
    }

    /// Decode a body for the given method.
    pub fn decode_body(method: Method, body: &[u8]) -> Result<Self, ProtocolError> {
        let msg = match method {
            Method::Ping => Message::Ping,
            Method::Pong => Message::Pong,
            Method::ReportAll => Message::ReportAll(rmp_serde::from_slice(body)?),
            Method::RegisterProcess => Message::RegisterProcess(rmp_serde::from_slice(body)?),
            Method::StatsPartial => Message::StatsPartial(rmp_serde::from_slice(body)?),
            Method::StatsComplete => Message::StatsComplete(rmp_serde::from_slice(body)?),
        };
        Ok(msg)
    }
}
