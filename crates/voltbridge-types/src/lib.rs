use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one connected viewer socket.
pub type ViewerId = Uuid;

/// Latest measurement for every channel, ordered by channel number.
pub type ChannelMap = BTreeMap<ChannelId, Measurement>;

/// Current reported when the producer omits it (bulk snapshots never carry one).
pub const CURRENT_NOT_REPORTED: f64 = 0.0;

/// Number of a monitored battery cell/slot.
///
/// Rendered as a zero-padded two-digit string (`"03"`) on the viewer wire
/// format, which is also how it appears as a JSON object key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(ChannelId)
            .map_err(|e| BridgeError::Decode(format!("invalid channel id {s:?}: {e}")))
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Operational state of a channel as reported by the producer.
///
/// The producer's vocabulary is closed and case-sensitive; anything outside
/// it is carried through verbatim as [`ChannelStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChannelStatus {
    Run,
    Finish,
    Standby,
    Alarm,
    OffLine,
    Rev,
    /// Placeholder state assigned at start-up before any producer data.
    Normal,
    /// A bulk entry arrived without a `Status` field.
    #[default]
    Unknown,
    Other(String),
}

impl ChannelStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelStatus::Run => "Run",
            ChannelStatus::Finish => "Finish",
            ChannelStatus::Standby => "Standby",
            ChannelStatus::Alarm => "Alarm",
            ChannelStatus::OffLine => "Off_line",
            ChannelStatus::Rev => "REV",
            ChannelStatus::Normal => "normal",
            ChannelStatus::Unknown => "unknown",
            ChannelStatus::Other(s) => s,
        }
    }
}

impl From<String> for ChannelStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Run" => ChannelStatus::Run,
            "Finish" => ChannelStatus::Finish,
            "Standby" => ChannelStatus::Standby,
            "Alarm" => ChannelStatus::Alarm,
            "Off_line" => ChannelStatus::OffLine,
            "REV" => ChannelStatus::Rev,
            "normal" => ChannelStatus::Normal,
            "unknown" => ChannelStatus::Unknown,
            _ => ChannelStatus::Other(s),
        }
    }
}

impl From<ChannelStatus> for String {
    fn from(status: ChannelStatus) -> Self {
        match status {
            ChannelStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known state of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Volts.
    pub voltage: f64,
    /// Amps; [`CURRENT_NOT_REPORTED`] when the producer did not send one.
    pub current: f64,
    pub status: ChannelStatus,
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Demo value assigned to `id` before any producer data arrives.
    pub fn placeholder(id: ChannelId, now: DateTime<Utc>) -> Self {
        Self {
            voltage: 3.789 + f64::from(id.0 % 5) * 0.1,
            current: 0.5 + f64::from(id.0 % 3) * 0.2,
            status: ChannelStatus::Normal,
            timestamp: now,
        }
    }
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Producer protocol
// ---------------------------------------------------------------------------

/// Highest/lowest cell reading inside a bulk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelExtreme {
    #[serde(rename = "Ch")]
    pub ch: u16,
    #[serde(rename = "V")]
    pub voltage: f64,
}

/// One `Ch_INFO` entry of a bulk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(rename = "Ch")]
    pub ch: u16,
    #[serde(rename = "V", default)]
    pub voltage: f64,
    #[serde(rename = "Status", default)]
    pub status: ChannelStatus,
}

impl ChannelInfo {
    /// Read one `Ch_INFO` entry on its own terms.
    ///
    /// `None` when `Ch` is missing or not a channel number. A non-numeric
    /// `V` reads as `0.0` and a non-string `Status` as
    /// [`ChannelStatus::Unknown`].
    pub fn from_entry(entry: &Value) -> Option<Self> {
        let ch = entry.get("Ch").and_then(Value::as_f64)?;
        if !(0.0..=f64::from(u16::MAX)).contains(&ch) {
            return None;
        }
        Some(Self {
            ch: ch as u16,
            voltage: entry.get("V").and_then(Value::as_f64).unwrap_or(0.0),
            status: entry
                .get("Status")
                .and_then(Value::as_str)
                .map_or(ChannelStatus::Unknown, |s| ChannelStatus::from(s.to_string())),
        })
    }
}

/// Producer report covering every channel's basic state.
///
/// Decoding is per entry: a malformed summary field falls back to its
/// default and an unusable `Ch_INFO` entry is dropped without touching the
/// rest of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSnapshot {
    #[serde(rename = "V_totle", default, deserialize_with = "lenient")]
    pub total_voltage: f64,
    #[serde(
        rename = "V_max",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub max: Option<ChannelExtreme>,
    #[serde(
        rename = "V_min",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub min: Option<ChannelExtreme>,
    #[serde(rename = "Finish_ch", default, deserialize_with = "lenient")]
    pub finished_channels: u32,
    #[serde(rename = "Ch_INFO", deserialize_with = "channel_entries")]
    pub channels: Vec<ChannelInfo>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}

fn channel_entries<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ChannelInfo>, D::Error> {
    let raw = Vec::<Value>::deserialize(deserializer)?;
    Ok(raw.iter().filter_map(ChannelInfo::from_entry).collect())
}

/// Producer report with one channel's full measurement set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDetail {
    pub ch: u16,
    #[serde(rename = "V", default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(rename = "Ah", default, skip_serializing_if = "Option::is_none")]
    pub amp_hours: Option<f64>,
    /// Elapsed run time as `HH:MM:SS`.
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

/// A classified producer payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerMessage {
    Bulk(BulkSnapshot),
    Detail(ChannelDetail),
    /// The producer rejected a command (`{"error": "..."}`).
    Fault(String),
}

impl ProducerMessage {
    /// Classify a frame payload by shape.
    ///
    /// A list-valued `Ch_INFO` marks a bulk snapshot; otherwise a `ch` key
    /// marks a per-channel detail; otherwise a string `error` marks a fault.
    /// Everything else, including invalid JSON, is a [`BridgeError::Decode`].
    pub fn parse(payload: &[u8]) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::Decode(format!("invalid JSON: {e}")))?;

        if value.get("Ch_INFO").is_some_and(Value::is_array) {
            return serde_json::from_value(value)
                .map(ProducerMessage::Bulk)
                .map_err(|e| BridgeError::Decode(format!("malformed bulk snapshot: {e}")));
        }

        if value.get("ch").is_some() {
            return serde_json::from_value(value)
                .map(ProducerMessage::Detail)
                .map_err(|e| BridgeError::Decode(format!("malformed channel detail: {e}")));
        }

        if let Some(reason) = value.get("error").and_then(Value::as_str) {
            return Ok(ProducerMessage::Fault(reason.to_string()));
        }

        Err(BridgeError::Decode("unrecognised producer payload".to_string()))
    }
}

/// Requests understood by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCommand {
    /// `ChStatus_all`
    StatusAll,
    /// `ChStatus_<n>`
    ChannelStatus(u16),
}

impl ProducerCommand {
    pub const STATUS_ALL: &'static str = "ChStatus_all";
    const CHANNEL_PREFIX: &'static str = "ChStatus_";

    /// Parse a command string as sent on the wire. Channel numbers may be
    /// bare or zero-padded.
    pub fn parse(text: &str) -> Option<Self> {
        if text == Self::STATUS_ALL {
            return Some(ProducerCommand::StatusAll);
        }
        let digits = text.strip_prefix(Self::CHANNEL_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(ProducerCommand::ChannelStatus)
    }
}

impl fmt::Display for ProducerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerCommand::StatusAll => f.write_str(Self::STATUS_ALL),
            ProducerCommand::ChannelStatus(n) => write!(f, "{}{:02}", Self::CHANNEL_PREFIX, n),
        }
    }
}

// ---------------------------------------------------------------------------
// Viewer protocol
// ---------------------------------------------------------------------------

/// Server → viewer envelope, discriminated by its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerMessage {
    /// Full state of every channel.
    ChannelUpdate { channels: ChannelMap },
    /// The viewer's command was handed to the producer.
    CommandAck { command: String },
}

/// Viewer → server message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ViewerRequest {
    /// The command to forward, if one was given and is non-empty.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref().filter(|c| !c.is_empty())
    }
}

/// Error type shared by every bridge component.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed length prefix or truncated frame. Always connection-fatal.
    #[error("Framing Error: {0}")]
    Framing(String),

    /// Well-formed frame or socket message with an unusable body.
    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Producer Not Connected")]
    NotConnected,

    /// Read/write failure on an established socket.
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
