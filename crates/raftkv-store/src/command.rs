use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque payload of one replicated log entry.
///
/// The consensus layer never looks inside; the state machine decodes it
/// as a [`Transaction`] when the entry is applied.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    derive_more::Deref,
    derive_more::From,
)]
pub struct LogEntry(pub Vec<u8>);

impl From<&[u8]> for LogEntry {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    #[serde(alias = "Set")]
    Set,
    #[serde(alias = "Delete")]
    Delete,
}

/// A single mutation of the store.
///
/// `value` and `ttl` are ignored for [`Op::Delete`]. A zero `ttl` on
/// [`Op::Set`] makes the key permanent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(alias = "Op")]
    pub op: Op,
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(default, alias = "Value")]
    pub value: String,
    #[serde(default, alias = "TTL", with = "ttl_nanos")]
    pub ttl: Duration,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            op: Op::Set,
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            key: key.into(),
            value: String::new(),
            ttl: Duration::ZERO,
        }
    }
}

/// Ordered group of commands applied as one atomic unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(alias = "Commands")]
    pub commands: Vec<Command>,
}

/// Accepted shapes of an entry payload. Encoding always produces a
/// transaction; a bare command decodes as a one-command transaction.
#[derive(Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Transaction(Transaction),
    Single(Command),
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(Command::set(key, value, ttl));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::delete(key));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn encode(&self) -> serde_json::Result<LogEntry> {
        serde_json::to_vec(self).map(LogEntry)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        Ok(match serde_json::from_slice(bytes)? {
            WirePayload::Transaction(tx) => tx,
            WirePayload::Single(command) => command.into(),
        })
    }
}

impl From<Command> for Transaction {
    fn from(command: Command) -> Self {
        Self {
            commands: vec![command],
        }
    }
}

/// TTLs travel as signed nanosecond counts. Negative values mean "no expiry".
mod ttl_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
