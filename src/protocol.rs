//! Policy delegation dialogue: `name=value` lines ended by an empty line,
//! answered with `action=...` followed by an empty line.

use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One finished attribute block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    attributes: HashMap<String, String>,
}

impl PolicyRequest {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn sender(&self) -> &str {
        self.get("sender").unwrap_or("")
    }

    pub fn recipient(&self) -> &str {
        self.get("recipient").unwrap_or("")
    }

    pub fn sasl_username(&self) -> Option<&str> {
        self.get("sasl_username")
    }

    pub fn subject(&self) -> &str {
        self.get("subject").unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PolicyRequest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        PolicyRequest {
            attributes: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Accumulates lines until an empty one closes the block.
#[derive(Debug, Default)]
pub struct AttributeParser {
    current: HashMap<String, String>,
}

impl AttributeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line, with or without its trailing line feed. Returns the
    /// finished request when the line is empty.
    pub fn push_line(&mut self, line: &[u8]) -> Option<PolicyRequest> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        if line.is_empty() {
            return Some(PolicyRequest {
                attributes: std::mem::take(&mut self.current),
            });
        }

        let line = String::from_utf8_lossy(line);
        if let Some((name, value)) = line.split_once('=') {
            self.current.insert(name.to_string(), value.to_string());
        }
        None
    }

    pub fn has_partial(&self) -> bool {
        !self.current.is_empty()
    }

    /// Whatever was accumulated without a closing empty line.
    pub fn finish(self) -> PolicyRequest {
        PolicyRequest {
            attributes: self.current,
        }
    }
}

/// Outcome of reading one block off a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Request(PolicyRequest),
    /// Stream ended mid-block; carries the attributes seen so far.
    Truncated(PolicyRequest),
    Closed,
}

/// Read lines until a block is complete or the stream ends.
pub async fn read_request<R>(reader: &mut R, parser: &mut AttributeParser) -> std::io::Result<ReadOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            let partial = std::mem::take(parser).finish();
            return Ok(if partial.is_empty() {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Truncated(partial)
            });
        }
        if let Some(request) = parser.push_line(&line) {
            return Ok(ReadOutcome::Request(request));
        }
    }
}

/// The verdict handed back to the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    Dunno,
    DeferHourly { count: i64, limit: i64 },
    DeferDaily { count: i64, limit: i64 },
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::Dunno => write!(f, "DUNNO"),
            PolicyAction::DeferHourly { count, limit } => write!(
                f,
                "DEFER_IF_PERMIT Saatlik mail limiti aşıldı ({count}/{limit}). Mail kuyruğa alındı."
            ),
            PolicyAction::DeferDaily { count, limit } => write!(
                f,
                "DEFER_IF_PERMIT Günlük mail limiti aşıldı ({count}/{limit}). Mail kuyruğa alındı."
            ),
        }
    }
}

impl PolicyAction {
    /// Full response frame: `action=TOKEN\n\n`.
    pub fn to_response(&self) -> String {
        format!("action={self}\n\n")
    }
}
