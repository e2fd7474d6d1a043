//! The vote record carried by both wire formats.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single vote notification.
///
/// Built by the application when sending, or by a codec when receiving.
/// Fields are read-only once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "serviceName")]
    service_name: String,
    username: String,
    address: String,
    #[serde(rename = "timeStamp")]
    timestamp: String,
}

impl Vote {
    /// Create a vote stamped with the current time in epoch milliseconds.
    pub fn new(
        service_name: impl Into<String>,
        username: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self::with_timestamp(service_name, username, address, millis.to_string())
    }

    /// Create a vote with an explicit timestamp.
    ///
    /// v1 carries the timestamp as free text. v2 needs decimal epoch
    /// milliseconds; anything else goes over the wire as `0`.
    pub fn with_timestamp(
        service_name: impl Into<String>,
        username: impl Into<String>,
        address: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            username: username.into(),
            address: address.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The voter's reported address. Opaque text, not checked to be an IP.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// The timestamp as epoch milliseconds, if it is one.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp.parse().ok()
    }

    /// The four fields in wire order.
    pub(crate) fn fields(&self) -> [&str; 4] {
        [
            &self.service_name,
            &self.username,
            &self.address,
            &self.timestamp,
        ]
    }

    /// True when every field can be carried by the newline-delimited v1 format.
    pub fn is_v1_safe(&self) -> bool {
        self.fields().iter().all(|f| !f.contains('\n'))
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} voted on {} from {} at {}",
            self.username, self.service_name, self.address, self.timestamp
        )
    }
}

/// Wire format a vote arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Legacy RSA format, no acknowledgement
    V1,
    /// Challenge/HMAC format with a JSON response
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
            ProtocolVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fills_millisecond_timestamp() {
        let vote = Vote::new("golang", "golang", "127.0.0.1");
        let millis = vote.timestamp_millis().unwrap();
        // after 2020-01-01 and clearly not seconds or nanoseconds
        assert!(millis > 1_577_836_800_000);
        assert!(millis < 10_000_000_000_000);
    }

    #[test]
    fn test_newline_makes_vote_v1_unsafe() {
        assert!(Vote::new("svc", "user", "1.2.3.4").is_v1_safe());
        assert!(!Vote::new("svc", "us\ner", "1.2.3.4").is_v1_safe());
    }

    #[test]
    fn test_json_field_names() {
        let vote = Vote::with_timestamp("svc", "user", "1.2.3.4", "42");
        let json = serde_json::to_value(&vote).unwrap();
        assert_eq!(json["serviceName"], "svc");
        assert_eq!(json["timeStamp"], "42");
    }

    #[test]
    fn test_free_text_timestamp_has_no_millis() {
        let vote = Vote::with_timestamp("svc", "user", "1.2.3.4", "yesterday");
        assert_eq!(vote.timestamp_millis(), None);
    }
}
