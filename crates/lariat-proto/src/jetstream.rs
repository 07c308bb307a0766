//! JetStream wire encodings: pull requests, ack verbs, and the metadata
//! embedded in `$JS.ACK` reply subjects.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// Default API subject prefix.
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Reply subjects starting with this prefix identify stream messages.
pub const ACK_REPLY_PREFIX: &str = "$JS.ACK.";

/// The subject a pull request is published to.
pub fn msg_next_subject(prefix: &str, stream: &str, consumer: &str) -> String {
    format!("{prefix}.CONSUMER.MSG.NEXT.{stream}.{consumer}")
}

// ---------------------------------------------------------------------------
// PullRequest
// ---------------------------------------------------------------------------

/// The JSON body of a pull request.
///
/// `expires` and `idle_heartbeat` travel as nanoseconds.  Optional fields are
/// omitted entirely when unset so re-encoding a decoded request is stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub batch: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_bytes: usize,
    #[serde(default, with = "nanos_opt", skip_serializing_if = "Option::is_none")]
    pub expires: Option<Duration>,
    #[serde(default, with = "nanos_opt", skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<Duration>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_wait: bool,
}

impl PullRequest {
    pub fn batch(batch: usize) -> Self {
        PullRequest {
            batch,
            ..PullRequest::default()
        }
    }
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

mod nanos_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            // Durations beyond u64 nanoseconds (~584 years) do not occur on
            // this protocol.
            Some(d) => serializer.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos: Option<u64> = Option::deserialize(deserializer)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

// ---------------------------------------------------------------------------
// AckKind
// ---------------------------------------------------------------------------

/// Acknowledgement verbs published to a stream message's reply subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    /// `+ACK`: handled, do not redeliver.
    Ack,
    /// `-NAK`: redeliver per consumer policy.
    Nak,
    /// `-NAK {"delay": ns}`: redeliver after a delay.
    NakWithDelay(Duration),
    /// `+WPI`: still working, reset the ack-wait timer.
    InProgress,
    /// `+TERM`: stop redelivery without counting as success.
    Term,
    /// `+ACKNXT <json>`: pull mode only, ack and request the next batch in
    /// one publish.
    AckNext(PullRequest),
}

impl AckKind {
    /// Terminal verbs latch the message; `+WPI` does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckKind::InProgress)
    }

    pub fn payload(&self) -> Result<Bytes, serde_json::Error> {
        Ok(match self {
            AckKind::Ack => Bytes::from_static(b"+ACK"),
            AckKind::Nak => Bytes::from_static(b"-NAK"),
            AckKind::NakWithDelay(delay) => {
                let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
                Bytes::from(format!("-NAK {{\"delay\": {nanos}}}"))
            }
            AckKind::InProgress => Bytes::from_static(b"+WPI"),
            AckKind::Term => Bytes::from_static(b"+TERM"),
            AckKind::AckNext(request) => {
                let mut buf = BytesMut::from(&b"+ACKNXT "[..]);
                buf.put_slice(&serde_json::to_vec(request)?);
                buf.freeze()
            }
        })
    }

    /// Parse an ack payload as received by a server.
    pub fn parse(payload: &[u8]) -> Option<AckKind> {
        if let Some(rest) = payload.strip_prefix(b"+ACKNXT") {
            let request: PullRequest = serde_json::from_slice(rest).ok()?;
            return Some(AckKind::AckNext(request));
        }
        if let Some(rest) = payload.strip_prefix(b"-NAK") {
            if rest.is_empty() {
                return Some(AckKind::Nak);
            }
            #[derive(Deserialize)]
            struct NakBody {
                delay: u64,
            }
            let body: NakBody = serde_json::from_slice(rest).ok()?;
            return Some(AckKind::NakWithDelay(Duration::from_nanos(body.delay)));
        }
        match payload {
            b"+ACK" | b"" => Some(AckKind::Ack),
            b"+WPI" => Some(AckKind::InProgress),
            b"+TERM" => Some(AckKind::Term),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AckMetadata
// ---------------------------------------------------------------------------

/// Metadata encoded in a `$JS.ACK` reply subject.
///
/// Two reply forms exist: the 9-token v1 form and the 12-token v2 form that
/// prepends a domain and account hash (and appends a random token).
///
/// ```text
/// $JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>
/// $JS.ACK.<domain>.<acct>.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>.<rand>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMetadata {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered (1 on first delivery).
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// Server timestamp, nanoseconds since the epoch.
    pub timestamp_nanos: u64,
    /// Messages remaining for this consumer after this one.
    pub pending: u64,
}

impl AckMetadata {
    pub fn parse(reply: &str) -> Result<AckMetadata, DecodeError> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.len() < 2 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return Err(DecodeError::AckReply("missing $JS.ACK prefix"));
        }
        let (offset, domain) = match tokens.len() {
            9 => (2, None),
            12 => {
                let domain = match tokens[2] {
                    "_" => None,
                    d => Some(d.to_owned()),
                };
                (4, domain)
            }
            _ => return Err(DecodeError::AckReply("unexpected token count")),
        };

        let number = |index: usize| -> Result<u64, DecodeError> {
            tokens[index]
                .parse()
                .map_err(|_| DecodeError::AckReply("non-numeric metadata token"))
        };

        Ok(AckMetadata {
            domain,
            stream: tokens[offset].to_owned(),
            consumer: tokens[offset + 1].to_owned(),
            delivered: number(offset + 2)?,
            stream_sequence: number(offset + 3)?,
            consumer_sequence: number(offset + 4)?,
            timestamp_nanos: number(offset + 5)?,
            pending: number(offset + 6)?,
        })
    }

    /// Render the v1 reply form (used by mock servers).
    pub fn encode_reply(&self) -> String {
        format!(
            "$JS.ACK.{}.{}.{}.{}.{}.{}.{}",
            self.stream,
            self.consumer,
            self.delivered,
            self.stream_sequence,
            self.consumer_sequence,
            self.timestamp_nanos,
            self.pending
        )
    }
}
