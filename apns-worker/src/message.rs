use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::result::{Error, Result};

/// A single push notification to be sent to one or more devices.
///
/// Construction validates and serializes eagerly: tokens are hex-decoded,
/// priority is range-checked, and the payload is serialized to compact JSON.
/// All of that happens once here, so a rejected [`Message`] never reaches the
/// queue and a queued one never needs to re-serialize its payload per token.
#[derive(Debug)]
pub struct Message {
    pub(crate) encoded_tokens: Vec<[u8; 32]>,
    pub(crate) encoded_payload: Vec<u8>,
    pub(crate) encoded_expiration: Option<u32>,
    pub(crate) priority: Option<u8>,
}

impl Message {
    /// Creates a new message.
    ///
    /// `tokens` are hex-encoded device tokens. `payload` is serialized to
    /// compact UTF-8 JSON; it should normally include the `aps` key.
    /// `expiration` is an absolute instant after which APNs should stop
    /// trying to deliver the notification. `priority` must be in `[0, 255]`
    /// when given; APNs itself only recognizes `5` and `10`.
    pub fn new<S, P>(
        tokens: impl IntoIterator<Item = S>,
        payload: &P,
        expiration: Option<OffsetDateTime>,
        priority: Option<i32>,
    ) -> Result<Self>
    where
        S: AsRef<str>,
        P: Serialize,
    {
        let encoded_tokens = tokens
            .into_iter()
            .map(|token| decode_token(token.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        if encoded_tokens.is_empty() {
            return Err(Error::NoTokens);
        }

        let priority = priority
            .map(|priority| u8::try_from(priority).map_err(|_| Error::InvalidPriority))
            .transpose()?;

        let encoded_payload = serde_json::to_vec(payload)?;
        let encoded_expiration = expiration.map(|when| when.unix_timestamp() as u32);

        Ok(Self {
            encoded_tokens,
            encoded_payload,
            encoded_expiration,
            priority,
        })
    }

    /// Number of device tokens in this message.
    pub fn len(&self) -> usize {
        self.encoded_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_tokens.is_empty()
    }
}

fn decode_token(token: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(token)?;
    let len = bytes.len();

    bytes
        .try_into()
        .map_err(|_: Vec<u8>| Error::TokenLength(len))
}

/// A single `(message, token, ident)` triple generated from a [`Message`].
///
/// This is the unit the wire codec and the notification queue operate on.
/// `ident` is assigned by the queue from its shared identifier generator when
/// the owning message is appended; it is `Option` because the wire codec
/// itself allows a notification with no identifier (the item is simply
/// omitted from the frame), even though the queue never constructs one that
/// way.
#[derive(Debug, Clone)]
pub struct Notification {
    pub(crate) message: Arc<Message>,
    pub(crate) encoded_token: [u8; 32],
    pub(crate) ident: Option<u32>,
}

impl Notification {
    /// This notification's hex-encoded token.
    pub fn token(&self) -> String {
        hex::encode(self.encoded_token)
    }

    pub fn ident(&self) -> Option<u32> {
        self.ident
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }
}

impl PartialEq for Notification {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident && self.encoded_token == other.encoded_token
    }
}

/// APNs status codes reported on a per-notification rejection.
///
/// Status `10` ("shutdown") is handled separately by the codec and the
/// delivery engine; it is never wrapped in a [`Reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ProcessingError,
    MissingToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    Unknown(u8),
}

impl Reason {
    pub fn from_status(status: u8) -> Self {
        match status {
            1 => Self::ProcessingError,
            2 => Self::MissingToken,
            3 => Self::MissingTopic,
            4 => Self::MissingPayload,
            5 => Self::InvalidTokenSize,
            6 => Self::InvalidTopicSize,
            7 => Self::InvalidPayloadSize,
            8 => Self::InvalidToken,
            other => Self::Unknown(other),
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            Self::ProcessingError => 1,
            Self::MissingToken => 2,
            Self::MissingTopic => 3,
            Self::MissingPayload => 4,
            Self::InvalidTokenSize => 5,
            Self::InvalidTopicSize => 6,
            Self::InvalidPayloadSize => 7,
            Self::InvalidToken => 8,
            Self::Unknown(status) => *status,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ProcessingError => "Processing error",
            Self::MissingToken => "Missing device token",
            Self::MissingTopic => "Missing topic",
            Self::MissingPayload => "Missing payload",
            Self::InvalidTokenSize => "Invalid token size",
            Self::InvalidTopicSize => "Invalid topic size",
            Self::InvalidPayloadSize => "Invalid payload size",
            Self::InvalidToken => "Invalid token",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "APNs error {}: {}", self.status(), self.description())
    }
}

/// A delivery error returned by APNs for a single device token.
///
/// These are only generated for unrecoverable, per-notification rejections;
/// transport faults and connection resets never produce one.
#[derive(Debug, Clone)]
pub struct DeliveryError {
    pub reason: Reason,
    pub message: Arc<Message>,
    pub token: String,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (token {})", self.reason, self.token)
    }
}

/// A single record from the APNs feedback service: a token that can no
/// longer receive notifications, and when APNs stopped being able to deliver
/// to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub token: String,
    pub when: time::OffsetDateTime,
}
