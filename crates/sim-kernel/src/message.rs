//! Messages
//!
//! A message is a header plus a typed body. Inside one process the body is
//! shared as-is; once a message crosses a node boundary it travels as JSON and
//! is decoded lazily by the handler that asks for its type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sim_types::{Header, Identity, MessageCode, TimePoint};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::error::KernelError;

/// A message type. The code must be unique among the types a model uses.
pub trait MessageBody: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CODE: MessageCode;
}

type Encoder = fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value, serde_json::Error>;

#[derive(Clone)]
enum Payload {
    Local {
        value: Arc<dyn Any + Send + Sync>,
        encode: Encoder,
        name: &'static str,
    },
    Encoded(Arc<serde_json::Value>),
}

fn encode_body<M: MessageBody>(
    value: &(dyn Any + Send + Sync),
) -> Result<serde_json::Value, serde_json::Error> {
    match value.downcast_ref::<M>() {
        Some(body) => serde_json::to_value(body),
        None => Err(serde::ser::Error::custom(format!(
            "payload is not a {}",
            type_name::<M>()
        ))),
    }
}

/// Header plus body, immutable once built.
#[derive(Clone)]
pub struct Message {
    header: Header,
    payload: Payload,
}

impl Message {
    /// Builds a message, rejecting delivery before the send time.
    pub fn new<M: MessageBody>(
        sender: Identity,
        recipient: Identity,
        sent: TimePoint,
        received: TimePoint,
        body: M,
    ) -> Result<Self, KernelError> {
        let header = Header {
            code: M::CODE,
            sender,
            recipient,
            sent,
            received,
        };
        if !header.is_causal() {
            return Err(KernelError::InvalidDeliveryTime {
                code: header.code,
                sender: header.sender,
                sent,
                received,
            });
        }
        Ok(Self {
            header,
            payload: Payload::Local {
                value: Arc::new(body),
                encode: encode_body::<M>,
                name: type_name::<M>(),
            },
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn code(&self) -> MessageCode {
        self.header.code
    }

    pub fn sender(&self) -> &Identity {
        &self.header.sender
    }

    pub fn recipient(&self) -> &Identity {
        &self.header.recipient
    }

    pub fn received(&self) -> TimePoint {
        self.header.received
    }

    /// True once the message has crossed a node boundary.
    pub fn is_encoded(&self) -> bool {
        matches!(self.payload, Payload::Encoded(_))
    }

    /// Runs `f` on the body viewed as `M`.
    pub fn with_body<M: MessageBody, R>(&self, f: impl FnOnce(&M) -> R) -> Result<R, KernelError> {
        if self.header.code != M::CODE {
            return Err(self.wrong_type::<M>());
        }
        match &self.payload {
            Payload::Local { value, .. } => match value.downcast_ref::<M>() {
                Some(body) => Ok(f(body)),
                None => Err(self.wrong_type::<M>()),
            },
            Payload::Encoded(json) => {
                let body = M::deserialize(json.as_ref())?;
                Ok(f(&body))
            }
        }
    }

    /// The body as JSON, encoding it if it is still local.
    pub fn body_json(&self) -> Result<serde_json::Value, KernelError> {
        match &self.payload {
            Payload::Local { value, encode, .. } => Ok(encode(value.as_ref())?),
            Payload::Encoded(json) => Ok(json.as_ref().clone()),
        }
    }

    fn wrong_type<M>(&self) -> KernelError {
        KernelError::PayloadType {
            code: self.header.code,
            expected: type_name::<M>(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.payload {
            Payload::Local { name, .. } => *name,
            Payload::Encoded(_) => "<encoded>",
        };
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("body", &body)
            .finish()
    }
}

#[derive(Serialize)]
struct WireMessageRef<'a> {
    header: &'a Header,
    body: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct WireMessage {
    header: Header,
    body: serde_json::Value,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = self.body_json().map_err(serde::ser::Error::custom)?;
        WireMessageRef {
            header: &self.header,
            body: &body,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        if !wire.header.is_causal() {
            return Err(serde::de::Error::custom(format!(
                "message {} is delivered at {}, before it is sent at {}",
                wire.header.code, wire.header.received, wire.header.sent
            )));
        }
        Ok(Self {
            header: wire.header,
            payload: Payload::Encoded(Arc::new(wire.body)),
        })
    }
}
