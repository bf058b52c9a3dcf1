//! Bus messages

use crate::aid::Aid;
use serde::{Deserialize, Serialize};

/// Dispatch path of a message inside the bus.
///
/// Only [`MsgType::Kmsg`] ever crosses the wire; every other kind is an
/// in-process notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Kmsg,
    Udp,
    Http,
    Async,
    Local,
    Exit,
    Terminate,
}

/// A named message between two actors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBase {
    pub from: Aid,
    pub to: Aid,
    pub name: String,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
    pub kind: MsgType,
}

impl MessageBase {
    pub fn new(
        from: impl Into<Aid>,
        to: impl Into<Aid>,
        name: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            name: name.into(),
            body: body.into(),
            signature: b"0".to_vec(),
            kind: MsgType::Kmsg,
        }
    }

    pub fn with_kind(mut self, kind: MsgType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Link-failure notification delivered to a linker subscriber.
    pub fn exit(from: Aid, to: Aid) -> Self {
        Self {
            from,
            to,
            name: String::new(),
            body: Vec::new(),
            signature: b"0".to_vec(),
            kind: MsgType::Exit,
        }
    }
}
