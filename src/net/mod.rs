//! Transport plane: wire codec, streams, link registry, transport manager

pub mod conn;
pub mod link;
pub mod stream;
pub mod transport;
pub mod wire;

pub use conn::{ConnId, ConnStat, ConnState, LinkMetricsSnapshot, LinkPriority, SENDMSG_QUEUE_LEN};
pub use stream::StreamKind;
pub use transport::{HttpCallbacks, MetricsReport, MsgHandler, TransportManager};
pub use wire::{
    CodecError, KmsgDecoder, WireProtocol, BUS_MAGIC, MAX_KMSG_BODY_LEN, MAX_KMSG_FROM_LEN,
    MAX_KMSG_NAME_LEN, MAX_KMSG_SIGNATURE_LEN, MAX_KMSG_TO_LEN,
};
