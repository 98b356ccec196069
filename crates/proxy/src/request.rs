//! The request as handed over by the client-facing side: the parsed
//! message plus the transport context needed to pick an upstream
//! protocol and size buffers.

use ferrous_forward_domain::Proto;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

const MIN_UDP_SIZE: u16 = 512;
const MAX_MSG_SIZE: u16 = 65_535;

pub struct UpstreamRequest {
    message: Message,
    client_proto: Proto,
    qtype: RecordType,
}

impl UpstreamRequest {
    /// The qtype is captured up front: the forwarder rewrites the
    /// message in place and must not lose what was originally asked.
    pub fn new(message: Message, client_proto: Proto) -> Self {
        let qtype = message
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::ZERO);
        Self {
            message,
            client_proto,
            qtype,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// The client's native transport.
    pub fn proto(&self) -> Proto {
        self.client_proto
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }

    pub fn is_zone_transfer(&self) -> bool {
        matches!(self.qtype, RecordType::AXFR | RecordType::IXFR)
    }

    /// The response size the client can take: the full message space
    /// on stream transports, the advertised EDNS payload (or the
    /// 512-byte minimum) on UDP.
    pub fn size(&self) -> u16 {
        if self.client_proto.is_stream() {
            return MAX_MSG_SIZE;
        }
        self.message
            .extensions()
            .as_ref()
            .map(|edns| edns.max_payload())
            .unwrap_or(MIN_UDP_SIZE)
    }
}
