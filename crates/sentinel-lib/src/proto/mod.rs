//! Wire protocol for the messaging mesh
//!
//! Messages are declared by hand with `prost` derives so no protoc step is
//! needed at build time. Frames travel length-prefixed over the link.

use crate::error::{Result, SentinelError};
use crate::models::{EntityId, Heartbeat, MetricSample, SampleReport};
use bytes::Bytes;
use prost::Message;

/// Kind tag of an application message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Unspecified = 0,
    Sample = 1,
    Heartbeat = 2,
    Command = 3,
}

impl MessageKind {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            MessageKind::Unspecified => "MESSAGE_KIND_UNSPECIFIED",
            MessageKind::Sample => "MESSAGE_KIND_SAMPLE",
            MessageKind::Heartbeat => "MESSAGE_KIND_HEARTBEAT",
            MessageKind::Command => "MESSAGE_KIND_COMMAND",
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct SampleMessage {
    #[prost(string, tag = "1")]
    pub entity_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(double, tag = "3")]
    pub cpu_pct: f64,
    #[prost(double, tag = "4")]
    pub mem_pct: f64,
    #[prost(uint64, tag = "5")]
    pub disk_used: u64,
    #[prost(uint64, tag = "6")]
    pub net_in: u64,
    #[prost(uint64, tag = "7")]
    pub net_out: u64,
    #[prost(string, tag = "8")]
    pub status: String,
    #[prost(string, tag = "9")]
    pub node: String,
    #[prost(uint32, optional, tag = "10")]
    pub vmid: Option<u32>,
    #[prost(string, tag = "11")]
    pub display_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatMessage {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(bool, tag = "4")]
    pub hypervisor_ok: bool,
    #[prost(string, repeated, tag = "5")]
    pub entity_ids: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommandMessage {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(string, tag = "2")]
    pub argument: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub sender: String,
    #[prost(enumeration = "MessageKind", tag = "2")]
    pub kind: i32,
    #[prost(oneof = "envelope::Body", tags = "3, 4, 5")]
    pub body: Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "3")]
        Sample(super::SampleMessage),
        #[prost(message, tag = "4")]
        Heartbeat(super::HeartbeatMessage),
        #[prost(message, tag = "5")]
        Command(super::CommandMessage),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub identity: String,
    #[prost(string, tag = "2")]
    pub secret: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloAck {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Route {
    #[prost(string, tag = "1")]
    pub destination: String,
    #[prost(message, optional, tag = "2")]
    pub envelope: Option<Envelope>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Deliver {
    #[prost(string, tag = "1")]
    pub from: String,
    #[prost(message, optional, tag = "2")]
    pub envelope: Option<Envelope>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Presence {
    #[prost(string, tag = "1")]
    pub peer: String,
    #[prost(bool, tag = "2")]
    pub online: bool,
}

/// Link-level frame exchanged between a client and the broker
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        HelloAck(super::HelloAck),
        #[prost(message, tag = "3")]
        Route(super::Route),
        #[prost(message, tag = "4")]
        Deliver(super::Deliver),
        #[prost(message, tag = "5")]
        Presence(super::Presence),
    }
}

impl Frame {
    pub fn new(kind: frame::Kind) -> Self {
        Self { kind: Some(kind) }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        Frame::decode(buf).map_err(|e| SentinelError::validation(format!("bad frame: {}", e)))
    }
}

/// Operator or aggregator instruction to a monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command: String,
    pub argument: String,
}

impl Command {
    pub const POLL_NOW: &'static str = "poll_now";

    pub fn new(command: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.into(),
        }
    }
}

/// Decoded application payload of an [`Envelope`]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Sample(SampleReport),
    Heartbeat(Heartbeat),
    Command(Command),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Sample(_) => MessageKind::Sample,
            Payload::Heartbeat(_) => MessageKind::Heartbeat,
            Payload::Command(_) => MessageKind::Command,
        }
    }

    pub fn into_envelope(self, sender: &str) -> Envelope {
        let kind = self.kind() as i32;
        let body = match self {
            Payload::Sample(report) => envelope::Body::Sample(SampleMessage::from(&report)),
            Payload::Heartbeat(hb) => envelope::Body::Heartbeat(HeartbeatMessage::from(&hb)),
            Payload::Command(cmd) => envelope::Body::Command(CommandMessage {
                command: cmd.command,
                argument: cmd.argument,
            }),
        };
        Envelope {
            sender: sender.to_string(),
            kind,
            body: Some(body),
        }
    }
}

impl TryFrom<Envelope> for Payload {
    type Error = SentinelError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let kind = MessageKind::try_from(envelope.kind).map_err(|_| {
            SentinelError::validation(format!("unknown message kind {}", envelope.kind))
        })?;
        let body = envelope
            .body
            .ok_or_else(|| SentinelError::validation("envelope without body"))?;

        let payload = match body {
            envelope::Body::Sample(msg) => Payload::Sample(SampleReport::try_from(msg)?),
            envelope::Body::Heartbeat(msg) => Payload::Heartbeat(Heartbeat::try_from(msg)?),
            envelope::Body::Command(msg) => Payload::Command(Command {
                command: msg.command,
                argument: msg.argument,
            }),
        };

        if payload.kind() != kind {
            return Err(SentinelError::validation(format!(
                "kind {} does not match body {}",
                kind.as_str_name(),
                payload.kind().as_str_name()
            )));
        }
        Ok(payload)
    }
}

fn to_timestamp(seconds: i64) -> prost_types::Timestamp {
    prost_types::Timestamp { seconds, nanos: 0 }
}

fn from_timestamp(ts: Option<prost_types::Timestamp>, field: &str) -> Result<i64> {
    ts.map(|t| t.seconds)
        .ok_or_else(|| SentinelError::validation(format!("missing {}", field)))
}

impl From<&SampleReport> for SampleMessage {
    fn from(report: &SampleReport) -> Self {
        let s = &report.sample;
        Self {
            entity_id: s.entity_id.to_string(),
            timestamp: Some(to_timestamp(s.timestamp)),
            cpu_pct: s.cpu_pct,
            mem_pct: s.mem_pct,
            disk_used: s.disk_used,
            net_in: s.net_in,
            net_out: s.net_out,
            status: s.status.clone(),
            node: report.node.clone(),
            vmid: report.vmid,
            display_name: report.display_name.clone(),
        }
    }
}

impl TryFrom<SampleMessage> for SampleReport {
    type Error = SentinelError;

    fn try_from(msg: SampleMessage) -> Result<Self> {
        let timestamp = from_timestamp(msg.timestamp, "sample timestamp")?;
        let sample = MetricSample {
            entity_id: EntityId::new(msg.entity_id),
            timestamp,
            cpu_pct: msg.cpu_pct,
            mem_pct: msg.mem_pct,
            disk_used: msg.disk_used,
            net_in: msg.net_in,
            net_out: msg.net_out,
            status: msg.status,
        };
        sample.validate()?;
        Ok(SampleReport {
            sample,
            node: msg.node,
            vmid: msg.vmid,
            display_name: msg.display_name,
        })
    }
}

impl From<&Heartbeat> for HeartbeatMessage {
    fn from(hb: &Heartbeat) -> Self {
        Self {
            agent_id: hb.agent_id.clone(),
            node: hb.node.clone(),
            timestamp: Some(to_timestamp(hb.timestamp)),
            hypervisor_ok: hb.hypervisor_ok,
            entity_ids: hb.entity_ids.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl TryFrom<HeartbeatMessage> for Heartbeat {
    type Error = SentinelError;

    fn try_from(msg: HeartbeatMessage) -> Result<Self> {
        if msg.agent_id.is_empty() {
            return Err(SentinelError::validation("heartbeat without agent_id"));
        }
        Ok(Heartbeat {
            timestamp: from_timestamp(msg.timestamp, "heartbeat timestamp")?,
            agent_id: msg.agent_id,
            node: msg.node,
            hypervisor_ok: msg.hypervisor_ok,
            entity_ids: msg.entity_ids.into_iter().map(EntityId::new).collect(),
        })
    }
}
