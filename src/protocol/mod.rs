//! Event-ID namespace and the administrative protocol.
//!
//! Every payload starts with a 32-bit event ID. The top byte is an owner
//! tag; owner `0x01` is reserved for the control events the manager
//! interprets itself. Everything else is opaque application traffic.
//!
//! Administrative payloads use native byte order throughout:
//! - integers: `u32`
//! - strings: `u32 byte_len | UTF-8 bytes`
//! - event-ID lists: `u32 count | count x u32`

use bytes::{Buf, BufMut, BytesMut};

use crate::buffer::Buffer;

/// 32-bit event identifier.
pub type EventId = u32;

/// Owner tag of the administrative range.
pub const ADMIN_OWNER: u8 = 0x01;

pub const REGISTER_CC_EVENTS: EventId = 0x0100_0001;
pub const DEREGISTER_CC_EVENTS: EventId = 0x0100_0002;
pub const REGISTER_CM_EVENTS: EventId = 0x0100_0003;
pub const DEREGISTER_CM_EVENTS: EventId = 0x0100_0004;
pub const HELO: EventId = 0x0100_0005;
pub const INIT_CM_EVENTS: EventId = 0x0100_0006;
pub const PING: EventId = 0x0100_0007;
pub const PONG: EventId = 0x0100_0008;
pub const WATCHDOG_EXPIRED: EventId = 0x0100_0009;
pub const DEBUG_DISABLE_RX: EventId = 0x0100_000A;
pub const DEBUG_DISABLE_TX: EventId = 0x0100_000B;

/// Owner tag (top byte) of an event ID.
pub const fn owner(id: EventId) -> u8 {
    (id >> 24) as u8
}

/// True if the ID lies in the administrative range.
pub const fn is_admin(id: EventId) -> bool {
    owner(id) == ADMIN_OWNER
}

/// Result type for protocol decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors decoding administrative payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload too short for an event id")]
    MissingEventId,

    #[error("event {0:#010x} is not an administrative event")]
    NotAdministrative(EventId),

    #[error("unknown administrative event {0:#010x}")]
    UnknownAdmin(EventId),

    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
}

/// Interest declaration carried by the four (de)registration events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Receiver name. Informational only; the sender identifies the client.
    pub receiver: String,
    /// Event IDs the registration applies to.
    pub events: Vec<EventId>,
}

impl Registration {
    pub fn new(receiver: impl Into<String>, events: Vec<EventId>) -> Self {
        Self {
            receiver: receiver.into(),
            events,
        }
    }
}

/// Report of a dispatch-queue handler that exceeded its time budget.
///
/// Timestamps are the client's own `u32` clock values and are passed
/// through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStall {
    pub queue: String,
    pub event_id: EventId,
    pub time_entered: u32,
    pub time_started: u32,
    pub time_expired: u32,
    pub now: u32,
}

/// Decoded administrative event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    RegisterCcEvents(Registration),
    DeregisterCcEvents(Registration),
    RegisterCmEvents(Registration),
    DeregisterCmEvents(Registration),
    Helo { name: String },
    InitCmEvents,
    Ping { challenge: u32 },
    Pong { response: u32 },
    WatchdogExpired(QueueStall),
    DebugDisableRx { disable: bool, name: String },
    DebugDisableTx { disable: bool, name: String },
}

impl AdminMessage {
    /// Event ID this message travels under.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::RegisterCcEvents(_) => REGISTER_CC_EVENTS,
            Self::DeregisterCcEvents(_) => DEREGISTER_CC_EVENTS,
            Self::RegisterCmEvents(_) => REGISTER_CM_EVENTS,
            Self::DeregisterCmEvents(_) => DEREGISTER_CM_EVENTS,
            Self::Helo { .. } => HELO,
            Self::InitCmEvents => INIT_CM_EVENTS,
            Self::Ping { .. } => PING,
            Self::Pong { .. } => PONG,
            Self::WatchdogExpired(_) => WATCHDOG_EXPIRED,
            Self::DebugDisableRx { .. } => DEBUG_DISABLE_RX,
            Self::DebugDisableTx { .. } => DEBUG_DISABLE_TX,
        }
    }

    /// Decode a complete payload (event ID included).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = payload;
        if r.remaining() < 4 {
            return Err(ProtocolError::MissingEventId);
        }
        let id = r.get_u32_ne();
        if !is_admin(id) {
            return Err(ProtocolError::NotAdministrative(id));
        }

        let msg = match id {
            REGISTER_CC_EVENTS => Self::RegisterCcEvents(get_registration(&mut r)?),
            DEREGISTER_CC_EVENTS => Self::DeregisterCcEvents(get_registration(&mut r)?),
            REGISTER_CM_EVENTS => Self::RegisterCmEvents(get_registration(&mut r)?),
            DEREGISTER_CM_EVENTS => Self::DeregisterCmEvents(get_registration(&mut r)?),
            HELO => Self::Helo {
                name: get_string(&mut r, "name")?,
            },
            INIT_CM_EVENTS => Self::InitCmEvents,
            PING => Self::Ping {
                challenge: get_u32(&mut r, "challenge")?,
            },
            PONG => Self::Pong {
                response: get_u32(&mut r, "response")?,
            },
            WATCHDOG_EXPIRED => Self::WatchdogExpired(QueueStall {
                queue: get_string(&mut r, "queue")?,
                event_id: get_u32(&mut r, "event_id")?,
                time_entered: get_u32(&mut r, "time_entered")?,
                time_started: get_u32(&mut r, "time_started")?,
                time_expired: get_u32(&mut r, "time_expired")?,
                now: get_u32(&mut r, "now")?,
            }),
            DEBUG_DISABLE_RX => Self::DebugDisableRx {
                disable: get_u32(&mut r, "state")? != 0,
                name: get_string(&mut r, "name")?,
            },
            DEBUG_DISABLE_TX => Self::DebugDisableTx {
                disable: get_u32(&mut r, "state")? != 0,
                name: get_string(&mut r, "name")?,
            },
            other => return Err(ProtocolError::UnknownAdmin(other)),
        };
        Ok(msg)
    }

    /// Encode into a fresh buffer ready for `push_message`.
    pub fn encode(&self) -> Buffer {
        let mut out = BytesMut::with_capacity(64);
        out.put_u32_ne(self.event_id());

        match self {
            Self::RegisterCcEvents(reg)
            | Self::DeregisterCcEvents(reg)
            | Self::RegisterCmEvents(reg)
            | Self::DeregisterCmEvents(reg) => {
                put_string(&mut out, &reg.receiver);
                out.put_u32_ne(reg.events.len() as u32);
                for id in &reg.events {
                    out.put_u32_ne(*id);
                }
            }
            Self::Helo { name } => put_string(&mut out, name),
            Self::InitCmEvents => {}
            Self::Ping { challenge } => out.put_u32_ne(*challenge),
            Self::Pong { response } => out.put_u32_ne(*response),
            Self::WatchdogExpired(stall) => {
                put_string(&mut out, &stall.queue);
                out.put_u32_ne(stall.event_id);
                out.put_u32_ne(stall.time_entered);
                out.put_u32_ne(stall.time_started);
                out.put_u32_ne(stall.time_expired);
                out.put_u32_ne(stall.now);
            }
            Self::DebugDisableRx { disable, name } | Self::DebugDisableTx { disable, name } => {
                out.put_u32_ne(u32::from(*disable));
                put_string(&mut out, name);
            }
        }

        Buffer::from_payload(&out)
    }
}

fn ensure(r: &&[u8], field: &'static str, needed: usize) -> Result<()> {
    if r.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            available: r.remaining(),
        });
    }
    Ok(())
}

fn get_u32(r: &mut &[u8], field: &'static str) -> Result<u32> {
    ensure(r, field, 4)?;
    Ok(r.get_u32_ne())
}

fn get_string(r: &mut &[u8], field: &'static str) -> Result<String> {
    let len = get_u32(r, field)? as usize;
    ensure(r, field, len)?;
    let s = String::from_utf8_lossy(&r[..len]).into_owned();
    r.advance(len);
    Ok(s)
}

fn get_registration(r: &mut &[u8]) -> Result<Registration> {
    let receiver = get_string(r, "receiver")?;
    let count = get_u32(r, "event_count")? as usize;
    ensure(r, "event_list", count.saturating_mul(4))?;
    let events = (0..count).map(|_| r.get_u32_ne()).collect();
    Ok(Registration { receiver, events })
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u32_ne(s.len() as u32);
    out.put_slice(s.as_bytes());
}
