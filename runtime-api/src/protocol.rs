/// Version reported in the `X-Encore-Trace-Version` header.
pub const TRACE_VERSION: u32 = 7;

/// Size of the fixed header preceding every event payload on the wire:
/// type (1) + event id (8, LE) + nanotime (8, LE) + trace id (16) +
/// span id (8) + payload length (4, LE).
pub const EVENT_HEADER_LEN: usize = 45;

/// Stack encodings carry at most this many frames. The frame count is a
/// single byte on the wire; exceeding it indicates a codec bug.
pub const MAX_STACK_FRAMES: usize = 255;

/// The kind byte of a trace event.
///
/// Values are part of the version-7 wire format and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    RequestSpanStart = 0x01,
    RequestSpanEnd = 0x02,
    AuthSpanStart = 0x03,
    AuthSpanEnd = 0x04,
    PubsubMessageSpanStart = 0x05,
    PubsubMessageSpanEnd = 0x06,
    TestSpanStart = 0x07,
    TestSpanEnd = 0x08,
    RpcCallStart = 0x09,
    RpcCallEnd = 0x0a,
    DbQueryStart = 0x0b,
    DbQueryEnd = 0x0c,
    DbTransactionStart = 0x0d,
    DbTransactionEnd = 0x0e,
    PubsubPublishStart = 0x0f,
    PubsubPublishEnd = 0x10,
    HttpCallStart = 0x11,
    HttpCallEnd = 0x12,
    LogMessage = 0x13,
    ServiceInitStart = 0x14,
    ServiceInitEnd = 0x15,
    CacheCallStart = 0x16,
    CacheCallEnd = 0x17,
    BodyStream = 0x18,
    TaskStart = 0x19,
    TaskEnd = 0x1a,
    TaskClear = 0x1b,
}

impl EventType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::RequestSpanStart,
            0x02 => Self::RequestSpanEnd,
            0x03 => Self::AuthSpanStart,
            0x04 => Self::AuthSpanEnd,
            0x05 => Self::PubsubMessageSpanStart,
            0x06 => Self::PubsubMessageSpanEnd,
            0x07 => Self::TestSpanStart,
            0x08 => Self::TestSpanEnd,
            0x09 => Self::RpcCallStart,
            0x0a => Self::RpcCallEnd,
            0x0b => Self::DbQueryStart,
            0x0c => Self::DbQueryEnd,
            0x0d => Self::DbTransactionStart,
            0x0e => Self::DbTransactionEnd,
            0x0f => Self::PubsubPublishStart,
            0x10 => Self::PubsubPublishEnd,
            0x11 => Self::HttpCallStart,
            0x12 => Self::HttpCallEnd,
            0x13 => Self::LogMessage,
            0x14 => Self::ServiceInitStart,
            0x15 => Self::ServiceInitEnd,
            0x16 => Self::CacheCallStart,
            0x17 => Self::CacheCallEnd,
            0x18 => Self::BodyStream,
            0x19 => Self::TaskStart,
            0x1a => Self::TaskEnd,
            0x1b => Self::TaskClear,
            _ => return None,
        })
    }
}

/// Sub-event codes recorded inside an HTTP round-trip (`HttpCallEnd`
/// payload). Each sub-event is `(code byte, nanotime ivar, payload)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HttpEventCode {
    GetConn = 0x01,
    GotConn = 0x02,
    GotFirstResponseByte = 0x03,
    Got1xxResponse = 0x04,
    DnsStart = 0x05,
    DnsDone = 0x06,
    ConnectStart = 0x07,
    ConnectDone = 0x08,
    TlsHandshakeStart = 0x09,
    TlsHandshakeDone = 0x0a,
    WroteHeaders = 0x0b,
    WroteRequest = 0x0c,
    Wait100Continue = 0x0d,
    ClosedBody = 0x0e,
}

impl HttpEventCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::GetConn,
            0x02 => Self::GotConn,
            0x03 => Self::GotFirstResponseByte,
            0x04 => Self::Got1xxResponse,
            0x05 => Self::DnsStart,
            0x06 => Self::DnsDone,
            0x07 => Self::ConnectStart,
            0x08 => Self::ConnectDone,
            0x09 => Self::TlsHandshakeStart,
            0x0a => Self::TlsHandshakeDone,
            0x0b => Self::WroteHeaders,
            0x0c => Self::WroteRequest,
            0x0d => Self::Wait100Continue,
            0x0e => Self::ClosedBody,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_bytes_round_trip() {
        for b in 0x01..=0x1b {
            let typ = EventType::from_byte(b).expect("known event type");
            assert_eq!(typ as u8, b);
        }
        assert_eq!(EventType::from_byte(0x00), None);
        assert_eq!(EventType::from_byte(0x1c), None);
    }

    #[test]
    fn http_event_codes_round_trip() {
        for b in 0x01..=0x0e {
            let code = HttpEventCode::from_byte(b).expect("known code");
            assert_eq!(code as u8, b);
        }
        assert_eq!(HttpEventCode::from_byte(0x0f), None);
    }
}
