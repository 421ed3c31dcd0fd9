use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// The OS entropy source returned an error.
///
/// Identifier generation is the only fallible step when starting an
/// operation; callers abort the operation rather than continue with a
/// predictable id.
#[derive(Debug, thiserror::Error)]
#[error("entropy source failed: {0}")]
pub struct EntropyError(#[from] rand::Error);

/// A 128-bit trace identifier shared by every span within one operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId(pub [u8; 16]);

/// A 64-bit span identifier for a single request within an operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(pub [u8; 8]);

/// Monotonically increasing id of an event within its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventId(pub u64);

impl TraceId {
    pub fn generate() -> Result<Self, EntropyError> {
        let mut bytes = [0u8; 16];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(TraceId(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// The form carried in the `X-Encore-Trace-ID` header.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = STANDARD_NO_PAD.decode(s).ok()?;
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(TraceId(bytes))
    }
}

impl SpanId {
    pub fn generate() -> Result<Self, EntropyError> {
        let mut bytes = [0u8; 8];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(SpanId(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    pub fn to_u64(self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    pub fn from_u64(v: u64) -> Self {
        SpanId(v.to_le_bytes())
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn trace_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = TraceId::generate().expect("entropy");
            assert!(!id.is_zero());
            assert!(seen.insert(id.0));
        }
    }

    #[test]
    fn span_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = SpanId::generate().expect("entropy");
            assert!(seen.insert(id.0));
        }
    }

    #[test]
    fn span_id_u64_round_trip() {
        let id = SpanId::from_u64(0x0102_0304_0506_0708);
        assert_eq!(id.to_u64(), 0x0102_0304_0506_0708);
        assert_eq!(id.0, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn trace_id_base64_round_trip() {
        let id = TraceId([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        let s = id.to_base64();
        // Raw-std alphabet, no padding.
        assert!(!s.contains('='));
        assert_eq!(TraceId::from_base64(&s), Some(id));
    }

    #[test]
    fn display_is_lower_hex() {
        let id = SpanId([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(id.to_string(), "deadbeef00010203");
    }
}
