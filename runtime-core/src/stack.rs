use runtime_api::EventBuffer;

/// Captures at most this many frames. Must stay well under the codec's
/// one-byte frame count limit.
const MAX_FRAMES: usize = 100;

/// A captured stack: raw program counters plus the offset they are
/// delta-encoded against.
///
/// Without a stable image load address the offset is zero and frames are
/// encoded raw; the wire shape is unchanged, only delta compression is
/// lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stack {
    pub pcs: Vec<u64>,
    pub offset: u64,
}

impl Stack {
    /// Capture the current call stack. The frames belonging to the capture
    /// machinery itself are skipped.
    pub fn capture() -> Self {
        let mut pcs = Vec::with_capacity(16);
        let mut skip = 2usize;
        backtrace::trace(|frame| {
            if skip > 0 {
                skip -= 1;
                return true;
            }
            pcs.push(frame.ip() as u64);
            pcs.len() < MAX_FRAMES
        });
        Stack { pcs, offset: 0 }
    }

    pub fn encode(&self, buf: &mut EventBuffer) {
        buf.stack(&self.pcs, self.offset);
    }
}

/// Encodes an optional stack, writing the zero-frame form when absent.
pub fn encode_opt(stack: Option<&Stack>, buf: &mut EventBuffer) {
    match stack {
        Some(s) => s.encode(buf),
        None => buf.no_stack(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_api::ReadBuffer;

    #[test]
    fn capture_is_bounded() {
        let stack = Stack::capture();
        assert!(stack.pcs.len() <= MAX_FRAMES);
    }

    #[test]
    fn encode_round_trips() {
        let stack = Stack {
            pcs: vec![0x1000, 0x1040, 0x2000],
            offset: 0x800,
        };
        let mut buf = EventBuffer::new();
        stack.encode(&mut buf);
        let mut rd = ReadBuffer::new(buf.as_slice());
        assert_eq!(rd.stack(0x800).unwrap(), stack.pcs);
    }

    #[test]
    fn absent_stack_is_zero_frames() {
        let mut buf = EventBuffer::new();
        encode_opt(None, &mut buf);
        assert_eq!(buf.as_slice(), &[0]);
    }
}
