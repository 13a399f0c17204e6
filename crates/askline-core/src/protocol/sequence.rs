//! Packet id counter for outbound application packets.

/// Id prefix the service expects on the first query of a client.
pub const DEFAULT_BASE: u64 = 420;

/// Produces the `<seq>` prefix for outbound event packets.
///
/// `n` cycles through `0..=9`; each wrap multiplies `base` by ten, so ids stay
/// distinguishable and strictly increase until the counter wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter {
    base: u64,
    n: u8,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE)
    }
}

impl SequenceCounter {
    pub fn new(base: u64) -> Self {
        Self { base, n: 1 }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    /// Current id without advancing.
    pub fn current(&self) -> u64 {
        self.base + u64::from(self.n)
    }

    /// Advance once for a new query and return the id to send.
    pub fn advance(&mut self) -> u64 {
        if self.n == 9 {
            self.n = 0;
            self.base = self.base.saturating_mul(10);
        } else {
            self.n += 1;
        }
        self.current()
    }
}
