//! Fletcher-64 checksums over 32-bit words.
//!
//! Two running 32-bit sums are kept: `lo` adds each little-endian word,
//! `hi` adds `lo` after every word. The result is `hi << 32 | lo`.
//!
//! A checksum can be *continued* from a previous result, which is how the
//! segment generation is folded into buffer entry checksums, and a range
//! can be fed as zeros, which is how a checksum field excludes itself.

/// Incremental Fletcher-64 state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fletcher64 {
    lo: u32,
    hi: u32,
    partial: [u8; 4],
    partial_len: usize,
}

impl Fletcher64 {
    /// Starts a fresh checksum.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lo: 0,
            hi: 0,
            partial: [0; 4],
            partial_len: 0,
        }
    }

    /// Continues from a previously finished checksum.
    #[must_use]
    pub const fn resume(checksum: u64) -> Self {
        Self {
            lo: checksum as u32,
            hi: (checksum >> 32) as u32,
            partial: [0; 4],
            partial_len: 0,
        }
    }

    fn word(&mut self, word: u32) {
        self.lo = self.lo.wrapping_add(word);
        self.hi = self.hi.wrapping_add(self.lo);
    }

    /// Feeds bytes into the checksum.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.partial_len > 0 {
            let take = (4 - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < 4 {
                return;
            }
            let word = u32::from_le_bytes(self.partial);
            self.word(word);
            self.partial_len = 0;
        }

        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            self.word(u32::from_le_bytes(word));
        }
        let rest = chunks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    /// Feeds `len` zero bytes into the checksum.
    pub fn update_zeroed(&mut self, len: usize) {
        const ZEROS: [u8; 64] = [0; 64];
        let mut left = len;
        while left > 0 {
            let step = left.min(ZEROS.len());
            self.update(&ZEROS[..step]);
            left -= step;
        }
    }

    /// Returns the checksum, zero-padding a trailing partial word.
    #[must_use]
    pub fn finish(mut self) -> u64 {
        if self.partial_len > 0 {
            self.partial[self.partial_len..].fill(0);
            let word = u32::from_le_bytes(self.partial);
            self.word(word);
        }
        (u64::from(self.hi) << 32) | u64::from(self.lo)
    }
}

/// Computes the checksum of `data`, treating the 8-byte field at `skip`
/// (if any) as zero.
#[must_use]
pub fn compute(data: &[u8], skip: Option<usize>) -> u64 {
    let mut sum = Fletcher64::new();
    match skip {
        Some(at) if at < data.len() => {
            let end = (at + 8).min(data.len());
            sum.update(&data[..at]);
            sum.update_zeroed(end - at);
            sum.update(&data[end..]);
        }
        _ => sum.update(data),
    }
    sum.finish()
}

/// Continues `checksum` over `data`.
#[must_use]
pub fn compute_seq(checksum: u64, data: &[u8]) -> u64 {
    let mut sum = Fletcher64::resume(checksum);
    sum.update(data);
    sum.finish()
}
