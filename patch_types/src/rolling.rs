/// Incremental 64-bit polynomial rolling hash over a chunk data window.
///
/// The install source computes this over a reassembled window and compares it
/// against the manifest's recorded value before trusting locally sourced
/// bytes; the SHA digest is the stronger check, but the rolling hash is kept
/// because manifests may carry only one of the two.
#[derive(Clone, Debug)]
pub struct RollingHash {
    state: u64,
    window_len: u64,
}

const HASH_PRIME: u64 = 0x00000100000001B3;

impl RollingHash {
    pub fn new() -> Self {
        Self { state: 0xcbf29ce484222325, window_len: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(HASH_PRIME);
        }
        self.window_len += data.len() as u64;
    }

    pub fn finalize(&self) -> u64 {
        // Fold the window length in so windows of trailing zeros differ.
        (self.state ^ self.window_len).wrapping_mul(HASH_PRIME)
    }

    pub fn hash_window(data: &[u8]) -> u64 {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}
