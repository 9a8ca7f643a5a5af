//! Unique identifiers for inbox subjects and request tokens.

use rand::Rng;

pub const INBOX_PREFIX: &str = "_INBOX";

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const MAX_SEQ: u64 = 839_299_365_868_340_224; // 62^10
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// Generator of 22-character base62 identifiers: a random prefix plus a
/// sequential suffix advanced by a random increment.
#[derive(Debug, Clone)]
pub struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl Default for Nuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Nuid {
    #[must_use]
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut nuid = Self {
            prefix: [b'0'; PREFIX_LEN],
            seq: rng.gen_range(0..MAX_SEQ),
            inc: rng.gen_range(MIN_INC..MAX_INC),
        };
        nuid.randomize_prefix();
        nuid
    }

    fn randomize_prefix(&mut self) {
        let mut rng = rand::thread_rng();
        for byte in &mut self.prefix {
            *byte = DIGITS[rng.gen_range(0..DIGITS.len())];
        }
    }

    pub fn next_id(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.randomize_prefix();
            let mut rng = rand::thread_rng();
            self.seq = rng.gen_range(0..MAX_SEQ);
            self.inc = rng.gen_range(MIN_INC..MAX_INC);
        }

        let mut out = [b'0'; PREFIX_LEN + SEQ_LEN];
        out[..PREFIX_LEN].copy_from_slice(&self.prefix);
        let mut seq = self.seq;
        for slot in out[PREFIX_LEN..].iter_mut().rev() {
            #[allow(clippy::cast_possible_truncation)]
            {
                *slot = DIGITS[(seq % BASE) as usize];
            }
            seq /= BASE;
        }
        out.iter().map(|&b| char::from(b)).collect()
    }
}

/// Creates a new inbox subject under the default `_INBOX` prefix.
#[must_use]
pub fn create_inbox() -> String {
    create_inbox_with_prefix(INBOX_PREFIX)
}

#[must_use]
pub fn create_inbox_with_prefix(prefix: &str) -> String {
    format!("{prefix}.{}", Nuid::new().next_id())
}
