//! Secure Random Tokens
//!
//! Challenges, nonces and session keys handed to clients. All of these are
//! drawn from the OS CSPRNG; none of them need to be reproducible.

use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Random lowercase hex string of exactly `len` characters.
pub fn random_hex_string(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    OsRng.fill_bytes(&mut bytes);
    let mut text = hex::encode(bytes);
    text.truncate(len);
    text
}

/// Random `[A-Za-z0-9]` string of exactly `len` characters.
pub fn random_alphanumeric(len: usize) -> String {
    Alphanumeric.sample_string(&mut OsRng, len)
}

/// Random non-zero session key.
pub fn random_session_key() -> u32 {
    OsRng.gen_range(1..=i32::MAX as u32)
}
