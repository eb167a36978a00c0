use crate::error::{Error, Result};

/// Hex length of every digest the deriver accepts.
pub const DIGEST_HEX_LEN: usize = 32;

/// Fixed-length hex digest over arbitrary bytes.
pub trait Hasher {
    fn hex_digest(&self, input: &[u8]) -> Result<String>;
}

/// MD5 digest. Only the bit spread matters here, not collision resistance.
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5Hasher;

impl Hasher for Md5Hasher {
    fn hex_digest(&self, input: &[u8]) -> Result<String> {
        Ok(hex::encode(md5::compute(input).0))
    }
}

/// Runs `hasher` and rejects output that is not a 32-char lowercase hex string.
pub fn checked_digest<H: Hasher + ?Sized>(hasher: &H, input: &[u8]) -> Result<String> {
    let digest = hasher.hex_digest(input)?;
    if digest.len() != DIGEST_HEX_LEN
        || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(Error::Derivation(format!(
            "digest has unexpected shape ({} chars)",
            digest.len()
        )));
    }
    Ok(digest)
}
