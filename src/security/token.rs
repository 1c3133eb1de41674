use rand::RngCore;

/// 32 random bytes, hex-encoded: the shape shared by enrollment tokens and
/// per-agent auth tokens.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}
