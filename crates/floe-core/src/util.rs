//! Small shared helpers.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// Length in bytes of the random session identifier echoed by the
/// rendezvous protocol.
pub const SESSION_ID_LENGTH: usize = 16;

/// Generate a fresh opaque session id: random bytes, base64 without padding.
pub fn gen_session_id() -> String {
    let mut buf = [0u8; SESSION_ID_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    STANDARD_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        let sid = gen_session_id();
        assert!(!sid.ends_with('='));
        let bytes = STANDARD_NO_PAD.decode(&sid).expect("valid base64");
        assert_eq!(bytes.len(), SESSION_ID_LENGTH);
    }

    #[test]
    fn session_ids_are_distinct() {
        assert_ne!(gen_session_id(), gen_session_id());
    }
}
