//! OTP permission handshake.
//!
//! A blocked pre-tool hook and the listener talk through files in the cache
//! directory, keyed by the assistant session id:
//! - `otp-request-<id>`: written by the hook, read by the listener.
//! - `otp-response-<id>`: written by the listener after validating a code,
//!   consumed by the hook.
//! - `otp-grant-<window>`: approval cache keyed by window name; the file
//!   mtime is the grant timestamp.
//!
//! Parallel hooks in the same turn coalesce: only the hook that finds no
//! recent request file sends the chat prompt, and every sibling unblocks on
//! the single grant written by whichever request gets approved first.
//!
//! Codes are RFC 6238 TOTP (SHA-1, 6 digits, 30 s period, ±1 step skew).

use anyhow::{bail, Context, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Grant lifetime: approvals pre-approve further tools for this long.
pub const OTP_GRANT_TTL: Duration = Duration::from_secs(5 * 60);
/// How long a hook waits for the user before denying.
pub const OTP_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Window within which parallel hooks reuse an existing chat prompt.
pub const REQUEST_COALESCE_WINDOW: Duration = Duration::from_secs(30);

const TOTP_PERIOD: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Written by the pre-tool hook to request approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub session_name: String,
    pub tool_name: String,
    pub tool_input: String,
    pub timestamp: i64,
}

/// Written by the listener after code validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub approved: bool,
    pub timestamp: i64,
}

pub fn request_path(session_id: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("otp-request-{}", session_id))
}

pub fn response_path(session_id: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("otp-response-{}", session_id))
}

pub fn grant_path(window: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("otp-grant-{}", window))
}

/// True if another parallel hook already wrote this request recently —
/// the chat prompt for it is still live, don't send a second one.
pub fn request_already_sent(session_id: &str) -> bool {
    crate::markers::fresh(&request_path(session_id), REQUEST_COALESCE_WINDOW)
}

pub fn write_request(session_id: &str, req: &PermissionRequest) -> Result<()> {
    let path = request_path(session_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec(req)?;
    fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn write_response(session_id: &str, approved: bool) -> Result<()> {
    let resp = PermissionResponse {
        approved,
        timestamp: crate::db::now_millis() / 1000,
    };
    let path = response_path(session_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec(&resp)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Find the assistant session id with a pending request, if any.
pub fn find_pending_session() -> Option<String> {
    let dir = crate::paths::cache_dir();
    let entries = fs::read_dir(&dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(session_id) = name.strip_prefix("otp-request-") {
            return Some(session_id.to_string());
        }
    }
    None
}

pub fn has_valid_grant(window: &str) -> bool {
    crate::markers::fresh(&grant_path(window), OTP_GRANT_TTL)
}

/// Create or refresh the grant for a window (mtime = now).
pub fn write_grant(window: &str) {
    let path = grant_path(window);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::write(path, b"1");
}

/// Block until the listener writes a response, a sibling hook's approval
/// produces a grant, or the timeout expires. Consumes the files it reads.
pub fn wait_for_response(session_id: &str, window: &str, timeout: Duration) -> Result<bool> {
    let resp_path = response_path(session_id);
    let deadline = std::time::Instant::now() + timeout;

    while std::time::Instant::now() < deadline {
        if has_valid_grant(window) {
            let _ = fs::remove_file(request_path(session_id));
            return Ok(true);
        }
        if let Ok(data) = fs::read(&resp_path) {
            let _ = fs::remove_file(&resp_path);
            let _ = fs::remove_file(request_path(session_id));
            let resp: PermissionResponse =
                serde_json::from_slice(&data).context("malformed OTP response file")?;
            return Ok(resp.approved);
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    let _ = fs::remove_file(request_path(session_id));
    bail!("OTP timeout")
}

// --- TOTP ---

/// RFC 4226 HOTP: 6-digit code for a counter value.
fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let code = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | digest[offset + 3] as u32;
    code % 10u32.pow(TOTP_DIGITS)
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let normalized = secret.trim().trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .context("invalid base32 OTP secret")
}

/// Validate a 6-digit TOTP code against the secret, allowing one period of
/// clock skew in each direction.
pub fn validate(secret: &str, code: &str) -> bool {
    let code = code.trim();
    if code.len() != TOTP_DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let Ok(key) = decode_secret(secret) else {
        return false;
    };
    let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return false;
    };
    let counter = now.as_secs() / TOTP_PERIOD;
    for candidate in counter.saturating_sub(1)..=counter + 1 {
        if format!("{:06}", hotp(&key, candidate)) == code {
            return true;
        }
    }
    false
}

/// Generate a fresh secret and its provisioning URI for authenticator apps.
pub fn generate_secret() -> (String, String) {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = BASE32_NOPAD.encode(&bytes);
    let uri = format!(
        "otpauth://totp/CCC:claude-code-companion?secret={}&issuer=CCC&algorithm=SHA1&digits={}&period={}",
        secret, TOTP_DIGITS, TOTP_PERIOD
    );
    (secret, uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_cache_dir<F: FnOnce()>(f: F) {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CCC_CACHE_DIR", dir.path());
        f();
        std::env::remove_var("CCC_CACHE_DIR");
    }

    // ---- TOTP ----

    #[test]
    fn hotp_rfc4226_vectors() {
        // RFC 4226 appendix D, secret "12345678901234567890"
        let secret = b"12345678901234567890";
        let expected = [755224, 287082, 359152, 969429, 338314, 254676];
        for (counter, want) in expected.iter().enumerate() {
            assert_eq!(hotp(secret, counter as u64), *want, "counter {counter}");
        }
    }

    #[test]
    fn validate_accepts_current_code() {
        let secret = BASE32_NOPAD.encode(b"12345678901234567890");
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let code = format!("{:06}", hotp(b"12345678901234567890", now / 30));
        assert!(validate(&secret, &code));
        assert!(validate(&secret, &format!(" {} ", code)), "whitespace tolerated");
    }

    #[test]
    fn validate_rejects_garbage() {
        let secret = BASE32_NOPAD.encode(b"12345678901234567890");
        assert!(!validate(&secret, "000000x"));
        assert!(!validate(&secret, "12345"));
        assert!(!validate(&secret, "abcdef"));
        assert!(!validate("not-base32!", "123456"));
    }

    #[test]
    fn generated_secret_round_trips() {
        let (secret, uri) = generate_secret();
        assert!(decode_secret(&secret).is_ok());
        assert!(uri.contains(&secret));
        assert!(uri.starts_with("otpauth://totp/"));
    }

    #[test]
    fn decode_secret_tolerates_padding_and_case() {
        let canonical = BASE32_NOPAD.encode(b"12345678901234567890");
        let padded = format!("{}====", canonical.to_lowercase());
        assert_eq!(decode_secret(&padded).unwrap(), b"12345678901234567890");
    }

    // ---- handshake files ----

    #[test]
    #[serial]
    fn request_response_round_trip() {
        with_cache_dir(|| {
            let req = PermissionRequest {
                session_name: "web".into(),
                tool_name: "Bash".into(),
                tool_input: "rm -rf build".into(),
                timestamp: 1,
            };
            write_request("sess-1", &req).unwrap();
            assert_eq!(find_pending_session().as_deref(), Some("sess-1"));
            let data = fs::read(request_path("sess-1")).unwrap();
            let read: PermissionRequest = serde_json::from_slice(&data).unwrap();
            assert_eq!(read.tool_name, "Bash");

            write_response("sess-1", true).unwrap();
            let approved = wait_for_response("sess-1", "web", Duration::from_secs(2)).unwrap();
            assert!(approved);
            // Both files consumed
            assert!(find_pending_session().is_none());
            assert!(!response_path("sess-1").exists());
        });
    }

    #[test]
    #[serial]
    fn sibling_grant_unblocks_waiter() {
        with_cache_dir(|| {
            let req = PermissionRequest {
                session_name: "web".into(),
                tool_name: "Edit".into(),
                tool_input: "src/main.rs".into(),
                timestamp: 1,
            };
            write_request("sess-2", &req).unwrap();
            write_grant("win");
            let approved = wait_for_response("sess-2", "win", Duration::from_secs(2)).unwrap();
            assert!(approved);
            assert!(!request_path("sess-2").exists());
        });
    }

    #[test]
    #[serial]
    fn wait_times_out_denied() {
        with_cache_dir(|| {
            let result = wait_for_response("sess-3", "win", Duration::from_millis(100));
            assert!(result.is_err());
        });
    }

    #[test]
    #[serial]
    fn coalescing_window_detects_recent_request() {
        with_cache_dir(|| {
            assert!(!request_already_sent("sess-4"));
            let req = PermissionRequest {
                session_name: "s".into(),
                tool_name: "Bash".into(),
                tool_input: "ls".into(),
                timestamp: 1,
            };
            write_request("sess-4", &req).unwrap();
            assert!(request_already_sent("sess-4"));
        });
    }

    #[test]
    #[serial]
    fn grant_freshness() {
        with_cache_dir(|| {
            assert!(!has_valid_grant("w"));
            write_grant("w");
            assert!(has_valid_grant("w"));
        });
    }
}
