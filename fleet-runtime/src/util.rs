//! Shell-safety primitives shared by the worker transport, provisioner, and
//! config store. Every identifier interpolated into a remote command must
//! pass through these allow-lists; arbitrary payloads never touch a command
//! string at all (§4.1, §9 "shell composition vs structured API").

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{ControlPlaneError, Result};

/// Root of every tenant's per-instance data directory on a worker host.
pub const DATA_ROOT: &str = "/srv/openclaw/tenants";

pub fn tenant_data_dir(tenant_id: &str) -> String {
    format!("{DATA_ROOT}/{tenant_id}")
}

/// Validate a UUID-form identifier (tenant id, container id). Returns the
/// identifier unchanged on success so call sites can chain it.
pub fn validate_uuid(value: &str) -> Result<&str> {
    uuid::Uuid::parse_str(value)
        .map(|_| value)
        .map_err(|_| ControlPlaneError::InvariantViolation(format!("not a UUID: {value}")))
}

/// Validate a name-form identifier (subdomain, skill id, worker address
/// label): `[A-Za-z0-9][A-Za-z0-9_.-]+`.
pub fn validate_name(value: &str) -> Result<&str> {
    let mut chars = value.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if first_ok && rest_ok {
        Ok(value)
    } else {
        Err(ControlPlaneError::InvariantViolation(format!(
            "invalid identifier: {value}"
        )))
    }
}

/// Single-quote a value for inclusion in a `sh -c` fragment, escaping
/// embedded single quotes. Used only for identifiers that have already
/// passed `validate_uuid`/`validate_name`; arbitrary payloads must go
/// through `base64_stdin_command` instead.
pub fn shell_escape(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Build a command that decodes a base64 payload from stdin and writes it
/// to `dest_path`, rather than interpolating the payload into the command
/// string. `dest_path` must already have passed identifier validation at
/// the call site.
pub fn base64_stdin_write_command(dest_path: &str) -> String {
    format!("base64 -d > {}", shell_escape(dest_path))
}

/// Generate a 256-bit gateway token, hex-encoded (64 chars), per §3.
pub fn generate_gateway_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

type HmacSha256 = Hmac<Sha256>;

/// `containerSecret = HMAC(platformSecret, tenantId)` (§5).
pub fn container_secret(platform_secret: &[u8], tenant_id: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(platform_secret)
        .map_err(|e| ControlPlaneError::InvariantViolation(e.to_string()))?;
    mac.update(tenant_id.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_uuid_rejects_non_uuid() {
        assert!(validate_uuid("not-a-uuid").is_err());
        assert!(validate_uuid(&uuid::Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn validate_name_enforces_charset_and_leading_char() {
        assert!(validate_name("telegram-2").is_ok());
        assert!(validate_name("_leading-underscore").is_err());
        assert!(validate_name("has spaces").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn shell_escape_neutralizes_embedded_quotes() {
        let escaped = shell_escape("a'; rm -rf /; echo '");
        assert_eq!(escaped, "'a'\"'\"'; rm -rf /; echo '\"'\"''");
    }

    #[test]
    fn gateway_token_is_64_hex_chars() {
        let token = generate_gateway_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn container_secret_is_deterministic_per_tenant() {
        let secret = b"platform-secret";
        let a = container_secret(secret, "tenant-a").unwrap();
        let b = container_secret(secret, "tenant-a").unwrap();
        let c = container_secret(secret, "tenant-b").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
