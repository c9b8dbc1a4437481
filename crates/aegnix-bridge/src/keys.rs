//! Hex key files.
//!
//! One key per file, lowercase hex, optional trailing newline. Secret key
//! files are written with owner-only permissions on Unix.

use std::{fs, path::Path};

use crate::error::BridgeError;

/// Read a hex-encoded key of exactly `expected` bytes.
///
/// # Errors
///
/// - `KeyFile`: the file is unreadable, not hex, or the wrong length
pub fn read_hex_key(path: &Path, expected: usize) -> Result<Vec<u8>, BridgeError> {
    let key_file_error =
        |reason: String| BridgeError::KeyFile { path: path.to_path_buf(), reason };

    let text = fs::read_to_string(path).map_err(|e| key_file_error(e.to_string()))?;
    let bytes = hex::decode(text.trim()).map_err(|e| key_file_error(e.to_string()))?;

    if bytes.len() != expected {
        return Err(key_file_error(format!("expected {expected} bytes, got {}", bytes.len())));
    }
    Ok(bytes)
}

/// Write a public key as hex.
pub fn write_public_key(path: &Path, bytes: &[u8]) -> Result<(), BridgeError> {
    fs::write(path, format!("{}\n", hex::encode(bytes)))?;
    Ok(())
}

/// Write a secret key as hex, readable by the owner only.
pub fn write_secret_key(path: &Path, bytes: &[u8]) -> Result<(), BridgeError> {
    write_public_key(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
