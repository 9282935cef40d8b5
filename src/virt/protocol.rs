//! Line protocol helpers
//!
//! Arguments on the control channel are percent-encoded so that paths with
//! spaces survive whitespace splitting; responses are `ok`, `ok <payload>`
//! or anything else (an error line).

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::Path;

/// Characters left unescaped, matching what virt servers expect from
/// `urllib.parse.quote`.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

/// Percent-encode a guest path or other protocol argument
pub fn quote(s: &str) -> String {
    percent_encode(s.as_bytes(), PATH_SAFE).to_string()
}

/// Percent-encode a host path, byte for byte
pub fn quote_path(path: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;
    percent_encode(path.as_os_str().as_bytes(), PATH_SAFE).to_string()
}

/// Decode a percent-encoded argument
pub fn unquote(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Payload of a successful response, or `None` for an error line
pub fn ok_payload(response: &str) -> Option<&str> {
    if response == "ok" {
        Some("")
    } else {
        response.strip_prefix("ok ")
    }
}

/// Parse the comma-separated, percent-encoded argv returned by
/// `print-execute-command`
pub fn parse_execute_command(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .filter(|part| !part.is_empty())
        .map(unquote)
        .collect()
}
