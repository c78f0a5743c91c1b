//! Connection gateway: decides which room an inbound connection belongs to
//! before the WebSocket upgrade happens.
//!
//! The request line is read with `peek`, so the bytes stay in the socket
//! for the upgrade handshake. A request that does not match the configured
//! prefix is dropped at the TCP level with no HTTP response and no room is
//! created for it.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::DEFAULT_ROOM;
use crate::error::RoutingError;

/// Longest request line we are willing to buffer.
const MAX_REQUEST_LINE: usize = 8 * 1024;

const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Map a request target to a room name.
///
/// `prefix` is matched literally against the start of the path, after any
/// scheme, authority, query and fragment have been stripped. The room is the
/// remainder of the path without its leading `/`, or `"default"` when that
/// remainder is empty. Room names are opaque and never percent-decoded.
pub fn route(target: &str, prefix: &str, max_len: usize) -> Result<String, RoutingError> {
    let path = path_of(target);

    let Some(rest) = path.strip_prefix(prefix) else {
        return Err(RoutingError::PrefixMismatch {
            path: path.to_string(),
            prefix: prefix.to_string(),
        });
    };

    let name = rest.strip_prefix('/').unwrap_or(rest);
    if name.is_empty() {
        return Ok(DEFAULT_ROOM.to_string());
    }
    if name.len() > max_len {
        return Err(RoutingError::RoomNameTooLong { len: name.len(), max: max_len });
    }
    if name.chars().any(char::is_control) {
        return Err(RoutingError::InvalidRoomName);
    }
    Ok(name.to_string())
}

/// Path component of a request target (origin-form or absolute-form).
fn path_of(target: &str) -> &str {
    let without_authority = match target.find("://") {
        Some(idx) => {
            let after = &target[idx + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => "/",
            }
        }
        None => target,
    };
    let end = without_authority
        .find(['?', '#'])
        .unwrap_or(without_authority.len());
    &without_authority[..end]
}

/// Extract the target from a buffered request head.
///
/// Returns `Ok(None)` while the request line is still incomplete.
pub fn parse_request_line(head: &[u8]) -> Result<Option<String>, RoutingError> {
    let Some(end) = head.windows(2).position(|w| w == b"\r\n") else {
        if head.len() >= MAX_REQUEST_LINE {
            return Err(RoutingError::MalformedRequest("request line too long".into()));
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&head[..end])
        .map_err(|_| RoutingError::MalformedRequest("request line is not UTF-8".into()))?;
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            Ok(Some(target.to_string()))
        }
        _ => Err(RoutingError::MalformedRequest(format!("{line:?}"))),
    }
}

/// Peek at the request line of an inbound connection without consuming it.
pub async fn read_request_target(
    stream: &TcpStream,
    deadline: Duration,
) -> Result<String, RoutingError> {
    let peek = async {
        let mut buf = vec![0u8; MAX_REQUEST_LINE];
        let mut seen = 0;
        loop {
            let n = stream
                .peek(&mut buf)
                .await
                .map_err(|e| RoutingError::MalformedRequest(e.to_string()))?;
            if n == 0 {
                return Err(RoutingError::MalformedRequest("connection closed".into()));
            }
            if let Some(target) = parse_request_line(&buf[..n])? {
                return Ok(target);
            }
            // Peek returns immediately while data is buffered.
            if n == seen {
                tokio::time::sleep(PEEK_RETRY).await;
            }
            seen = n;
        }
    };

    tokio::time::timeout(deadline, peek)
        .await
        .map_err(|_| RoutingError::HeadTimeout)?
}
