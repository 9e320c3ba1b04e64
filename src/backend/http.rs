//! Placeholder HTTP responder.
//!
//! Reads the request head, answers every request with a fixed body and
//! writes one access-log line. Real HTTP handling lives outside the engine.

use std::io::{Read, Write};
use std::time::Duration;

use super::{Connection, Protocol};
use crate::log::Level;
use crate::types::{BackendConfig, Result};

const MAX_HEAD: usize = 8 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BODY: &str = "forkd\n";

#[derive(Debug, Default)]
pub struct Http {
    name: String,
    body: String,
}

impl Http {
    fn read_head(conn: &mut Connection<'_>) -> Result<Vec<u8>> {
        let mut head = Vec::with_capacity(512);
        let mut buf = [0u8; 1024];
        while head.len() < MAX_HEAD {
            let n = conn.read(&mut buf)?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") || head.windows(2).any(|w| w == b"\n\n") {
                break;
            }
        }
        Ok(head)
    }
}

/// Method and target of a request line, if it looks like one.
fn request_line(head: &[u8]) -> Option<(&str, &str)> {
    let first = head.split(|&b| b == b'\n').next()?;
    let first = std::str::from_utf8(first).ok()?.trim_end_matches('\r');
    let mut parts = first.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    match parts.next() {
        Some(version) if version.starts_with("HTTP/") => Some((method, target)),
        _ => None,
    }
}

impl Protocol for Http {
    fn init(&mut self, name: &str, config: &BackendConfig) -> Result<()> {
        self.name = name.to_string();
        self.body = config
            .body
            .clone()
            .unwrap_or_else(|| DEFAULT_BODY.to_string());
        Ok(())
    }

    fn serve(&mut self, conn: &mut Connection<'_>) -> Result<()> {
        conn.stream().set_read_timeout(Some(READ_TIMEOUT))?;
        let head = Self::read_head(conn)?;
        if head.is_empty() {
            return Ok(());
        }

        let (status, reason, body, request) = match request_line(&head) {
            Some((method, target)) => (200, "OK", self.body.as_str(), format!("{} {}", method, target)),
            None => (400, "Bad Request", "bad request\n", "-".to_string()),
        };

        let response = format!(
            "HTTP/1.0 {} {}\r\nServer: forkd\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        );
        conn.write_all(response.as_bytes())?;
        conn.flush()?;

        let line = format!(
            "{} {} \"{}\" {} {}",
            self.name,
            conn.peer(),
            request,
            status,
            body.len()
        );
        conn.log(Level::Notice, &line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_needs_method_target_and_version() {
        assert_eq!(
            request_line(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some(("GET", "/index.html"))
        );
        assert_eq!(request_line(b"GET /\r\n\r\n"), None);
        assert_eq!(request_line(b"hello world again\n\n"), None);
        assert_eq!(request_line(&[0xff, 0xfe, b'\n']), None);
    }

    #[test]
    fn init_takes_body_from_config() {
        let mut http = Http::default();
        let mut config = BackendConfig::new("http", "127.0.0.1:0");
        http.init("www", &config).unwrap();
        assert_eq!(http.body, DEFAULT_BODY);

        config.body = Some("hello\n".to_string());
        http.init("www", &config).unwrap();
        assert_eq!(http.body, "hello\n");
        assert_eq!(http.name, "www");
    }
}
