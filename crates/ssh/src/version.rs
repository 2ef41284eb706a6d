//! SSH identification string exchange (RFC 4253 Section 4.2).
//!
//! Both sides start by sending a line of the form:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines first (a pre-login banner); the client skips
//! them until the line beginning with `SSH-`. Lines are read one byte at a
//! time so that no packet bytes following the identification line are
//! consumed from the stream.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::version::Version;
//!
//! let version = Version::new("Fynx_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Fynx_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! ```

use fynx_platform::{FynxError, FynxResult};
use std::io::{Read, Write};
use tracing::debug;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of banner lines accepted before the identification line.
pub const MAX_BANNER_LINES: usize = 1024;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH-2.0 version string.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Fynx client version string.
    pub fn default_fynx() -> Self {
        Self::new(&format!("Fynx_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> FynxResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(FynxError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(FynxError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(FynxError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(FynxError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        // 1.99 means "2.0 and also 1.x"; anything else is out of scope
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(FynxError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Fynx_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Sends the local identification line and reads the peer's.
///
/// Returns the exact identification strings (without CR LF) of both sides,
/// as they must be fed into the exchange hash.
///
/// # Errors
///
/// - [`FynxError::UnexpectedTermination`] if the stream fails or ends
/// - [`FynxError::Protocol`] if the peer's identification is invalid or not
///   SSH-2
pub fn exchange_identification<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    local: &Version,
) -> FynxResult<(String, String)> {
    writer
        .write_all(&local.to_wire_format())
        .and_then(|_| writer.flush())
        .map_err(|e| {
            FynxError::UnexpectedTermination(format!("Failed to send identification: {}", e))
        })?;

    let remote_line = read_identification(reader)?;
    let remote = Version::parse(&remote_line)?;
    debug!(
        local = %local,
        remote = %remote,
        "Identification exchanged"
    );

    Ok((local.to_string(), remote_line))
}

/// Reads lines until one starts with `SSH-` and returns it without CR LF.
pub fn read_identification<R: Read + ?Sized>(reader: &mut R) -> FynxResult<String> {
    for _ in 0..MAX_BANNER_LINES {
        let line = read_line(reader)?;
        if line.starts_with("SSH-") {
            return Ok(line);
        }
        debug!(line = %line, "Skipping pre-identification banner line");
    }

    Err(FynxError::Protocol(format!(
        "No identification string within {} lines",
        MAX_BANNER_LINES
    )))
}

fn read_line<R: Read + ?Sized>(reader: &mut R) -> FynxResult<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).map_err(|e| {
            FynxError::UnexpectedTermination(format!("Failed to read identification: {}", e))
        })?;
        if n == 0 {
            return Err(FynxError::UnexpectedTermination(
                "Stream closed during identification exchange".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(FynxError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line)
        .map_err(|_| FynxError::Protocol("Identification line is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_version_display() {
        let version = Version::new("Fynx_0.1.0", Some("OpenSSF compliant"));
        assert_eq!(version.to_string(), "SSH-2.0-Fynx_0.1.0 OpenSSF compliant");
        assert_eq!(version.comments(), Some("OpenSSF compliant"));
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_compat_199() {
        let version = Version::parse("SSH-1.99-Legacy_1.0\r\n").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.5-OldServer") {
            Err(FynxError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_exchange_skips_banner_and_leaves_packet_bytes() {
        let incoming = b"Welcome to the lab\r\nSSH-2.0-OpenSSH_9.6\r\n\x00\x00\x00\x0c".to_vec();
        let mut reader = Cursor::new(incoming);
        let mut sent = Vec::new();

        let (local, remote) =
            exchange_identification(&mut reader, &mut sent, &Version::new("Fynx_test", None))
                .unwrap();

        assert_eq!(local, "SSH-2.0-Fynx_test");
        assert_eq!(remote, "SSH-2.0-OpenSSH_9.6");
        assert_eq!(sent, b"SSH-2.0-Fynx_test\r\n");

        // The first packet bytes must still be unread
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![0, 0, 0, 0x0c]);
    }

    #[test]
    fn test_exchange_eof() {
        let mut reader = Cursor::new(b"SSH-2.0-trunc".to_vec());
        let mut sent = Vec::new();
        let result = exchange_identification(&mut reader, &mut sent, &Version::default_fynx());
        assert!(matches!(result, Err(FynxError::UnexpectedTermination(_))));
    }

    #[test]
    fn test_identification_line_too_long() {
        let mut line = b"SSH-2.0-".to_vec();
        line.extend(std::iter::repeat(b'x').take(400));
        line.extend_from_slice(b"\r\n");
        let result = read_identification(&mut Cursor::new(line));
        assert!(matches!(result, Err(FynxError::Protocol(_))));
    }
}
