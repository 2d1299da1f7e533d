//! The decoded syslog record the rest of the system operates on, plus the
//! severity/facility ranking convention used to compare them.
//!
//! Decoding itself is delegated to `syslog_loose`, an RFC 5424/3164
//! parser treated as an external collaborator rather than reimplemented
//! here; [`decode`] just projects its borrowed [`syslog_loose::Message`]
//! into our own owned, 'static record so nothing downstream has to carry
//! the parser's lifetime.

use std::net::SocketAddr;

use syslog_loose::{Message, Variant};

/// A fully decoded syslog record, independent of the wire format it
/// arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogRecord {
    pub severity: Severity,
    pub facility: Facility,
    pub hostname: String,
    pub msg: String,
}

/// Severity as its raw RFC 5424 code (0 = emerg .. 7 = debug).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Severity(pub u8);

const SEVERITY_NAMES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

impl Severity {
    /// rank = 7 - code, so `emerg` (0) ranks highest (7) and `debug` (7)
    /// ranks lowest (0).
    pub fn rank(self) -> i32 {
        7 - i32::from(self.0)
    }

    pub fn name(self) -> &'static str {
        SEVERITY_NAMES.get(self.0 as usize).copied().unwrap_or("unknown")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        SEVERITY_NAMES
            .iter()
            .position(|n| *n == lower)
            .map(|code| Severity(code as u8))
    }
}

/// Facility as its raw RFC 5424 code, or `None` for "unknown" (ranked
/// at `-1`, below every named facility).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facility(pub Option<u8>);

const FACILITY_NAMES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1",
    "local2", "local3", "local4", "local5", "local6", "local7",
];

impl Facility {
    /// rank = 23 - code, except "unknown" which is always -1.
    pub fn rank(self) -> i32 {
        match self.0 {
            Some(code) => 23 - i32::from(code),
            None => -1,
        }
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            Some(code) => FACILITY_NAMES.get(code as usize).copied().unwrap_or("unknown"),
            None => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower == "unknown" {
            return Some(Facility(None));
        }
        FACILITY_NAMES
            .iter()
            .position(|n| *n == lower)
            .map(|code| Facility(Some(code as u8)))
    }
}

/// Decodes one UDP datagram as RFC 5424 (falling back to the looser
/// RFC 3164 framing `syslog_loose` also understands) into our record type.
///
/// Returns `None` on anything the parser can't make sense of. Malformed
/// datagrams are dropped silently rather than surfaced, since there's no
/// client to report a UDP framing error to.
pub fn decode(datagram: &[u8], _from: SocketAddr) -> Option<SyslogRecord> {
    let text = std::str::from_utf8(datagram).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    let parsed: Message<&str> = syslog_loose::parse_message(text, Variant::Either);
    from_parsed(parsed)
}

fn from_parsed(msg: Message<&str>) -> Option<SyslogRecord> {
    let severity = Severity(msg.severity.map(|s| s as u8).unwrap_or(6)); // default to "info" when absent
    let facility = Facility(msg.facility.map(|f| f as u8));
    let hostname = msg.hostname.unwrap_or("").to_string();
    Some(SyslogRecord {
        severity,
        facility,
        hostname,
        msg: msg.msg.to_string(),
    })
}

/// Renders the line a worker hands the Manager when a record matches,
/// stamped with the time the worker observed the match rather than
/// anything carried on the wire, since not every syslog sender includes
/// a trustworthy timestamp.
pub fn render(record: &SyslogRecord) -> String {
    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
    format!(
        "{now} <{}.{}> {} {}",
        record.facility.name(),
        record.severity.name(),
        record.hostname,
        record.msg
    )
}

/// Builds a record directly, for tests that don't need to go through
/// datagram decoding.
#[cfg(test)]
pub fn test_record(severity: u8, facility: Option<u8>, hostname: &str, msg: &str) -> SyslogRecord {
    SyslogRecord {
        severity: Severity(severity),
        facility: Facility(facility),
        hostname: hostname.to_string(),
        msg: msg.to_string(),
    }
}
