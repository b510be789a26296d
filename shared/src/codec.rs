//! Pseudo-HTTP codec for the two SSDP message shapes exchanged by the
//! discovery roles: the `M-SEARCH` request and its `200 OK` response.
//!
//! Decoding is permissive. Anything after the first blank line is ignored,
//! empty lines are skipped and header lines without a `:` separator are
//! dropped instead of failing the whole datagram.

use std::collections::HashMap;
use std::fmt::Write as _;
use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::protocol::CACHE_MAX_AGE_SECS;

const CRLF: &str = "\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("datagram has no command line")]
    EmptyCommand,
}

/// A decoded datagram: command/status line tokens plus lower-cased headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub command: Vec<String>,
    pub headers: HashMap<String, String>,
}

impl RawMessage {
    /// Header lookup, case-insensitive on the name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `M-SEARCH * ...`
    pub fn is_search_request(&self) -> bool {
        self.command.first().map(String::as_str) == Some("M-SEARCH")
            && self.command.get(1).map(String::as_str) == Some("*")
    }

    /// `HTTP/1.x 200 ...`
    pub fn is_ok_response(&self) -> bool {
        self.command
            .first()
            .is_some_and(|proto| proto.starts_with("HTTP/1."))
            && self.command.get(1).map(String::as_str) == Some("200")
    }

    /// True when the ST header mentions `uuid`
    pub fn targets(&self, uuid: &str) -> bool {
        self.header("st").is_some_and(|st| st.contains(uuid))
    }
}

/// Decode a datagram into command tokens and a header map.
pub fn decode(data: &[u8]) -> Result<RawMessage, CodecError> {
    let text = std::str::from_utf8(data).map_err(|_| CodecError::NotUtf8)?;

    // Responses may or may not carry a body; only the header block matters.
    let header_block = match (text.find("\r\n\r\n"), text.find("\n\n")) {
        (Some(a), Some(b)) => &text[..a.min(b)],
        (Some(a), None) => &text[..a],
        (None, Some(b)) => &text[..b],
        (None, None) => text,
    };

    let mut lines = header_block.lines();
    let command: Vec<String> = lines
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if command.is_empty() {
        return Err(CodecError::EmptyCommand);
    }

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let line = line.replacen(": ", ":", 1);
            line.split_once(':')
                .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
        })
        .collect();

    Ok(RawMessage { command, headers })
}

/// `M-SEARCH` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub host: String,
    pub max_delay_secs: u32,
    /// Service UUID, without the `uuid:` prefix
    pub search_target: String,
}

impl SearchRequest {
    pub fn new(host: impl Into<String>, max_delay_secs: u32, service_uuid: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            max_delay_secs,
            search_target: service_uuid.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("M-SEARCH * HTTP/1.1");
        out.push_str(CRLF);
        push_header(&mut out, "HOST", &self.host);
        push_header(&mut out, "MAN", "\"ssdp:discover\"");
        push_header(&mut out, "MX", &self.max_delay_secs.to_string());
        push_header(&mut out, "ST", &format!("uuid:{}", self.search_target));
        out.push_str(CRLF);
        out.into_bytes()
    }

    /// Typed view of a decoded request. `None` unless the command is `M-SEARCH *`
    /// and both MX and ST are present and well formed.
    pub fn from_raw(raw: &RawMessage) -> Option<Self> {
        if !raw.is_search_request() {
            return None;
        }
        Some(Self {
            host: raw.header("host").unwrap_or_default().to_string(),
            max_delay_secs: raw.header("mx")?.trim().parse().ok()?,
            search_target: strip_uuid(raw.header("st")?),
        })
    }
}

/// `HTTP/1.1 200 OK` response to a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub usn: String,
    /// Advertised `address:port` of the service
    pub server: String,
    /// Seconds since the Unix epoch, as a decimal string
    pub last_seen: String,
    pub service: String,
    pub location: String,
    pub max_age_secs: u32,
    /// Service UUID, without the `uuid:` prefix
    pub search_target: String,
    pub date: String,
}

impl SearchResponse {
    /// Build a response stamped with the current time
    pub fn new(service_id: &str, server: &str, service_uuid: &str, location_host: &str) -> Self {
        Self::at(service_id, server, service_uuid, location_host, Utc::now())
    }

    pub fn at(
        service_id: &str,
        server: &str,
        service_uuid: &str,
        location_host: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            usn: format!("{}::upnp:rootdevice", service_uuid),
            server: server.to_string(),
            last_seen: format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros()),
            service: service_id.to_string(),
            location: format!("http://{}/{}/description-0.0.1.xml", location_host, service_uuid),
            max_age_secs: CACHE_MAX_AGE_SECS,
            search_target: service_uuid.to_string(),
            date: http_date(now),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("HTTP/1.1 200 OK");
        out.push_str(CRLF);
        push_header(&mut out, "USN", &self.usn);
        push_header(&mut out, "SERVER", &self.server);
        push_header(&mut out, "last-seen", &self.last_seen);
        push_header(&mut out, "EXT", "");
        push_header(&mut out, "SERVICE", &self.service);
        push_header(&mut out, "LOCATION", &self.location);
        push_header(&mut out, "CACHE-CONTROL", &format!("max-age={}", self.max_age_secs));
        push_header(&mut out, "ST", &format!("uuid:{}", self.search_target));
        push_header(&mut out, "DATE", &self.date);
        out.push_str(CRLF);
        out.into_bytes()
    }

    /// Typed view of a decoded response. Missing optional headers become empty
    /// strings; SERVER and ST are required.
    pub fn from_raw(raw: &RawMessage) -> Option<Self> {
        if !raw.is_ok_response() {
            return None;
        }
        let get = |name: &str| raw.header(name).unwrap_or_default().to_string();
        let max_age_secs = raw
            .header("cache-control")
            .and_then(|v| v.trim().strip_prefix("max-age="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Some(Self {
            usn: get("usn"),
            server: raw.header("server")?.to_string(),
            last_seen: get("last-seen"),
            service: get("service"),
            location: get("location"),
            max_age_secs,
            search_target: strip_uuid(raw.header("st")?),
            date: get("date"),
        })
    }
}

/// RFC 1123 date as used in HTTP headers
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn push_header(out: &mut String, name: &str, value: &str) {
    // Writing to a String cannot fail.
    let _ = write!(out, "{}: {}{}", name, value, CRLF);
}

fn strip_uuid(st: &str) -> String {
    st.strip_prefix("uuid:").unwrap_or(st).to_string()
}
