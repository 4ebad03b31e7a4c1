//! HTTP vocabulary shared by custom-scheme loaders: methods, headers,
//! status codes, and synthesized response heads.

use pd_core::BrowserError;
use pd_core::BrowserResult;

/// Request methods a custom-scheme request may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }
}

/// Single HTTP header with validated wire-safe name/value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: &str) -> BrowserResult<Self> {
        if !is_valid_header_name(name) {
            return Err(BrowserError::new(
                "net.http.header_name_invalid",
                format!("invalid HTTP header name `{name}`"),
            ));
        }

        if value.bytes().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
            return Err(BrowserError::new(
                "net.http.header_value_invalid",
                format!("invalid characters found in HTTP header `{name}`"),
            ));
        }

        Ok(Self {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Same header with its name lower-cased, as emitted in response heads.
    pub fn lowercased(&self) -> Self {
        Self {
            name: self.name.to_ascii_lowercase(),
            value: self.value.clone(),
        }
    }
}

/// First value of a header, matched case-insensitively.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// Applies redirect header edits: removals first, then modifications.
///
/// A modified header replaces every existing header of the same name.
pub fn merge_headers(headers: &mut Vec<Header>, removed: &[String], modified: &[Header]) {
    headers.retain(|header| {
        !removed
            .iter()
            .any(|name| header.name.eq_ignore_ascii_case(name))
    });

    for header in modified {
        headers.retain(|existing| !existing.name.eq_ignore_ascii_case(&header.name));
    }
    headers.extend(modified.iter().cloned());
}

/// HTTP status code wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpStatusCode(u16);

impl HttpStatusCode {
    pub const OK: Self = Self(200);
    pub const PARTIAL_CONTENT: Self = Self(206);
    pub const SEE_OTHER: Self = Self(303);
    pub const BAD_REQUEST: Self = Self(400);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const RANGE_NOT_SATISFIABLE: Self = Self(416);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);

    pub fn new(code: u16) -> BrowserResult<Self> {
        if (100..=599).contains(&code) {
            return Ok(Self(code));
        }

        Err(BrowserError::new(
            "net.http.status_invalid",
            format!("status code must be 100-599, got `{code}`"),
        ))
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn reason_phrase(self) -> &'static str {
        match self.0 {
            200 => "OK",
            206 => "Partial Content",
            303 => "See Other",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            416 => "Range Not Satisfiable",
            500 => "Internal Server Error",
            _ => "",
        }
    }

    /// `HTTP/1.1 <code> <reason>`.
    pub fn status_line(self) -> String {
        let reason = self.reason_phrase();
        if reason.is_empty() {
            format!("HTTP/1.1 {}", self.0)
        } else {
            format!("HTTP/1.1 {} {reason}", self.0)
        }
    }
}

/// MIME type split out of a `Content-Type`-style value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentType {
    pub mime_type: String,
    pub charset: Option<String>,
    /// Parameter text after `;` that was not a charset.
    pub unrecognized: Vec<String>,
}

/// Splits `text/plain; charset=utf-8` into its MIME type and charset.
pub fn parse_content_type(value: &str) -> ContentType {
    let (mime, params) = match value.split_once(';') {
        Some((mime, params)) => (mime, Some(params)),
        None => (value, None),
    };

    let mut parsed = ContentType {
        mime_type: mime.trim().to_ascii_lowercase(),
        ..ContentType::default()
    };

    for param in params.into_iter().flat_map(|params| params.split(';')) {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }

        match param.split_once('=') {
            Some((name, charset))
                if name.trim().eq_ignore_ascii_case("charset") && parsed.charset.is_none() =>
            {
                let charset = charset.trim().trim_matches('"').trim();
                if charset.is_empty() {
                    parsed.unrecognized.push(param.to_owned());
                } else {
                    parsed.charset = Some(charset.to_ascii_lowercase());
                }
            }
            _ => parsed.unrecognized.push(param.to_owned()),
        }
    }

    parsed
}

/// Response head synthesized by a custom-scheme loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: HttpStatusCode,
    pub mime_type: String,
    pub charset: Option<String>,
    /// `None` when the body length is unknown.
    pub content_length: Option<u64>,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn new(status: HttpStatusCode) -> Self {
        Self {
            status,
            mime_type: String::new(),
            charset: None,
            content_length: None,
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn push_header(&mut self, name: &str, value: &str) -> BrowserResult<()> {
        self.headers.push(Header::new(name, value)?);
        Ok(())
    }

    /// Status line followed by one `name: value` line per header.
    pub fn raw_header_block(&self) -> String {
        let mut block = self.status.status_line();
        block.push_str("\r\n");
        for header in &self.headers {
            block.push_str(&header.name);
            block.push_str(": ");
            block.push_str(&header.value);
            block.push_str("\r\n");
        }
        block
    }
}

fn is_valid_header_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    name.bytes().all(is_token_char)
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
