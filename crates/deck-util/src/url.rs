use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("connection string is empty")]
    Empty,
    #[error("invalid schema {0:?}")]
    InvalidSchema(String),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("invalid port {0:?} (expected 0..65535)")]
    InvalidPort(String),
}

pub fn default_port_for(schema: &str) -> Option<u16> {
    match schema {
        "ws" | "http" => Some(80),
        "wss" | "https" => Some(443),
        "vnc" => Some(5900),
        _ => None,
    }
}

pub fn is_secure_schema(schema: &str) -> bool {
    matches!(schema, "wss" | "https")
}

/// Normalized `schema://host[:port]/path`. The accessors are views into the
/// owned string, and every setter recomposes it.
#[derive(Clone, PartialEq, Eq)]
pub struct Url {
    connection_string: String,
    default_schema: String,
    schema: Range<usize>,
    host: Range<usize>,
    path: Range<usize>,
    port: u16,
}

impl Url {
    pub fn new(default_schema: &str) -> Self {
        let mut url = Url {
            connection_string: String::new(),
            default_schema: default_schema.to_ascii_lowercase(),
            schema: 0..0,
            host: 0..0,
            path: 0..0,
            port: 0,
        };
        let schema = url.default_schema.clone();
        url.compose(&schema, "", 0, "/");
        url
    }

    pub fn parse(s: &str, default_schema: &str) -> Result<Self, UrlError> {
        let mut url = Url::new(default_schema);
        url.set_connection_string(s)?;
        Ok(url)
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn schema(&self) -> &str {
        &self.connection_string[self.schema.clone()]
    }

    pub fn host(&self) -> &str {
        &self.connection_string[self.host.clone()]
    }

    pub fn path(&self) -> &str {
        &self.connection_string[self.path.clone()]
    }

    /// Explicit port, else the schema default, else 0.
    pub fn port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        default_port_for(self.schema()).unwrap_or(0)
    }

    pub fn is_secure(&self) -> bool {
        is_secure_schema(self.schema())
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn set_connection_string(&mut self, s: &str) -> Result<(), UrlError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UrlError::Empty);
        }

        let (schema, rest) = match s.find("://") {
            Some(idx) => (s[..idx].to_ascii_lowercase(), &s[idx + 3..]),
            None => (self.default_schema.clone(), s),
        };
        validate_schema(&schema)?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority)?;
        if host.is_empty() {
            return Err(UrlError::InvalidHost(String::new()));
        }
        validate_host(host)?;

        let path = normalize_path(path);
        self.compose(&schema, host, port, &path);
        Ok(())
    }

    pub fn set_schema(&mut self, schema: &str) -> Result<(), UrlError> {
        let schema = schema.trim().to_ascii_lowercase();
        validate_schema(&schema)?;
        let (host, path, port) = (self.host().to_string(), self.path().to_string(), self.port);
        self.compose(&schema, &host, port, &path);
        Ok(())
    }

    pub fn set_host(&mut self, host: &str) -> Result<(), UrlError> {
        let host = host.trim();
        validate_host(host)?;
        let (schema, path, port) = (self.schema().to_string(), self.path().to_string(), self.port);
        self.compose(&schema, host, port, &path);
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) {
        let (schema, host, path) = (
            self.schema().to_string(),
            self.host().to_string(),
            self.path().to_string(),
        );
        self.compose(&schema, &host, port, &path);
    }

    pub fn set_path(&mut self, path: &str) {
        let (schema, host, port) = (self.schema().to_string(), self.host().to_string(), self.port);
        self.compose(&schema, &host, port, &normalize_path(path));
    }

    fn compose(&mut self, schema: &str, host: &str, port: u16, path: &str) {
        let port = if port == 0 {
            default_port_for(schema).unwrap_or(0)
        } else {
            port
        };

        let mut out = String::with_capacity(schema.len() + host.len() + path.len() + 10);
        out.push_str(schema);
        self.schema = 0..out.len();
        out.push_str("://");
        let host_start = out.len();
        out.push_str(host);
        self.host = host_start..out.len();
        if port != 0 {
            out.push(':');
            out.push_str(&port.to_string());
        }
        let path_start = out.len();
        out.push_str(path);
        self.path = path_start..out.len();

        self.port = port;
        self.connection_string = out;
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connection_string)
    }
}

impl fmt::Debug for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Url({:?})", self.connection_string)
    }
}

fn validate_schema(schema: &str) -> Result<(), UrlError> {
    if schema.is_empty() || schema.contains([':', '/']) {
        return Err(UrlError::InvalidSchema(schema.to_string()));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), UrlError> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let bad = if bare.len() == host.len() {
        host.contains([':', '/'])
    } else {
        bare.contains('/')
    };
    if bad || host.contains(char::is_whitespace) {
        return Err(UrlError::InvalidHost(host.to_string()));
    }
    Ok(())
}

fn split_authority(authority: &str) -> Result<(&str, u16), UrlError> {
    let port_sep = if authority.starts_with('[') {
        authority
            .find(']')
            .and_then(|end| authority[end..].find(':').map(|i| end + i))
    } else {
        authority.rfind(':')
    };
    let Some(idx) = port_sep else {
        return Ok((authority, 0));
    };
    let raw = &authority[idx + 1..];
    if raw.is_empty() {
        return Ok((&authority[..idx], 0));
    }
    let port = raw
        .parse::<u16>()
        .map_err(|_| UrlError::InvalidPort(raw.to_string()))?;
    Ok((&authority[..idx], port))
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_connection_string_is_preserved() {
        let url = Url::parse("ws://127.0.0.1:9/", "ws").unwrap();
        assert_eq!(url.connection_string(), "ws://127.0.0.1:9/");
        assert_eq!(url.schema(), "ws");
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 9);
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn missing_parts_are_normalized() {
        let url = Url::parse("example.com", "https").unwrap();
        assert_eq!(url.connection_string(), "https://example.com:443/");

        let url = Url::parse("localhost/api/v1", "ws").unwrap();
        assert_eq!(url.connection_string(), "ws://localhost:80/api/v1");
        assert!(!url.is_secure());
    }

    #[test]
    fn normalization_is_idempotent() {
        for s in [
            "example.com",
            "wss://host.example/chat",
            "http://10.0.0.1:8080/x/y?z=1",
            "custom://h:1234",
            "[::1]:9000/p",
        ] {
            let once = Url::parse(s, "ws").unwrap();
            let twice = Url::parse(once.connection_string(), "ws").unwrap();
            assert_eq!(once, twice, "{s}");
        }
    }

    #[test]
    fn setters_recompose_the_string() {
        let mut url = Url::parse("ws://a:1/p", "ws").unwrap();
        url.set_host("b").unwrap();
        url.set_port(2);
        url.set_path("q");
        url.set_schema("WSS").unwrap();
        assert_eq!(url.connection_string(), "wss://b:2/q");
        assert_eq!(url.host(), "b");
        assert!(url.is_secure());
    }

    #[test]
    fn invalid_parts_are_rejected() {
        assert_eq!(Url::parse("", "ws"), Err(UrlError::Empty));
        assert!(matches!(
            Url::parse("ws://h:99999/", "ws"),
            Err(UrlError::InvalidPort(_))
        ));
        let mut url = Url::new("ws");
        assert!(url.set_host("a/b").is_err());
        assert!(url.set_schema("a:b").is_err());
        assert!(url.is_empty());
    }
}
