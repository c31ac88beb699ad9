// src/http.rs
use std::collections::HashMap;

/// Extensionless routes that are served from `<route>.html`.
pub const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// One parsed request. Header keys are case-sensitive; a repeated header
/// keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub form: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.form.clear();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Value of a url-encoded form field, empty if absent.
    pub fn form_value(&self, key: &str) -> &str {
        self.form.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    /// HTTP/1.1 stays open unless told to close; HTTP/1.0 only stays open
    /// when asked to. Anything else is closed after the response.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.header("Connection");
        match self.version.as_str() {
            "1.1" => connection != Some("close"),
            "1.0" => connection == Some("keep-alive"),
            _ => false,
        }
    }

    /// `Content-Length` looked up case-insensitively.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }
}

/// `/` becomes `/index.html`, known extensionless pages gain `.html`.
pub fn normalize_path(path: &mut String) {
    if path == "/" {
        path.push_str("index.html");
    } else if DEFAULT_HTML.contains(&path.as_str()) {
        path.push_str(".html");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: &str, connection: Option<&str>) -> Request {
        let mut req = Request::new();
        req.method = "GET".into();
        req.version = version.into();
        if let Some(value) = connection {
            req.headers.insert("Connection".into(), value.into());
        }
        req
    }

    #[test]
    fn test_keep_alive_rules() {
        assert!(request("1.1", None).is_keep_alive());
        assert!(request("1.1", Some("keep-alive")).is_keep_alive());
        assert!(!request("1.1", Some("close")).is_keep_alive());

        assert!(!request("1.0", None).is_keep_alive());
        assert!(request("1.0", Some("keep-alive")).is_keep_alive());

        assert!(!request("2", None).is_keep_alive());
        assert!(!request("", Some("keep-alive")).is_keep_alive());
    }

    #[test]
    fn test_normalize_path() {
        let cases = [
            ("/", "/index.html"),
            ("/login", "/login.html"),
            ("/picture", "/picture.html"),
            ("/login.html", "/login.html"),
            ("/images/cat.png", "/images/cat.png"),
            ("/unknown", "/unknown"),
        ];
        for (input, expected) in cases {
            let mut path = input.to_string();
            normalize_path(&mut path);
            assert_eq!(path, expected);
        }
    }

    #[test]
    fn test_content_length_any_case() {
        let mut req = Request::new();
        req.headers.insert("content-length".into(), " 12".into());
        assert_eq!(req.content_length(), Some(12));
    }
}
