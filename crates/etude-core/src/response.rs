// src/response.rs
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::mmap::MappedFile;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

pub fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        500 => Some("Internal Server Error"),
        _ => None,
    }
}

/// Canned page served for an error status, relative to the document root.
pub fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        500 => Some("/500.html"),
        _ => None,
    }
}

/// Renders the status line and headers into the write buffer and holds the
/// memory-mapped body that is sent alongside it.
#[derive(Debug, Default)]
pub struct Response {
    code: Option<u16>,
    keep_alive: bool,
    path: String,
    doc_root: PathBuf,
    file: Option<MappedFile>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new response. Any mapping held from the previous one is
    /// released first. A `code` other than 200 is served as-is; otherwise the
    /// status is derived from the target file.
    pub fn init(&mut self, doc_root: &Path, path: &str, keep_alive: bool, code: Option<u16>) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path.clear();
        self.path.push_str(path);
        if self.doc_root != doc_root {
            self.doc_root = doc_root.to_path_buf();
        }
    }

    pub fn make_response(&mut self, buf: &mut ByteBuffer) {
        let mut code = match self.code {
            Some(code) if code != 200 => code,
            _ => self.stat_target(),
        };
        if reason_phrase(code).is_none() {
            code = 400;
        }

        if code == 200 {
            match self.map(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    warn!(path = %self.path, error = %e, "failed to map file");
                    code = 500;
                }
            }
        }
        if code != 200 {
            if let Some(page) = error_page(code) {
                self.path.clear();
                self.path.push_str(page);
                self.file = self.map(page).ok();
            }
        }
        self.code = Some(code);

        self.add_state_line(buf, code);
        self.add_headers(buf);
        self.add_content(buf, code);
        debug!(code, path = %self.path, bytes = self.file_len(), "response ready");
    }

    pub fn code(&self) -> u16 {
        self.code.unwrap_or(200)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The mapped body, empty when nothing is mapped.
    pub fn file(&self) -> &[u8] {
        self.file.as_ref().map(MappedFile::as_slice).unwrap_or(&[])
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, MappedFile::len)
    }

    /// Release the current mapping, if any.
    pub fn unmap_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            file.release();
        }
    }

    /// Inline an HTML error body when there is no file to map.
    pub fn error_content(&self, buf: &mut ByteBuffer, message: &str) {
        let code = self.code();
        let reason = reason_phrase(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {reason}\n\
             <p>{message}</p><hr><em>etude</em></body></html>"
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    fn add_state_line(&self, buf: &mut ByteBuffer, code: u16) {
        let reason = reason_phrase(code).unwrap_or("Bad Request");
        buf.append_str(&format!("HTTP/1.1 {code} {reason}\r\n"));
    }

    fn add_headers(&self, buf: &mut ByteBuffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", self.content_type()));
    }

    fn add_content(&self, buf: &mut ByteBuffer, code: u16) {
        match &self.file {
            Some(file) => {
                buf.append_str(&format!("Content-length: {}\r\n\r\n", file.len()));
            }
            None => {
                let message = if code == 500 {
                    "Internal Server Error!"
                } else {
                    "File NotFound!"
                };
                self.error_content(buf, message);
            }
        }
    }

    fn content_type(&self) -> &'static str {
        mime_guess::from_path(&self.path)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Join a request path onto the document root. `None` if the path tries
    /// to leave the root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.doc_root.join(relative))
    }

    fn stat_target(&self) -> u16 {
        let Some(full) = self.resolve(&self.path) else {
            return 403;
        };
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => 403,
            Ok(meta) if meta.permissions().mode() & libc::S_IROTH as u32 == 0 => 403,
            Ok(_) => 200,
            Err(e) => match e.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => 404,
                Some(libc::EACCES) => 403,
                _ => {
                    warn!(path = %full.display(), error = %e, "stat failed");
                    500
                }
            },
        }
    }

    fn map(&self, path: &str) -> io::Result<MappedFile> {
        let full = self
            .resolve(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::PermissionDenied))?;
        MappedFile::open(&full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::os::unix::net::UnixListener;

    fn write_file(dir: &Path, name: &str, body: &[u8], mode: u32) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
    }

    fn doc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "index.html", b"<h1>home</h1>", 0o644);
        write_file(dir.path(), "404.html", b"<h1>missing</h1>", 0o644);
        write_file(dir.path(), "403.html", b"<h1>forbidden</h1>", 0o644);
        write_file(dir.path(), "400.html", b"<h1>bad</h1>", 0o644);
        write_file(dir.path(), "notes", b"plain", 0o644);
        write_file(dir.path(), "secret.html", b"hidden", 0o600);
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    fn render(root: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> (Response, String) {
        let mut resp = Response::new();
        let mut buf = ByteBuffer::new();
        resp.init(root, path, keep_alive, code);
        resp.make_response(&mut buf);
        let head = buf.retrieve_all_to_string();
        (resp, head)
    }

    #[test]
    fn test_ok_maps_file() {
        let root = doc_root();
        let (resp, head) = render(root.path(), "/index.html", true, Some(200));
        assert_eq!(resp.code(), 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.ends_with("Content-length: 13\r\n\r\n"));
        assert_eq!(resp.file(), b"<h1>home</h1>");
    }

    #[test]
    fn test_missing_file_serves_404_page() {
        let root = doc_root();
        let (resp, head) = render(root.path(), "/nope.html", true, None);
        assert_eq!(resp.code(), 404);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(resp.file(), b"<h1>missing</h1>");
    }

    #[test]
    fn test_forbidden_targets() {
        let root = doc_root();
        for path in ["/sub", "/secret.html", "/../etc/passwd"] {
            let (resp, head) = render(root.path(), path, false, None);
            assert_eq!(resp.code(), 403, "{path}");
            assert!(head.contains("Connection: close\r\n"));
            assert_eq!(resp.file(), b"<h1>forbidden</h1>");
        }
    }

    #[test]
    fn test_unmappable_target_serves_500() {
        let root = doc_root();
        // stats as a readable non-directory, but open(2) fails with ENXIO
        let sock = root.path().join("live.sock");
        let _listener = UnixListener::bind(&sock).unwrap();
        fs::set_permissions(&sock, Permissions::from_mode(0o644)).unwrap();

        let (resp, head) = render(root.path(), "/live.sock", true, Some(200));
        assert_eq!(resp.code(), 500);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("<p>Internal Server Error!</p>"));
        assert_eq!(resp.file_len(), 0);

        write_file(root.path(), "500.html", b"<h1>oops</h1>", 0o644);
        let (resp, head) = render(root.path(), "/live.sock", false, None);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert_eq!(resp.path(), "/500.html");
        assert_eq!(resp.file(), b"<h1>oops</h1>");
    }

    #[test]
    fn test_caller_code_is_honoured() {
        let root = doc_root();
        let (resp, head) = render(root.path(), "/index.html", false, Some(400));
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.file(), b"<h1>bad</h1>");
    }

    #[test]
    fn test_unknown_code_becomes_400() {
        let root = doc_root();
        let (resp, _) = render(root.path(), "/index.html", false, Some(418));
        assert_eq!(resp.code(), 400);
    }

    #[test]
    fn test_inline_body_when_error_page_missing() {
        let root = tempfile::tempdir().unwrap();
        let (resp, head) = render(root.path(), "/gone.html", true, None);
        assert_eq!(resp.code(), 404);
        assert_eq!(resp.file_len(), 0);
        assert!(head.contains("<p>File NotFound!</p>"));

        let body_at = head.find("\r\n\r\n").unwrap() + 4;
        let declared: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, head.len() - body_at);
    }

    #[test]
    fn test_default_content_type() {
        let root = doc_root();
        let (_, head) = render(root.path(), "/notes", true, None);
        assert!(head.contains("Content-type: text/plain\r\n"));
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let root = doc_root();
        let (mut resp, _) = render(root.path(), "/index.html", true, None);
        assert_eq!(resp.file_len(), 13);
        resp.unmap_file();
        assert_eq!(resp.file_len(), 0);
        resp.unmap_file();
    }
}
