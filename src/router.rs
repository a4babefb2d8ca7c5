//! Request path extraction, mime resolution, index/404 handling, and asset classification.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::logger::Logger;

/// Fixed body for a `404 Not Found` when no `404.html` is present in the working directory.
pub const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";

static NOT_FOUND_HTML: OnceCell<Option<Vec<u8>>> = OnceCell::new();

/// Extracts the request path from a raw HTTP/1.1 request line, e.g. `GET /index.html HTTP/1.1`.
/// Defaults to `/` if either delimiter is absent.
pub fn extract_path(request: &str) -> &str {
    let after_get = match request.find("GET ") {
        Some(idx) => &request[idx + "GET ".len()..],
        None => return "/",
    };
    match after_get.find(" HTTP/") {
        Some(idx) => &after_get[..idx],
        None => "/",
    }
}

const HOT_DIRS: &[&str] = &["/img/", "/images/", "/css/", "/js/", "/assets/", "/static/"];
const COLD_DIRS: &[&str] = &["/fonts/", "/media/", "/photos/"];
const ASSET_EXTS: &[&str] = &[
    "jpg", "png", "gif", "jpeg", "webp", "css", "js", "ico", "svg", "woff2", "woff", "ttf",
    "mp4", "webm", "json", "xml", "eot", "map", "pdf", "mp3", "wav",
];

/// Classifies `path` as a static asset. Per spec.md §9, this is the *unconditional* union of
/// extensions and directory prefixes — the original's path-length shortcuts were a source-level
/// micro-optimization, not part of the contract, and are not reproduced here.
pub fn is_asset_request(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();

    if let Some(ext) = lower.rsplit('.').next() {
        if lower.contains('.') && ASSET_EXTS.contains(&ext) {
            return true;
        }
    }

    if HOT_DIRS.iter().any(|dir| lower.starts_with(dir)) {
        return true;
    }

    if COLD_DIRS.iter().any(|dir| lower.contains(dir)) {
        return true;
    }

    false
}

/// Resolves a lower-cased file extension to its mime type.
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "html" | "htm" => "text/html",
        "jpg" | "jpeg" => "image/jpeg",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "webp" => "image/webp",
        _ => "text/plain",
    }
}

/// The outcome of routing a request path.
pub enum Routed {
    /// A file was found; serve it with the given path, mime, and `is_index` flag (index/HTML
    /// requests are logged per-request; asset requests are not).
    File {
        /// Path resolved beneath the static root.
        file_path: PathBuf,
        /// Mime type resolved from the file's extension.
        mime: &'static str,
        /// True for `/`, `/index.html`, or any directory index resolution.
        is_index: bool,
    },
    /// No file exists at the resolved path; `body`/`content_type` carry the 404 response.
    NotFound {
        /// Response body: either the memoized `404.html` contents or the fixed plain-text body.
        body: Vec<u8>,
        /// `text/html` when `404.html` was found, `text/plain` otherwise.
        content_type: &'static str,
    },
}

/// Resolves `path` beneath `static_root`, per spec.md §4.7.
pub fn route(static_root: &Path, path: &str, is_asset: bool) -> Routed {
    let mut file_path = static_root.join(path.trim_start_matches('/'));

    let is_dir = file_path.is_dir();
    if is_dir {
        file_path.push("index.html");
    }
    let is_index = path == "/index.html" || path == "/" || is_dir;

    if !file_path.exists() {
        if !is_asset {
            Logger::global().warning(format!("File not found: {}", file_path.display()));
        }

        let memoized = NOT_FOUND_HTML.get_or_init(|| fs::read("404.html").ok());
        return match memoized {
            Some(html) => Routed::NotFound {
                body: html.clone(),
                content_type: "text/html",
            },
            None => Routed::NotFound {
                body: NOT_FOUND.to_vec(),
                content_type: "text/plain",
            },
        };
    }

    let ext = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let mime = mime_for_extension(&ext);

    Routed::File {
        file_path,
        mime,
        is_index,
    }
}
