//! gzip compression with mime/size admission policy.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

const MIN_COMPRESSIBLE_LEN: usize = 1024;

const DENY_LIST: &[&str] = &[
    "image/png",
    "image/gif",
    "image/svg+xml",
    "image/x-icon",
    "image/webp",
    "audio/mpeg",
    "video/mp4",
    "video/webm",
    "application/zip",
    "font/woff",
    "font/woff2",
    "font/ttf",
    "application/vnd.ms-fontobject",
];

const ALLOW_PREFIXES: &[&str] = &[
    "text/",
    "application/javascript",
    "application/json",
    "application/xml",
    "application/x-yaml",
    "application/x-www-form-urlencoded",
];

/// Returns true if `mime`/`len` are admissible for gzip compression.
pub fn should_compress(mime: &str, len: usize) -> bool {
    if DENY_LIST.contains(&mime) {
        return false;
    }
    if len < MIN_COMPRESSIBLE_LEN {
        return false;
    }
    ALLOW_PREFIXES.iter().any(|prefix| mime.starts_with(prefix))
}

/// Returns true if the request's `Accept-Encoding` header text indicates gzip support.
pub fn client_accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("gzip"))
}

/// gzip-compresses `data` at the default compression level.
///
/// Never fails the caller's response: an encoder error means "send the raw body instead", so
/// this returns `None` rather than propagating the error.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn admits_allow_listed_large_text() {
        assert!(should_compress("text/html", 2000));
        assert!(should_compress("application/json", 2000));
    }

    #[test]
    fn rejects_deny_listed_mime_regardless_of_size() {
        assert!(!should_compress("image/png", 100_000));
    }

    #[test]
    fn rejects_small_bodies() {
        assert!(!should_compress("text/plain", 100));
    }

    #[test]
    fn rejects_mime_outside_allow_list() {
        assert!(!should_compress("application/octet-stream", 2000));
    }

    #[test]
    fn compress_round_trips() {
        let input = vec![b'a'; 4096];
        let compressed = compress(&input).unwrap();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn detects_gzip_in_accept_encoding() {
        assert!(client_accepts_gzip("gzip, deflate, br"));
        assert!(!client_accepts_gzip("deflate, br"));
    }
}
