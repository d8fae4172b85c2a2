// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static-file serving

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use parser::h1::request::Request;
use parser::h1::response::Response;
use parser::Method;

const MAX_PATH: usize = 2048;

/// Whether a request path may touch the filesystem: rooted at `/`, bounded
/// length, no `..` traversal, no doubled slashes, and only URL-safe ASCII.
pub(crate) fn valid_path(path: &str) -> bool {
    if !path.starts_with('/') || path.len() > MAX_PATH {
        return false;
    }
    if path.contains("..") || path.contains("//") {
        return false;
    }
    path.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'/' | b'-' | b'_' | b'.' | b'~' | b'%' | b':' | b'=' | b'&' | b'?' | b'+'
            )
    })
}

/// Maps the request path under `basedir`, defaulting directories to their
/// `index.html`.
fn resolve(basedir: &Path, path: &str) -> PathBuf {
    let mut full = format!("{}{}", basedir.display(), path);
    if full.ends_with('/') {
        full.push_str("index.html");
    }
    PathBuf::from(full)
}

/// Whether this request should be answered from the filesystem: a GET or
/// HEAD whose validated path resolves to an existing file or directory
/// under `basedir`. Dynamic routes run only when this says no.
pub(crate) fn is_static_request(basedir: &Option<PathBuf>, req: &Request) -> bool {
    let Some(basedir) = basedir else { return false };
    if req.method != Method::Get && req.method != Method::Head {
        return false;
    }
    if !valid_path(&req.path) {
        return false;
    }
    let full = resolve(basedir, &req.path);
    full.is_file() || full.is_dir()
}

/// Reads the resolved file into the response body and types it by
/// extension.
pub(crate) fn serve(basedir: &Path, req: &Request, resp: &mut Response) {
    let full = resolve(basedir, &req.path);
    match fs::read(&full) {
        Ok(bytes) => {
            resp.body = bytes;
            let mime = mime_guess::from_path(&full)
                .first_raw()
                .unwrap_or("application/octet-stream");
            resp.set_header("Content-Type", mime);
        }
        Err(err) => {
            debug!("static read {} failed: {err}", full.display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::valid_path;

    #[test]
    fn valid_path_accepts_ordinary_urls() {
        assert!(valid_path("/"));
        assert!(valid_path("/index.html"));
        assert!(valid_path("/a/b-c_d~e/f.png"));
        assert!(valid_path("/q?x=1&y=2"));
    }

    #[test]
    fn valid_path_requires_leading_slash() {
        assert!(!valid_path(""));
        assert!(!valid_path("index.html"));
    }

    #[test]
    fn valid_path_rejects_traversal_and_doubled_slashes() {
        assert!(!valid_path("/../etc/passwd"));
        assert!(!valid_path("/a/../b"));
        assert!(!valid_path("//etc"));
    }

    #[test]
    fn valid_path_rejects_control_and_unlisted_bytes() {
        assert!(!valid_path("/a\u{7f}b"));
        assert!(!valid_path("/a b"));
        assert!(!valid_path("/a\"b"));
    }

    #[test]
    fn valid_path_rejects_oversize_paths() {
        let long = format!("/{}", "a".repeat(3000));
        assert!(!valid_path(&long));
    }
}
