// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File metadata handling and ETag calculation

use http::{header, status::StatusCode};
use httpdate::fmt_http_date;
use mime_guess::MimeGuess;
use module_utils::pingora::ResponseHeader;
use std::io::Error;
use std::path::Path;
use std::time::SystemTime;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Helper wrapping file metadata information
#[derive(Debug)]
pub struct Metadata {
    /// Guessed MIME types (if any) for the file
    pub mime: MimeGuess,
    /// File size in bytes
    pub size: u64,
    /// `true` if the path points to a directory
    pub is_dir: bool,
    /// Last modified time of the file in the format `Fri, 15 May 2015 15:34:21 GMT` if the time
    /// can be retrieved
    pub modified: Option<String>,
    /// ETag for the file, encoding last modified time and file size. This is an empty string if
    /// the file’s modification time isn’t meaningful.
    pub etag: String,
}

impl Metadata {
    /// Collects the metadata for a file or directory.
    ///
    /// This method will return any errors produced by [`std::fs::metadata()`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let meta = path.metadata()?;

        let mime = mime_guess::from_path(path);
        let size = meta.len();
        let modified = meta.modified().ok();
        let etag = modified
            .map(|modified| calculate_etag(unix_seconds(modified), size))
            .unwrap_or_default();

        Ok(Self {
            mime,
            size,
            is_dir: meta.is_dir(),
            modified: modified.map(fmt_http_date),
            etag,
        })
    }

    /// Produces a `200 OK` response header for a body of given length and adds headers according
    /// to file metadata.
    pub(crate) fn to_response_header(
        &self,
        content_length: usize,
        content_type: Option<&str>,
    ) -> Result<Box<ResponseHeader>, Box<module_utils::pingora::Error>> {
        let mut header = ResponseHeader::build(StatusCode::OK, Some(6))?;
        header.append_header(header::CONTENT_LENGTH, content_length.to_string())?;
        header.append_header(
            header::CONTENT_TYPE,
            content_type.unwrap_or(self.mime.first_or_octet_stream().as_ref()),
        )?;
        if let Some(modified) = &self.modified {
            header.append_header(header::LAST_MODIFIED, modified)?;
        }
        if !self.etag.is_empty() {
            header.append_header(header::ETAG, &self.etag)?;
        }
        Ok(Box::new(header))
    }
}

/// Converts a point in time into seconds since Unix epoch, negative for times before the epoch.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
        Err(err) => i64::try_from(err.duration().as_secs()).map_or(i64::MIN, |secs| -secs),
    }
}

fn to_base36(value: i64) -> String {
    let mut remaining = value.unsigned_abs();
    let mut digits = Vec::new();
    loop {
        digits.push(BASE36_DIGITS[(remaining % 36) as usize]);
        remaining /= 36;
        if remaining == 0 {
            break;
        }
    }
    if value < 0 {
        digits.push(b'-');
    }
    digits.iter().rev().map(|&digit| char::from(digit)).collect()
}

/// Calculates a strong ETag from modification time (seconds since Unix epoch) and file size.
///
/// This doesn’t look at file contents: two files with identical size and modification time get
/// the same ETag. Modification times of 0 and 1 are placeholders used by some tools rather than
/// actual times, an empty string is returned for these.
pub fn calculate_etag(mtime: i64, size: u64) -> String {
    if mtime == 0 || mtime == 1 {
        return String::new();
    }
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    format!("\"{}{}\"", to_base36(mtime), to_base36(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1700000000), "s44we8");
        assert_eq!(to_base36(-36), "-10");
    }

    #[test]
    fn etag_format() {
        assert_eq!(calculate_etag(1700000000, 2048), "\"s44we81kw\"");
        assert_eq!(calculate_etag(1234567890, 4), "\"kf12oi4\"");
        assert_eq!(calculate_etag(-36, 0), "\"-100\"");
    }

    #[test]
    fn etag_placeholder_times() {
        assert_eq!(calculate_etag(0, 2048), "");
        assert_eq!(calculate_etag(1, 2048), "");
        assert_ne!(calculate_etag(2, 2048), "");
    }

    #[test]
    fn etag_changes_with_inputs() {
        let etag = calculate_etag(1700000000, 2048);
        assert_eq!(etag, calculate_etag(1700000000, 2048));
        assert_ne!(etag, calculate_etag(1700000001, 2048));
        assert_ne!(etag, calculate_etag(1700000000, 2049));
    }

    #[test]
    fn unix_seconds_before_epoch() {
        let time = SystemTime::UNIX_EPOCH - Duration::from_secs(100);
        assert_eq!(unix_seconds(time), -100);
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_500);
        assert_eq!(unix_seconds(time), 1700000000);
    }

    #[test]
    fn identical_files_share_etag() {
        let dir = TempDir::new().unwrap();
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1700000000);
        for (name, contents) in [("a.txt", b"first"), ("b.txt", b"other")] {
            let mut file = File::create(dir.path().join(name)).unwrap();
            file.write_all(contents).unwrap();
            file.set_modified(time).unwrap();
        }

        let first = Metadata::from_path(dir.path().join("a.txt")).unwrap();
        let second = Metadata::from_path(dir.path().join("b.txt")).unwrap();
        assert_eq!(first.size, 5);
        assert!(!first.is_dir);
        assert_eq!(first.etag, calculate_etag(1700000000, 5));
        assert_eq!(first.etag, second.etag);
        assert_eq!(
            first.modified.as_deref(),
            Some("Tue, 14 Nov 2023 22:13:20 GMT")
        );

        let meta = Metadata::from_path(dir.path()).unwrap();
        assert!(meta.is_dir);
    }

    #[test]
    fn placeholder_mtime_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.txt");
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1))
            .unwrap();

        let meta = Metadata::from_path(&path).unwrap();
        assert_eq!(meta.etag, "");
    }
}
