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

//! Writing files to Pingora session.

use bytes::BytesMut;
use http::status::StatusCode;
use log::error;
use module_utils::pingora::{Error, ErrorType, Session};
use std::cmp::min;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

fn internal_error() -> Box<Error> {
    Error::new(ErrorType::HTTPStatus(
        StatusCode::INTERNAL_SERVER_ERROR.into(),
    ))
}

/// Reads a file into memory, for documents that need to be processed before sending.
pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>, Box<Error>> {
    std::fs::read(path).map_err(|err| {
        error!("failed reading file {path:?}: {err}");
        internal_error()
    })
}

/// Writes `size` bytes of a file as the Pingora session response body.
pub(crate) async fn file_response(
    session: &mut Session,
    path: &Path,
    size: u64,
) -> Result<(), Box<Error>> {
    let mut file = File::open(path).map_err(|err| {
        error!("failed opening file {path:?}: {err}");
        internal_error()
    })?;

    let mut remaining = size;
    while remaining > 0 {
        let chunk = usize::try_from(remaining).map_or(BUFFER_SIZE, |len| min(len, BUFFER_SIZE));
        let mut buf = BytesMut::zeroed(chunk);
        let len = file.read(buf.as_mut()).map_err(|err| {
            error!("failed reading data from {path:?}: {err}");
            internal_error()
        })?;

        if len == 0 {
            error!("file ended with {remaining} bytes left to be written");
            return Err(Error::new(ErrorType::ReadError));
        }

        buf.truncate(len);
        session.write_response_body(buf.freeze()).await?;
        remaining -= len as u64;
    }

    Ok(())
}
