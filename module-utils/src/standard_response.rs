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

//! Standard responses for various conditions

use http::{header, method::Method, status::StatusCode};
use maud::{html, DOCTYPE};

use crate::pingora::{Error, ResponseHeader, Session};

/// Produces the text of a standard response page for the given status code.
pub fn response_text(status: StatusCode) -> String {
    let status_str = status.as_str();
    let reason = status.canonical_reason().unwrap_or("");
    html! {
        (DOCTYPE)
        html {
            head {
                title {
                    (status_str) " " (reason)
                }
            }

            body {
                center {
                    h1 {
                        (status_str) " " (reason)
                    }
                }
            }
        }
    }
    .into()
}

/// Responds with a standard error page for the given status code.
pub async fn error_response(session: &mut Session, status: StatusCode) -> Result<(), Box<Error>> {
    let text = response_text(status);

    let mut header = ResponseHeader::build(status, Some(2))?;
    header.append_header(header::CONTENT_LENGTH, text.len().to_string())?;
    header.append_header(header::CONTENT_TYPE, "text/html; charset=utf-8")?;
    session.write_response_header(Box::new(header)).await?;

    if session.req_header().method != Method::HEAD {
        session.write_response_body(text.into()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pingora::{create_test_session, RequestHeader};
    use test_log::test;

    #[test]
    fn text_mentions_status() {
        let text = response_text(StatusCode::BAD_GATEWAY);
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<title>502 Bad Gateway</title>"));
    }

    #[test(tokio::test)]
    async fn error_page() {
        let header = RequestHeader::build("GET", b"/", None).unwrap();
        let mut session = create_test_session(header).await;
        error_response(&mut session, StatusCode::NOT_FOUND)
            .await
            .unwrap();

        let written = session.response_written().unwrap();
        assert_eq!(written.status, StatusCode::NOT_FOUND);
        assert_eq!(
            written.headers.get(header::CONTENT_LENGTH).unwrap(),
            &response_text(StatusCode::NOT_FOUND).len().to_string()
        );
    }
}
