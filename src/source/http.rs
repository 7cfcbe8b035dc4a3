//! [`MessageSource`] over a JSON HTTP gateway that fronts the chat service.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET chats/{chat}/messages?after={cursor}&limit={n}` returns a JSON array
//! - `GET chats/{chat}/messages/{id}` returns one message, 404 when gone
//! - `GET media/{reference}` streams the media bytes

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode, Url};

use super::{MediaDescriptor, MediaStream, Message, MessageSource, SourceError};
use crate::types::MessageId;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpSource {
    client: Client,
    base_url: Url,
    chat: String,
    token: Option<String>,
    /// Applies to metadata requests only; media transfers are bounded by the
    /// download orchestrator's own timeout.
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("base_url", &self.base_url.as_str())
            .field("chat", &self.chat)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpSource {
    pub fn new(
        base_url: &str,
        chat: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SourceError::Malformed(format!("invalid base URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Malformed(format!(
                "base URL {base_url} cannot carry a path"
            )));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(SourceError::from_reqwest)?;
        Ok(Self {
            client,
            base_url,
            chat: chat.to_string(),
            token,
            request_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let builder = self.client.get(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl MessageSource for HttpSource {
    async fn fetch_messages_after(
        &self,
        cursor: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        let url = self.endpoint(&["chats", &self.chat, "messages"]);
        tracing::debug!(cursor, limit, "Fetching message batch");
        let response = self
            .get(url)
            .query(&[("after", cursor.to_string()), ("limit", limit.to_string())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP {} fetching messages after {}",
                status.as_u16(),
                cursor
            )));
        }

        let mut messages: Vec<Message> = response.json().await.map_err(|e| {
            if e.is_decode() {
                SourceError::Malformed(e.to_string())
            } else {
                SourceError::from_reqwest(e)
            }
        })?;

        // The traversal relies on ascending ids strictly after the cursor.
        messages.retain(|m| m.id > cursor);
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        Ok(messages)
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, SourceError> {
        let id_str = id.to_string();
        let url = self.endpoint(&["chats", &self.chat, "messages", &id_str]);
        let response = self
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(None),
            status if status.is_success() => {
                let message: Message = response.json().await.map_err(|e| {
                    if e.is_decode() {
                        SourceError::Malformed(e.to_string())
                    } else {
                        SourceError::from_reqwest(e)
                    }
                })?;
                Ok(Some(message))
            }
            status => Err(SourceError::Unavailable(format!(
                "HTTP {} fetching message {}",
                status.as_u16(),
                id
            ))),
        }
    }

    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<MediaStream, SourceError> {
        let url = self.endpoint(&["media", &media.remote_reference]);
        let response = self
            .get(url)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_media_status(status, &media.remote_reference));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(SourceError::from_reqwest))
            .boxed())
    }
}

fn classify_media_status(status: StatusCode, reference: &str) -> SourceError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            SourceError::StaleReference(reference.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => {
            SourceError::Unavailable(format!("rate limited fetching {reference}"))
        }
        s if s.is_server_error() => {
            SourceError::Unavailable(format!("HTTP {} fetching {}", s.as_u16(), reference))
        }
        s => SourceError::Rejected {
            status: s.as_u16(),
            reason: s.canonical_reason().unwrap_or("unknown").to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer, token: Option<&str>) -> HttpSource {
        HttpSource::new(
            &server.uri(),
            "mychannel",
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn media(reference: &str) -> MediaDescriptor {
        MediaDescriptor {
            kind: MediaKind::Photo,
            remote_reference: reference.to_string(),
            file_name: None,
            mime_type: None,
            format: None,
            byte_size: 0,
        }
    }

    #[test]
    fn test_classify_media_status() {
        assert!(matches!(
            classify_media_status(StatusCode::GONE, "r"),
            SourceError::StaleReference(_)
        ));
        assert!(matches!(
            classify_media_status(StatusCode::NOT_FOUND, "r"),
            SourceError::StaleReference(_)
        ));
        assert!(matches!(
            classify_media_status(StatusCode::TOO_MANY_REQUESTS, "r"),
            SourceError::Unavailable(_)
        ));
        assert!(matches!(
            classify_media_status(StatusCode::BAD_GATEWAY, "r"),
            SourceError::Unavailable(_)
        ));
        assert!(matches!(
            classify_media_status(StatusCode::FORBIDDEN, "r"),
            SourceError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpSource::new("not a url", "c", None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let src = HttpSource::new(
            "http://gateway.local/api/",
            "my chat",
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        let url = src.endpoint(&["media", "a/b"]);
        assert_eq!(url.as_str(), "http://gateway.local/api/media/a%2Fb");
    }

    #[tokio::test]
    async fn test_fetch_messages_after_sorts_and_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/mychannel/messages"))
            .and(query_param("after", "3"))
            .and(query_param("limit", "100"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 5, "date": "2024-01-01T00:00:05Z"},
                {"id": 3, "date": "2024-01-01T00:00:03Z"},
                {"id": 4, "date": "2024-01-01T00:00:04Z", "text": "hi"}
            ])))
            .mount(&server)
            .await;

        let messages = source(&server, Some("secret"))
            .fetch_messages_after(3, 100)
            .await
            .unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(messages[0].text, "hi");
    }

    #[tokio::test]
    async fn test_fetch_messages_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/mychannel/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source(&server, None)
            .fetch_messages_after(0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_messages_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/mychannel/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let err = source(&server, None)
            .fetch_messages_after(0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_fetch_message_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/mychannel/messages/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let found = source(&server, None).fetch_message(9).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_fetch_message_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/mychannel/messages/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 9,
                "date": "2024-01-01T00:00:09Z",
                "media": {"kind": "photo", "remote_reference": "fresh"}
            })))
            .mount(&server)
            .await;

        let found = source(&server, None).fetch_message(9).await.unwrap().unwrap();
        assert_eq!(found.media.unwrap().remote_reference, "fresh");
    }

    #[tokio::test]
    async fn test_fetch_media_streams_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/ref1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg bytes".to_vec()))
            .mount(&server)
            .await;

        let mut stream = source(&server, None).fetch_media(&media("ref1")).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend(chunk.unwrap());
        }
        assert_eq!(body, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_fetch_media_expired_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/old"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let err = match source(&server, None).fetch_media(&media("old")).await {
            Err(e) => e,
            Ok(_) => panic!("expected stale reference"),
        };
        assert!(matches!(err, SourceError::StaleReference(_)));
    }
}
