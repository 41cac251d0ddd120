use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, stream};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::error::{
    BadResponseStatusSnafu, ChatResult, EventStreamSnafu, HttpSnafu, InvalidHeaderSnafu,
    RateLimitedSnafu, SchemaSnafu,
};
use crate::events::{StreamEvent, decode_event};
use crate::message::Message;
use crate::validate::validate_messages;

/// Boxed future returned by the object-safe traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Events of one streamed turn, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = ChatResult<StreamEvent>> + Send>>;

/// Body posted to the chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Full history, oldest first.
    pub messages: Vec<Message>,
    /// Ask for `text/event-stream` instead of a single JSON body.
    pub stream: bool,
    /// Let the backend run the selected function without asking first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autorun: Option<bool>,
    /// Name of the function the backend must select.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_select_function: Option<String>,
}

impl ChatRequest {
    /// Request without `autorun` or a forced function.
    pub fn new(messages: Vec<Message>, stream: bool) -> Self {
        Self {
            messages,
            stream,
            autorun: None,
            force_select_function: None,
        }
    }
}

/// Resolves a bearer token. Called once per request.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> BoxFuture<'_, ChatResult<String>>;
}

/// A token fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> BoxFuture<'_, ChatResult<String>> {
        let token = self.0.clone();
        Box::pin(async move { Ok(token) })
    }
}

impl<F, Fut> TokenSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ChatResult<String>> + Send + 'static,
{
    fn token(&self) -> BoxFuture<'_, ChatResult<String>> {
        Box::pin(self())
    }
}

/// Builds request headers; awaited before every request is issued.
pub trait HeaderSource: Send + Sync {
    fn headers(&self) -> BoxFuture<'_, ChatResult<HeaderMap>>;
}

/// `Content-Type: application/json` plus `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct BearerAuth {
    tokens: Arc<dyn TokenSource>,
}

impl BearerAuth {
    /// Asks `tokens` for a fresh token on every request.
    pub fn new(tokens: impl TokenSource + 'static) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    /// Sends the same token on every request.
    pub fn static_token(token: impl Into<String>) -> Self {
        Self::new(StaticToken::new(token))
    }
}

impl HeaderSource for BearerAuth {
    fn headers(&self) -> BoxFuture<'_, ChatResult<HeaderMap>> {
        Box::pin(async move {
            let token = self.tokens.token().await?;
            let mut headers = json_headers();
            let authorization =
                HeaderValue::from_str(&format!("Bearer {token}")).context(InvalidHeaderSnafu {
                    stage: "build-authorization-header",
                    name: AUTHORIZATION.as_str(),
                })?;
            headers.insert(AUTHORIZATION, authorization);
            Ok(headers)
        })
    }
}

/// JSON content type only, for unauthenticated endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl HeaderSource for NoAuth {
    fn headers(&self) -> BoxFuture<'_, ChatResult<HeaderMap>> {
        Box::pin(async { Ok(json_headers()) })
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Carries one turn to the backend.
///
/// [`HttpTransport`] is the production implementation; tests substitute
/// scripted ones.
pub trait ChatTransport: Send + Sync {
    /// Posts the request and yields `Open`, the decoded events, then `Close`.
    fn open_stream<'a>(&'a self, request: &'a ChatRequest)
    -> BoxFuture<'a, ChatResult<EventStream>>;

    /// Posts the request without streaming and returns the response messages.
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ChatResult<Vec<Message>>>;
}

impl<T> ChatTransport for Arc<T>
where
    T: ChatTransport + ?Sized,
{
    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, ChatResult<EventStream>> {
        (**self).open_stream(request)
    }

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        (**self).complete(request)
    }
}

/// `<base>/v1alpha/assistants/<assistant_id>/chat`
pub fn chat_endpoint(base_url: &str, assistant_id: &str) -> String {
    format!(
        "{}/v1alpha/assistants/{}/chat",
        base_url.trim_end_matches('/'),
        assistant_id
    )
}

/// Posts chat requests to one endpoint with `reqwest`.
///
/// Non-2xx responses fail before any event is yielded: 429 as
/// [`ChatError::RateLimited`](crate::ChatError::RateLimited), anything else as
/// [`ChatError::BadResponseStatus`](crate::ChatError::BadResponseStatus).
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    headers: Arc<dyn HeaderSource>,
}

impl HttpTransport {
    /// `endpoint` is the full chat URL, see [`chat_endpoint`].
    pub fn new(endpoint: impl Into<String>, headers: impl HeaderSource + 'static) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            headers: Arc::new(headers),
        }
    }

    /// Uses a preconfigured client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        request: &ChatRequest,
        accept: &'static str,
        stage: &'static str,
    ) -> ChatResult<reqwest::Response> {
        let headers = self.headers.headers().await?;
        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .header(ACCEPT, accept)
            .json(request)
            .send()
            .await
            .context(HttpSnafu { stage })?;

        check_status(response.status(), stage)?;
        Ok(response)
    }
}

pub(crate) fn check_status(status: StatusCode, stage: &'static str) -> ChatResult<()> {
    ensure!(
        status != StatusCode::TOO_MANY_REQUESTS,
        RateLimitedSnafu { stage }
    );
    ensure!(
        status.is_success(),
        BadResponseStatusSnafu {
            stage,
            status: status.as_u16(),
        }
    );
    Ok(())
}

impl ChatTransport for HttpTransport {
    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, ChatResult<EventStream>> {
        Box::pin(async move {
            let response = self
                .post(request, "text/event-stream", "open-stream")
                .await?;
            let status = response.status().as_u16();
            tracing::debug!(
                endpoint = %self.endpoint,
                status,
                message_count = request.messages.len(),
                "event stream opened"
            );

            let events = response
                .bytes_stream()
                .eventsource()
                .map(|item| match item {
                    Ok(event) => {
                        tracing::trace!(event = %event.event, data = %event.data, "sse event");
                        decode_event(&event.event, &event.data)
                    }
                    Err(error) => EventStreamSnafu {
                        stage: "read-event-stream",
                        message: error.to_string(),
                    }
                    .fail(),
                });

            let stream = stream::once(async move { Ok(StreamEvent::Open { status }) })
                .chain(events)
                .chain(stream::once(async { Ok(StreamEvent::Close) }));
            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
        Box::pin(async move {
            let response = self.post(request, "application/json", "complete").await?;
            let body: Value = response.json().await.context(HttpSnafu {
                stage: "read-completion-body",
            })?;
            let raw = body.get("messages").unwrap_or(&Value::Null);
            validate_messages(raw, "/messages").context(SchemaSnafu {
                stage: "validate-completion",
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;

    #[test]
    fn endpoint_joins_base_and_assistant() {
        assert_eq!(
            chat_endpoint("http://localhost:8000/", "hooli"),
            "http://localhost:8000/v1alpha/assistants/hooli/chat"
        );
    }

    #[test]
    fn status_mapping_distinguishes_rate_limits() {
        assert!(check_status(StatusCode::OK, "t").is_ok());
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS, "t"),
            Err(ChatError::RateLimited { .. })
        ));
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, "t"),
            Err(ChatError::BadResponseStatus { status: 401, .. })
        ));
    }

    #[test]
    fn request_omits_unset_options() {
        let mut request = ChatRequest::new(vec![Message::user_text("hi")], true);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"messages": [{"role": "user", "content": "hi"}], "stream": true})
        );

        request.autorun = Some(false);
        request.force_select_function = Some("lookup".to_string());
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["autorun"], false);
        assert_eq!(value["force_select_function"], "lookup");
    }

    #[tokio::test]
    async fn bearer_auth_resolves_token_per_call() {
        let auth = BearerAuth::new(|| async { Ok::<_, ChatError>("t0k3n".to_string()) });
        let headers = auth.headers().await.unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer t0k3n");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let headers = NoAuth.headers().await.unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }
}
