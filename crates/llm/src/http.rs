use futures::StreamExt;
use serde::Serialize;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::BackendConfig;
use super::provider::{
    ChatBackend, EmptyPromptSnafu, HttpRequestSnafu, MissingEndpointSnafu, ProviderError,
    ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEmitter, StreamEventPayload,
    StreamRequest, make_event_stream,
};

pub const HTTP_PROVIDER_ID: &str = "http";
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://127.0.0.1:8000";
pub const DEFAULT_MAX_TOKENS: u64 = 1000;

/// In-band prefix the companion server writes when it has no model configured.
const UNAVAILABLE_PREFIX: &str = "Error: ";
/// In-band prefix the companion server writes when generation fails mid-way.
const GENERATION_ERROR_PREFIX: &str = "Error generating response:";
/// Most opening text held back while it could still be the unavailable marker.
const MARKER_HOLD_LIMIT: usize = 256;

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    text: &'a str,
    max_tokens: u64,
}

/// Streams plain-text chunks from a `POST {endpoint}/chat` server.
///
/// Each body chunk is one fragment; chunk boundaries that split a UTF-8
/// sequence are stitched back together before emission.
pub struct HttpTextBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpTextBackend {
    pub fn new(config: BackendConfig) -> ProviderResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-backend-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(HttpRequestSnafu {
                stage: "http-backend-build-client",
            })?;

        Ok(Self { config, client })
    }

    fn chat_url(endpoint: &str) -> String {
        format!("{}/chat", endpoint.trim_end_matches('/'))
    }

    async fn open_response(
        client: &reqwest::Client,
        url: &str,
        request: &StreamRequest,
    ) -> ProviderResult<reqwest::Response> {
        let response = client
            .post(url)
            .json(&ChatRequestBody {
                text: &request.prompt,
                max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            })
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "http-backend-send",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::HttpStatus {
                stage: "http-backend-status",
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        url: String,
        request: StreamRequest,
        emitter: StreamEmitter,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let generation = request.generation;
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                emitter.finish(StreamEventPayload::Cancelled);
                return;
            }
            opened = Self::open_response(&client, &url, &request) => match opened {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(generation = %generation, url = %url, error = %error, "chat server unreachable");
                    emitter.finish(StreamEventPayload::Unavailable(error.to_string()));
                    return;
                }
            },
        };

        let mut body = response.bytes_stream();
        let mut decoder = Utf8ChunkDecoder::default();
        let mut opening = OpeningClassifier::default();
        let mut fragments = 0_usize;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(generation = %generation, fragments, "http stream cancelled");
                    emitter.finish(StreamEventPayload::Cancelled);
                    return;
                }
                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            let text = decoder.push(&bytes);
                            if text.is_empty() {
                                continue;
                            }

                            let text = match opening.push(&text) {
                                Opening::Pending => continue,
                                Opening::Marker(payload) => {
                                    emitter.finish(payload);
                                    return;
                                }
                                Opening::Text(text) => text,
                            };
                            // Mid-stream failures arrive as their own chunk.
                            if text.starts_with(GENERATION_ERROR_PREFIX) {
                                emitter.finish(StreamEventPayload::Error(text));
                                return;
                            }

                            fragments += 1;
                            if !emitter.delta(text) {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            let error = ProviderError::HttpRequest {
                                stage: "http-backend-body-chunk",
                                source,
                            };
                            tracing::warn!(generation = %generation, error = %error, "http stream failed");
                            emitter.finish(StreamEventPayload::Error(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        match opening.finish(&decoder.finish()) {
            Opening::Marker(payload) => {
                emitter.finish(payload);
                return;
            }
            Opening::Text(tail) if !tail.is_empty() => {
                emitter.delta(tail);
            }
            Opening::Text(_) | Opening::Pending => {}
        }
        tracing::debug!(generation = %generation, fragments, "http stream completed");
        emitter.finish(StreamEventPayload::Done);
    }
}

impl ChatBackend for HttpTextBackend {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "HTTP text stream"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "http-stream-chat",
                generation: request.generation,
            }
        );

        let mut request = request;
        if request.max_tokens.is_none() {
            request.max_tokens = self.config.max_tokens;
        }

        let (emitter, stream, cancel_rx) = make_event_stream(request.generation);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            Self::chat_url(&self.config.endpoint),
            request,
            emitter,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

enum Opening {
    Pending,
    Text(String),
    Marker(StreamEventPayload),
}

/// Decides whether the start of a body is reply text or an in-band server
/// marker. Markers are plain text, so this is a heuristic:
///
/// - an opening starting with `Error generating response:` is a failure;
/// - a whole body that is one line starting with `Error: ` is the unavailable
///   marker;
/// - everything else is reply text, released as soon as it cannot match.
#[derive(Debug, Default)]
struct OpeningClassifier {
    held: String,
    settled: bool,
}

impl OpeningClassifier {
    fn push(&mut self, text: &str) -> Opening {
        if self.settled {
            return Opening::Text(text.to_string());
        }
        self.held.push_str(text);
        self.classify(false)
    }

    fn finish(&mut self, tail: &str) -> Opening {
        if self.settled {
            return Opening::Text(tail.to_string());
        }
        self.held.push_str(tail);
        self.classify(true)
    }

    fn classify(&mut self, ended: bool) -> Opening {
        if self.held.starts_with(GENERATION_ERROR_PREFIX) {
            self.settled = true;
            return Opening::Marker(StreamEventPayload::Error(std::mem::take(&mut self.held)));
        }

        let single_line = !self.held.contains('\n');
        if self.held.starts_with(UNAVAILABLE_PREFIX) && single_line {
            if ended {
                self.settled = true;
                return Opening::Marker(StreamEventPayload::Unavailable(std::mem::take(
                    &mut self.held,
                )));
            }
            if self.held.len() < MARKER_HOLD_LIMIT {
                return Opening::Pending;
            }
        } else if !ended
            && (GENERATION_ERROR_PREFIX.starts_with(self.held.as_str())
                || UNAVAILABLE_PREFIX.starts_with(self.held.as_str()))
        {
            return Opening::Pending;
        }

        self.settled = true;
        Opening::Text(std::mem::take(&mut self.held))
    }
}

/// Reassembles UTF-8 text from byte chunks that may split a code point.
#[derive(Debug, Default)]
struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match error.error_len() {
                        // Incomplete trailing sequence: wait for the next chunk.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return decoded;
                        }
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
