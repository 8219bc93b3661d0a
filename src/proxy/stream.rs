//! Relay of the upstream body to the caller.
//!
//! A [`ProxySession`] tracks one request through [`ProxyState`]. The relay
//! stream owns the session together with the upstream body: completion and
//! read errors finalize it explicitly, and dropping the relay early (the
//! caller went away) finalizes it as `ClientDisconnected`, which also drops the
//! upstream body and releases its connection.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::StreamFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    AwaitingUpstreamHeaders,
    Streaming,
    Completed,
    UpstreamError,
    ClientDisconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyEvent {
    RequestSent,
    HeadersReceived,
    Chunk,
    UpstreamEnded,
    UpstreamFailed,
    ClientGone,
}

impl ProxyState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::UpstreamError | Self::ClientDisconnected
        )
    }

    /// The only transition function. Terminal states absorb every event;
    /// events that make no sense in the current state leave it unchanged.
    pub fn advance(self, event: ProxyEvent) -> Self {
        use ProxyEvent as E;
        use ProxyState as S;

        match (self, event) {
            (state, _) if state.is_terminal() => state,
            (S::Idle, E::RequestSent) => S::AwaitingUpstreamHeaders,
            (S::AwaitingUpstreamHeaders, E::HeadersReceived) => S::Streaming,
            (S::Streaming, E::Chunk) => S::Streaming,
            (S::Streaming, E::UpstreamEnded) => S::Completed,
            (_, E::UpstreamFailed) => S::UpstreamError,
            (_, E::ClientGone) => S::ClientDisconnected,
            (state, _) => state,
        }
    }
}

/// Per-request proxy bookkeeping; logs the terminal transition exactly once.
#[derive(Debug)]
pub struct ProxySession {
    model: String,
    state: watch::Sender<ProxyState>,
    bytes_relayed: u64,
}

impl ProxySession {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            state: watch::Sender::new(ProxyState::Idle),
            bytes_relayed: 0,
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    pub fn advance(&mut self, event: ProxyEvent) -> ProxyState {
        let before = self.state();
        let after = before.advance(event);
        if after == before {
            return after;
        }
        self.state.send_replace(after);
        match after {
            ProxyState::Completed => info!(
                model = %self.model,
                bytes = self.bytes_relayed,
                "upstream stream completed"
            ),
            ProxyState::UpstreamError => warn!(
                model = %self.model,
                bytes = self.bytes_relayed,
                "upstream stream failed"
            ),
            ProxyState::ClientDisconnected => info!(
                model = %self.model,
                bytes = self.bytes_relayed,
                "client disconnected before upstream finished"
            ),
            _ => {}
        }
        after
    }

    fn record_bytes(&mut self, len: usize) {
        self.bytes_relayed = self.bytes_relayed.saturating_add(len as u64);
    }
}

fn text_event(content: &str) -> String {
    let event = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    format!("data: {event}\n\n")
}

const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Wraps raw text chunks into chat-completion chunk events. Code points split
/// across chunks are held back until complete.
#[derive(Debug, Default)]
pub struct TextEventEncoder {
    pending: Vec<u8>,
}

impl TextEventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the chunk produced no complete character yet.
    pub fn encode(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(chunk);
        let text = self.drain_complete();
        (!text.is_empty()).then(|| Bytes::from(text_event(&text)))
    }

    /// Flushes held-back bytes (lossily) and appends the `[DONE]` event.
    pub fn finish(&mut self) -> Bytes {
        let mut out = String::new();
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            out.push_str(&text_event(&rest));
        }
        out.push_str(DONE_EVENT);
        Bytes::from(out)
    }

    fn drain_complete(&mut self) -> String {
        let mut out = String::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // valid_up_to is a char boundary by construction.
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid_up_to + bad;
                        }
                        None => {
                            consumed += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        out
    }
}

struct RelayState {
    upstream: BoxStream<'static, Result<Bytes, std::io::Error>>,
    session: ProxySession,
    encoder: Option<TextEventEncoder>,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        self.session.advance(ProxyEvent::ClientGone);
    }
}

/// Turns the upstream body into the caller's event stream. `session` must
/// already be `Streaming`.
pub fn relay<S>(
    upstream: S,
    format: StreamFormat,
    session: ProxySession,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    let state = RelayState {
        upstream: upstream.boxed(),
        session,
        encoder: (format == StreamFormat::Text).then(TextEventEncoder::new),
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        loop {
            if state.session.state().is_terminal() {
                return Ok(None);
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.session.advance(ProxyEvent::Chunk);
                    let out = match state.encoder.as_mut() {
                        Some(encoder) => match encoder.encode(&chunk) {
                            Some(event) => event,
                            None => continue,
                        },
                        None => chunk,
                    };
                    if out.is_empty() {
                        continue;
                    }
                    state.session.record_bytes(out.len());
                    return Ok(Some((out, state)));
                }
                Some(Err(err)) => {
                    error!(error = %err, "upstream stream read failed");
                    state.session.advance(ProxyEvent::UpstreamFailed);
                    return Err(err);
                }
                None => {
                    let tail = state.encoder.as_mut().map(TextEventEncoder::finish);
                    if let Some(tail) = tail.as_ref() {
                        state.session.record_bytes(tail.len());
                    }
                    state.session.advance(ProxyEvent::UpstreamEnded);
                    return Ok(tail.map(|tail| (tail, state)));
                }
            }
        }
    })
}
