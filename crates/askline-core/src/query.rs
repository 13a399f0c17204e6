//! Query engine: sends one question and yields its fragments in arrival order.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::extract::{AnswerResult, extract};
use crate::fragment::{Fragment, FragmentSource};
use crate::protocol::{SequenceCounter, encode};
use crate::session::Negotiator;

/// Client instance: configuration plus the packet id counter.
///
/// Every [`ask`](Self::ask) negotiates a fresh session and opens a fresh
/// channel; the counter keeps advancing across queries.
#[derive(Debug)]
pub struct QueryEngine {
    config: ClientConfig,
    sequence: SequenceCounter,
}

impl QueryEngine {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sequence: SequenceCounter::new(config.query.sequence_base),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sequence(&self) -> SequenceCounter {
        self.sequence
    }

    /// Negotiate, open a channel and send `text`.
    #[instrument(skip_all, fields(chars = text.chars().count()))]
    pub async fn ask(&mut self, text: &str) -> Result<FragmentStream> {
        let session = Negotiator::new(&self.config)?.negotiate().await?;
        let channel = Channel::open(session, &self.config).await?;
        self.ask_on(channel, text).await
    }

    /// Send `text` over an already open channel. The returned stream owns the
    /// channel and closes it once the query finishes.
    pub async fn ask_on(&mut self, channel: Channel, text: &str) -> Result<FragmentStream> {
        let fragments = channel.begin_query().await?;
        let seq = self.sequence.advance();
        let packet = encode(seq, &self.config.query.event, &self.query_args(text));
        channel.send(packet)?;
        debug!(seq, sid = %channel.sid(), "query sent");

        let deadline = Instant::now() + self.config.query.answer_timeout();
        Ok(FragmentStream::new(Some(channel), fragments, deadline))
    }

    /// Ask and reduce the fragments to an answer.
    pub async fn ask_answer(&mut self, text: &str) -> Result<Reply> {
        let fragments = self.ask(text).await?.collect().await;
        Ok(Reply::from_fragments(fragments))
    }

    /// `[text, {session params}]` with fresh correlation ids.
    fn query_args(&self, text: &str) -> [Value; 2] {
        let query = &self.config.query;
        [
            Value::String(text.to_string()),
            json!({
                "frontend_session_id": Uuid::new_v4().to_string(),
                "language": query.language,
                "timezone": query.timezone,
                "search_focus": query.search_focus,
                "frontend_uuid": Uuid::new_v4().to_string(),
                "mode": query.mode,
            }),
        ]
    }
}

/// Finite, ordered fragments of one query.
///
/// Ends after the terminal fragment, after a single synthetic
/// `{"error": "Timed out."}` once the deadline passes, or after a single
/// `{"error": "Connection closed."}` if the channel dies first.
pub struct FragmentStream {
    channel: Option<Channel>,
    fragments: mpsc::Receiver<Fragment>,
    deadline: Instant,
    cancel: Option<CancellationToken>,
    saw_terminal: bool,
    finished: bool,
}

impl FragmentStream {
    pub fn new(channel: Option<Channel>, fragments: mpsc::Receiver<Fragment>, deadline: Instant) -> Self {
        Self {
            channel,
            fragments,
            deadline,
            cancel: None,
            saw_terminal: false,
            finished: false,
        }
    }

    /// End the stream early when `token` is cancelled. No synthetic fragment
    /// is produced for a cancellation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fragments received but not yet yielded.
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    pub async fn next(&mut self) -> Option<Fragment> {
        if self.finished {
            return None;
        }
        // Past the ceiling, buffered fragments no longer count.
        if Instant::now() >= self.deadline {
            warn!(pending = self.pending(), "answer deadline passed");
            self.finish();
            return Some(Fragment::timed_out());
        }

        let received = match self.cancel.clone() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("query cancelled");
                    self.finish();
                    return None;
                }
                received = timeout_at(self.deadline, self.fragments.recv()) => received,
            },
            None => timeout_at(self.deadline, self.fragments.recv()).await,
        };

        match received {
            Ok(Some(fragment)) => {
                if fragment.is_terminal() {
                    self.saw_terminal = true;
                }
                Some(fragment)
            }
            Ok(None) => {
                self.finish();
                if self.saw_terminal {
                    None
                } else {
                    warn!("channel closed before the answer completed");
                    Some(Fragment::connection_closed())
                }
            }
            Err(_) => {
                warn!("no terminal fragment before the deadline");
                self.finish();
                Some(Fragment::timed_out())
            }
        }
    }

    /// Drain the stream.
    pub async fn collect(mut self) -> Vec<Fragment> {
        let mut all = Vec::new();
        while let Some(fragment) = self.next().await {
            all.push(fragment);
        }
        all
    }

    fn finish(&mut self) {
        self.finished = true;
        self.fragments.close();
        while self.fragments.try_recv().is_ok() {}
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

/// Everything a presentation layer needs from one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub fragments: Vec<Fragment>,
    pub answer: AnswerResult,
}

impl Reply {
    pub fn from_fragments(fragments: Vec<Fragment>) -> Self {
        let answer = extract(&fragments);
        Self { fragments, answer }
    }

    /// Message of the synthetic error fragment that ended the query, if any.
    pub fn error(&self) -> Option<&str> {
        self.fragments
            .iter()
            .rev()
            .find(|f| f.source == FragmentSource::Synthetic)
            .and_then(Fragment::error_message)
    }
}
