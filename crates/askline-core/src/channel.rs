//! Duplex channel: upgrades a negotiated session to a WebSocket and pumps
//! decoded payloads to the query in flight.
//!
//! One background task owns the socket for the whole life of the channel. It
//! answers heartbeats, forwards `42`/`43` payloads to the registered fragment
//! queue, and writes whatever the foreground hands it through the command
//! queue. Undecodable frames are logged and dropped; they never stop the loop.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, HeaderName, USER_AGENT};
use tracing::{debug, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::error::{AskError, Result};
use crate::fragment::Fragment;
use crate::protocol::{Control, Frame, decode};
use crate::session::Session;

/// Lifecycle of a channel, published by the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// WebSocket handshake in progress
    Connecting,
    /// Socket open, probe/upgrade packets being sent
    Probing,
    /// Upgrade committed; waiting for the first server frame
    Upgraded,
    /// Server frames flowing
    Active,
    Closed,
}

impl ChannelState {
    /// Whether the channel accepts queries.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Upgraded | Self::Active)
    }
}

enum Command {
    Send(String),
    Begin {
        fragments: mpsc::Sender<Fragment>,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Handle to a running duplex channel.
pub struct Channel {
    sid: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
    fragment_buffer: usize,
}

impl Channel {
    /// Open the duplex connection for `session` and wait, within the connect
    /// budget, until the upgrade has been committed.
    #[instrument(skip_all, fields(sid = %session.sid))]
    pub async fn open(session: Session, config: &ClientConfig) -> Result<Self> {
        if !session.authenticated {
            return Err(AskError::NotAuthenticated(session.sid));
        }
        let request = upgrade_request(&session, config)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let (failure_tx, mut failure_rx) = oneshot::channel();
        let task = tokio::spawn(connect_and_drive(request, command_rx, state_tx, failure_tx));

        let channel = Self {
            sid: session.sid,
            commands,
            state,
            task,
            fragment_buffer: config.query.fragment_buffer.max(1),
        };

        let policy = &config.connect;
        let mut attempts = 0;
        loop {
            match channel.state() {
                state if state.is_ready() => {
                    debug!(attempts, "channel upgraded");
                    return Ok(channel);
                }
                ChannelState::Closed => {
                    let reason = failure_rx
                        .try_recv()
                        .unwrap_or_else(|_| "closed during upgrade".to_string());
                    return Err(AskError::Connect(reason));
                }
                _ => {}
            }
            if attempts >= policy.max_attempts {
                channel.task.abort();
                return Err(AskError::ConnectTimeout { attempts });
            }
            tokio::time::sleep(policy.poll_interval()).await;
            attempts += 1;
        }
    }

    /// Run the channel loop over an already-established WebSocket.
    pub fn attach<T>(sid: impl Into<String>, ws: WebSocketStream<T>, fragment_buffer: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Probing);
        let task = tokio::spawn(drive(ws, command_rx, state_tx));
        Self {
            sid: sid.into(),
            commands,
            state,
            task,
            fragment_buffer: fragment_buffer.max(1),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Register a new query and get the receiving end of its fragment queue.
    ///
    /// Fails with [`AskError::QueryInFlight`] while a previous query has not
    /// received its terminal fragment.
    pub async fn begin_query(&self) -> Result<mpsc::Receiver<Fragment>> {
        let (fragments, receiver) = mpsc::channel(self.fragment_buffer);
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Begin { fragments, reply })
            .map_err(|_| AskError::ChannelClosed)?;
        reply_rx.await.map_err(|_| AskError::ChannelClosed)??;
        Ok(receiver)
    }

    /// Queue a raw text frame for sending.
    pub fn send(&self, frame: String) -> Result<()> {
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| AskError::ChannelClosed)
    }

    /// Ask the background task to close the socket. Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Wait until the background task has finished.
    pub async fn closed(mut self) {
        let _ = self.state.wait_for(|s| *s == ChannelState::Closed).await;
        let _ = (&mut self.task).await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn upgrade_request(session: &Session, config: &ClientConfig) -> Result<Request> {
    let url = config.websocket_url(&session.sid)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AskError::Connect(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(USER_AGENT, header_value(&config.service.user_agent)?);
    headers.insert(
        HeaderName::from_static("x-client-name"),
        header_value(&config.service.client_name)?,
    );
    if let Some(cookie) = session.cookies.header_value() {
        headers.insert(COOKIE, header_value(&cookie)?);
    }
    Ok(request)
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|e| AskError::Config(format!("header {raw:?}: {e}")))
}

async fn connect_and_drive(
    request: Request,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    failure: oneshot::Sender<String>,
) {
    match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => drive(ws, commands, state).await,
        Err(err) => {
            warn!(error = %err, "websocket connect failed");
            let _ = failure.send(err.to_string());
            state.send_replace(ChannelState::Closed);
        }
    }
}

async fn drive<T>(
    mut ws: WebSocketStream<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    state.send_replace(ChannelState::Probing);
    for control in [Control::Probe, Control::Upgrade] {
        if let Err(err) = ws.send(text(control.as_wire())).await {
            warn!(error = %err, "failed to send upgrade packets");
            state.send_replace(ChannelState::Closed);
            return;
        }
    }
    state.send_replace(ChannelState::Upgraded);

    let mut active: Option<mpsc::Sender<Fragment>> = None;
    // Fragments the consumer has no room for yet, oldest first.
    let mut backlog: VecDeque<Fragment> = VecDeque::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    trace!(frame = %frame, "sending");
                    if let Err(err) = ws.send(text(&frame)).await {
                        warn!(error = %err, "channel write failed");
                        break;
                    }
                }
                Some(Command::Begin { fragments, reply }) => {
                    if active.as_ref().is_some_and(|tx| !tx.is_closed()) {
                        let _ = reply.send(Err(AskError::QueryInFlight));
                    } else {
                        active = Some(fragments);
                        backlog.clear();
                        let _ = reply.send(Ok(()));
                    }
                }
                Some(Command::Close) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            permit = reserve(active.clone()), if !backlog.is_empty() => {
                deliver(permit, &mut active, &mut backlog);
            }
            message = ws.next() => match message {
                Some(Ok(Message::Text(raw))) => {
                    if !handle_text(&mut ws, raw.as_str(), &mut active, &mut backlog, &state).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed the channel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "channel read failed");
                    break;
                }
                None => break,
            },
        }
    }

    state.send_replace(ChannelState::Closed);
}

/// Returns `false` when the socket can no longer be written to.
async fn handle_text<T>(
    ws: &mut WebSocketStream<T>,
    raw: &str,
    active: &mut Option<mpsc::Sender<Fragment>>,
    backlog: &mut VecDeque<Fragment>,
    state: &watch::Sender<ChannelState>,
) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, frame = %preview(raw), "dropping undecodable frame");
            return true;
        }
    };

    if *state.borrow() == ChannelState::Upgraded {
        state.send_replace(ChannelState::Active);
    }

    match frame {
        Frame::Control(Control::Ping) => {
            if let Err(err) = ws.send(text(Control::Pong.as_wire())).await {
                warn!(error = %err, "failed to answer ping");
                return false;
            }
        }
        Frame::Control(control) => trace!(?control, "control frame"),
        Frame::Event { name, payload } => {
            trace!(event = %name, "event frame");
            forward(active, backlog, Fragment::event(payload));
        }
        Frame::Ack(payload) => forward(active, backlog, Fragment::ack(payload)),
    }
    true
}

/// Hand a fragment to the query in flight without waiting on the consumer.
fn forward(
    active: &mut Option<mpsc::Sender<Fragment>>,
    backlog: &mut VecDeque<Fragment>,
    fragment: Fragment,
) {
    let Some(tx) = active.as_ref() else {
        trace!("no query in flight, ignoring fragment");
        return;
    };
    if backlog.back().is_some_and(Fragment::is_terminal) {
        trace!("query already complete, ignoring fragment");
        return;
    }
    if !backlog.is_empty() {
        backlog.push_back(fragment);
        return;
    }

    let terminal = fragment.is_terminal();
    match tx.try_send(fragment) {
        Ok(()) if terminal => {
            // Dropping the sender is the completion signal.
            *active = None;
        }
        Ok(()) => {}
        Err(TrySendError::Full(fragment)) => {
            debug!("fragment queue full, holding back");
            backlog.push_back(fragment);
        }
        Err(TrySendError::Closed(_)) => {
            debug!("query consumer went away");
            *active = None;
        }
    }
}

async fn reserve(active: Option<mpsc::Sender<Fragment>>) -> Option<mpsc::OwnedPermit<Fragment>> {
    active?.reserve_owned().await.ok()
}

fn deliver(
    permit: Option<mpsc::OwnedPermit<Fragment>>,
    active: &mut Option<mpsc::Sender<Fragment>>,
    backlog: &mut VecDeque<Fragment>,
) {
    let Some(permit) = permit else {
        debug!("query consumer went away");
        *active = None;
        backlog.clear();
        return;
    };
    let Some(fragment) = backlog.pop_front() else {
        return;
    };
    let terminal = fragment.is_terminal();
    permit.send(fragment);
    if terminal {
        *active = None;
        backlog.clear();
    }
}

fn text(frame: &str) -> Message {
    Message::Text(frame.to_string().into())
}

fn preview(raw: &str) -> &str {
    match raw.char_indices().nth(120) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
