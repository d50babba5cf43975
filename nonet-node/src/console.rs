//! Console front-end in place of the chat UI: turns typed lines into sends and renders
//! session events.

use std::future::Future;
use std::io;

use chrono::{DateTime, Local, Utc};
use nonet_core::{ChatMessage, PeerId, Recipient, SessionEvent, SessionRole, HOST_PEER_ID};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::registry::PeerRegistry;

/// One typed line, parsed.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Quit,
    Peers,
    /// `@name text`
    Direct { to: &'a str, text: &'a str },
    /// Plain text: broadcast (host) or to the host (peer).
    Say(&'a str),
    Invalid(&'static str),
}

pub fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line {
        "/quit" | "/exit" => return Input::Quit,
        "/peers" => return Input::Peers,
        _ => {}
    }
    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((to, text)) if !to.is_empty() && !text.trim().is_empty() => Input::Direct {
                to,
                text: text.trim(),
            },
            _ => Input::Invalid("usage: @name message"),
        };
    }
    if line.starts_with('/') {
        return Input::Invalid("commands: /peers, /quit, @name message");
    }
    Input::Say(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    role: SessionRole,
    me: PeerId,
    registry: PeerRegistry,
    prefix_sender: bool,
}

impl Console {
    pub fn new(role: SessionRole, me: PeerId, registry: PeerRegistry, prefix_sender: bool) -> Self {
        Self {
            role,
            me,
            registry,
            prefix_sender,
        }
    }

    /// Act on one typed line, printing any output.
    pub fn handle_line(&self, line: &str) -> Flow {
        match parse_input(line) {
            Input::Empty => {}
            Input::Quit => return Flow::Quit,
            Input::Peers => println!("{}", self.roster_line()),
            Input::Invalid(usage) => println!("! {usage}"),
            Input::Direct { to, text } => println!("{}", self.send(to, text)),
            Input::Say(text) => match self.role {
                SessionRole::Host => println!("{}", self.broadcast(text)),
                SessionRole::Peer => println!("{}", self.send(HOST_PEER_ID, text)),
            },
        }
        Flow::Continue
    }

    /// Run the console until `/quit`, the shutdown future, or (peer role) loss of the
    /// host. Closed input does not end the session; it keeps serving until shutdown.
    pub async fn drive<R, S>(
        &self,
        input: R,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: S,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = io::Result<()>>,
    {
        let mut lines = input.lines();
        let mut input_open = true;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    tracing::info!("shutdown signal received");
                    return Ok(());
                }
                Some(event) = events.recv() => {
                    println!("{}", render_event(&event));
                    if self.is_host_lost(&event) {
                        println!("* connection to host lost");
                        return Ok(());
                    }
                }
                line = lines.next_line(), if input_open => match line? {
                    Some(line) => {
                        if self.handle_line(&line) == Flow::Quit {
                            return Ok(());
                        }
                    }
                    None => {
                        tracing::info!("console input closed; serving until shutdown");
                        input_open = false;
                    }
                },
            }
        }
    }

    fn is_host_lost(&self, event: &SessionEvent) -> bool {
        self.role == SessionRole::Peer
            && matches!(event, SessionEvent::PeerLost(id) if id.as_str() == HOST_PEER_ID)
    }

    fn wire_text(&self, text: &str) -> String {
        if self.prefix_sender {
            format!("{}: {}", self.me, text)
        } else {
            text.to_string()
        }
    }

    fn send(&self, to: &str, text: &str) -> String {
        match self.registry.send_to(to, &self.wire_text(text)) {
            Ok(()) => match PeerId::new(to) {
                Ok(recipient) => render_message(&ChatMessage::outgoing(
                    self.me.clone(),
                    recipient,
                    text.to_string(),
                )),
                Err(_) => format!("-> {to}: {text}"),
            },
            Err(e) => format!("! {e}"),
        }
    }

    fn broadcast(&self, text: &str) -> String {
        match self.registry.broadcast(&self.wire_text(text)) {
            Ok(report) if report.delivered.is_empty() && report.failed.is_empty() => {
                "! nobody is connected".to_string()
            }
            Ok(report) => {
                let mut out = format!("{} -> all: {}", self.me, text);
                if !report.failed.is_empty() {
                    out.push_str(&format!(" (not sent to {})", join_ids(&report.failed)));
                }
                out
            }
            Err(e) => format!("! {e}"),
        }
    }

    fn roster_line(&self) -> String {
        let roster = self.registry.roster();
        if roster.is_empty() {
            "* no peers connected".to_string()
        } else {
            format!("* peers: {}", join_ids(&roster))
        }
    }
}

fn join_ids(ids: &[PeerId]) -> String {
    ids.iter().map(PeerId::as_str).collect::<Vec<_>>().join(", ")
}

/// Local `HH:MM:SS` of a millisecond timestamp.
fn clock(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

pub fn render_message(msg: &ChatMessage) -> String {
    match &msg.recipient {
        Recipient::Local => format!("[{}] {}: {}", clock(msg.timestamp), msg.sender, msg.content),
        Recipient::Peer(to) => format!(
            "[{}] {} -> {}: {}",
            clock(msg.timestamp),
            msg.sender,
            to,
            msg.content
        ),
    }
}

pub fn render_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Message(msg) => render_message(msg),
        SessionEvent::PeerJoined(id) => format!("* {id} joined"),
        SessionEvent::PeerLost(id) => format!("* {id} left"),
        SessionEvent::RosterChanged(ids) if ids.is_empty() => "* no peers connected".to_string(),
        SessionEvent::RosterChanged(ids) => format!("* peers: {}", join_ids(ids)),
    }
}
