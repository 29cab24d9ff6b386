//! Terminal call flows behind the `call` and `listen` commands.
//!
//! Both wire the signaling client to a call controller backed by the
//! simulated media stack, then react to notifications, view changes and
//! single-letter commands typed on stdin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::controller::{CallController, CallEvents, CallHandle, CallView};
use super::media::{StreamInfo, TrackKind};
use super::sim::{SimMedia, SimPeerFactory};
use super::{CallState, CallType, Notification};
use crate::config::Config;
use crate::socket;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What `listen` does with an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingPolicy {
    /// Wait for `a` or `r` on stdin.
    Ask,
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Exit once the outgoing call is over.
    Call,
    /// Keep taking calls until Ctrl-C or `q`.
    Listen(IncomingPolicy),
}

/// Typed console commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Accept,
    Reject,
    HangUp,
    Video,
    Mute,
    Quit,
    Help,
}

impl Key {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "a" | "accept" => Some(Key::Accept),
            "r" | "reject" => Some(Key::Reject),
            "h" | "hangup" | "end" => Some(Key::HangUp),
            "v" | "video" => Some(Key::Video),
            "m" | "mute" => Some(Key::Mute),
            "q" | "quit" => Some(Key::Quit),
            "?" | "help" => Some(Key::Help),
            _ => None,
        }
    }
}

const HELP: &str =
    "Commands: a = accept, r = reject, h = hang up, v = camera on/off, m = mute/unmute, q = quit";

struct Client {
    handle: CallHandle,
    events: CallEvents,
    link: JoinHandle<Result<()>>,
}

impl Client {
    async fn connect(config: &Config) -> Result<Self> {
        let controller_config = config.controller_config()?;
        let url = socket::endpoint_url(&config.signaling_url, &controller_config.user_id)?;
        let (transport, outbound) = socket::channel();

        let (handle, events) = CallController::start(
            controller_config,
            Arc::new(transport.clone()),
            Arc::new(SimMedia::new()),
            Arc::new(SimPeerFactory::default()),
        );
        let link = tokio::spawn(socket::run(url, outbound, handle.clone()));
        let client = Self {
            handle,
            events,
            link,
        };

        let connected = tokio::select! {
            r = time::timeout(CONNECT_TIMEOUT, transport.wait_connected()) => {
                r.context("Timed out connecting to signaling server").and_then(|r| r)
            }
            _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Interrupted")),
        };
        // Only the controller may keep the transport, so the link stops with it.
        drop(transport);

        match connected {
            Ok(()) => Ok(client),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// End any call, stop the controller and let the link flush.
    async fn close(self) {
        self.handle.shutdown().await;
        let _ = self.events.task.await;
        let mut link = self.link;
        match time::timeout(LINK_DRAIN_TIMEOUT, &mut link).await {
            Ok(Ok(Err(e))) => tracing::warn!("Signaling client failed: {:#}", e),
            Ok(_) => {}
            Err(_) => {
                tracing::debug!("Signaling client did not stop in time");
                link.abort();
            }
        }
    }

    async fn drive(&mut self, mode: Mode, duration: Option<Duration>) -> Result<()> {
        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut last = self.events.view.borrow().clone();
        let mut hangup_at: Option<Instant> = None;
        let mut hanging_up = false;

        loop {
            let deadline = hangup_at.unwrap_or_else(Instant::now);
            tokio::select! {
                Some(notification) = self.events.notifications.recv() => {
                    println!("{}", notification);
                    match notification {
                        Notification::IncomingCall { .. } => self.on_incoming(mode).await,
                        Notification::CallRejected
                        | Notification::CallEnded { .. }
                        | Notification::Failed { .. } => {
                            if mode == Mode::Call {
                                return Ok(());
                            }
                        }
                    }
                }
                changed = self.events.view.changed() => {
                    changed.context("Call controller stopped")?;
                    let view = self.events.view.borrow_and_update().clone();
                    report_changes(&last, &view);

                    if view.call_state == CallState::Connected
                        && last.call_state != CallState::Connected
                    {
                        hangup_at = duration.map(|d| Instant::now() + d);
                    }
                    if view.call_state.is_idle() {
                        hangup_at = None;
                        if hanging_up && mode == Mode::Call {
                            return Ok(());
                        }
                    }
                    last = view;
                }
                line = input.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match Key::parse(&line) {
                        Some(Key::Quit) => return Ok(()),
                        Some(Key::HangUp) => {
                            hanging_up = true;
                            self.handle.end_call();
                        }
                        Some(key) => self.on_key(key).await,
                        None if line.trim().is_empty() => {}
                        None => println!("{}", HELP),
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                },
                _ = time::sleep_until(deadline), if hangup_at.is_some() => {
                    println!("Call duration reached, hanging up");
                    hangup_at = None;
                    hanging_up = true;
                    self.handle.end_call();
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("Shutting down...");
                    return Ok(());
                }
            }
        }
    }

    async fn on_incoming(&self, mode: Mode) {
        match mode {
            Mode::Listen(IncomingPolicy::Accept) => {
                if let Err(e) = self.handle.accept_call().await {
                    tracing::warn!("Auto-accept failed: {}", e);
                }
            }
            Mode::Listen(IncomingPolicy::Reject) => {
                if let Err(e) = self.handle.reject_call().await {
                    tracing::warn!("Auto-reject failed: {}", e);
                }
            }
            _ => println!("Press a to accept or r to reject"),
        }
    }

    async fn on_key(&self, key: Key) {
        let result = match key {
            Key::Accept => self.handle.accept_call().await,
            Key::Reject => self.handle.reject_call().await,
            Key::Video => {
                self.handle.toggle_video();
                Ok(())
            }
            Key::Mute => {
                self.handle.toggle_audio();
                Ok(())
            }
            Key::Help => {
                println!("{}", HELP);
                Ok(())
            }
            // Handled by the caller.
            Key::HangUp | Key::Quit => Ok(()),
        };
        if let Err(e) = result {
            println!("{}", e);
        }
    }
}

fn report_changes(old: &CallView, new: &CallView) {
    if old.call_state != new.call_state {
        match &new.current_call {
            Some(call) => println!(
                "[{}] {} call with {}",
                new.call_state, call.call_type, call.participant_id
            ),
            None => println!("[{}]", new.call_state),
        }
    }
    if old.is_video_enabled != new.is_video_enabled {
        println!("Camera {}", if new.is_video_enabled { "on" } else { "off" });
    }
    if old.is_audio_enabled != new.is_audio_enabled {
        println!("Microphone {}", if new.is_audio_enabled { "on" } else { "muted" });
    }
    if old.remote_stream.is_none() {
        if let Some(remote) = &new.remote_stream {
            println!("Receiving remote {}", describe_media(remote));
        }
    }
}

fn describe_media(stream: &StreamInfo) -> &'static str {
    match (stream.has(TrackKind::Audio), stream.has(TrackKind::Video)) {
        (true, true) => "audio and video",
        (false, true) => "video",
        _ => "audio",
    }
}

/// Place one call and wait until it is over.
pub async fn run_call(
    config: &Config,
    participant: &str,
    call_type: CallType,
    duration: Option<u64>,
) -> Result<()> {
    let mut client = Client::connect(config).await?;

    let outcome = match client.handle.initiate_call(participant, call_type).await {
        Ok(()) => {
            println!("Calling {} ({} call). {}", participant, call_type, HELP);
            client.drive(Mode::Call, duration.map(Duration::from_secs)).await
        }
        Err(e) => Err(e.into()),
    };
    client.close().await;
    outcome
}

/// Wait for incoming calls until Ctrl-C or `q`.
pub async fn run_listen(config: &Config, policy: IncomingPolicy) -> Result<()> {
    let mut client = Client::connect(config).await?;
    println!("Listening for calls as {}... (Ctrl-C to stop)", config.user_id()?);
    let outcome = client.drive(Mode::Listen(policy), None).await;
    client.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media::TrackInfo;

    #[test]
    fn test_parse_keys() {
        assert_eq!(Key::parse("a\n"), Some(Key::Accept));
        assert_eq!(Key::parse(" Reject "), Some(Key::Reject));
        assert_eq!(Key::parse("h"), Some(Key::HangUp));
        assert_eq!(Key::parse("end"), Some(Key::HangUp));
        assert_eq!(Key::parse("M"), Some(Key::Mute));
        assert_eq!(Key::parse("?"), Some(Key::Help));
        assert_eq!(Key::parse("dial"), None);
        assert_eq!(Key::parse(""), None);
    }

    #[test]
    fn test_describe_media() {
        let track = |kind: TrackKind| TrackInfo {
            id: format!("{}-0", kind),
            kind,
            enabled: true,
            stopped: false,
        };
        let stream = |tracks: Vec<TrackInfo>| StreamInfo {
            id: "remote".into(),
            tracks,
        };
        assert_eq!(describe_media(&stream(vec![track(TrackKind::Audio)])), "audio");
        assert_eq!(
            describe_media(&stream(vec![
                track(TrackKind::Audio),
                track(TrackKind::Video)
            ])),
            "audio and video"
        );
    }

    #[tokio::test]
    async fn test_connect_requires_user_id() {
        let config = Config::default();
        let err = match Client::connect(&config).await {
            Ok(_) => panic!("connected without a user id"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("No user id configured"));
    }
}
