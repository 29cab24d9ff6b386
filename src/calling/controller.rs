//! Call controller: the single owner of call state and call resources.
//!
//! All mutation happens on one tokio task. User actions (through
//! [`CallHandle`]), inbound signals, peer-connection events and the results
//! of awaited steps are all messages on the same inbox, so transitions never
//! interleave. Awaited steps (media acquisition, offer/answer, description
//! setting) run in their own tasks and post back tagged with the call
//! generation; results for a call that is already gone are released, never
//! applied.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::machine::{CallFailure, Effect, Machine, Negotiation, Trigger};
use super::media::{
    MediaCapability, MediaConstraints, MediaError, MediaStream, StreamInfo, TrackKind,
    VideoConstraints,
};
use super::peer::{
    self, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, RtcConfig,
};
use super::signaling::{InboundSignal, OutboundSignal, SignalingTransport};
use super::{CallError, CallSession, CallState, CallType, Notification, SdpType, SessionDescription};

/// Static settings for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Our own user id, sent as `from`.
    pub user_id: String,
    pub rtc: RtcConfig,
    pub video: VideoConstraints,
}

/// Read-only projection of the controller for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub call_state: CallState,
    pub call_type: Option<CallType>,
    pub current_call: Option<CallSession>,
    pub local_stream: Option<StreamInfo>,
    pub remote_stream: Option<StreamInfo>,
    pub is_video_enabled: bool,
    pub is_audio_enabled: bool,
    /// Last failure, kept until the next call starts.
    pub error: Option<String>,
}

impl Default for CallView {
    fn default() -> Self {
        Self {
            call_state: CallState::Idle,
            call_type: None,
            current_call: None,
            local_stream: None,
            remote_stream: None,
            is_video_enabled: true,
            is_audio_enabled: true,
            error: None,
        }
    }
}

enum Command {
    Initiate {
        participant_id: String,
        call_type: CallType,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End,
    Toggle(TrackKind),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Outcome of an awaited step.
enum Step {
    MediaReady(Result<MediaStream, MediaError>),
    Negotiated(Result<SessionDescription, PeerError>),
    RemoteAnswer(Result<(), PeerError>),
}

enum Input {
    Command(Command),
    Signal(InboundSignal),
    Peer { generation: u64, event: PeerEvent },
    Step { generation: u64, step: Step },
}

/// Cloneable handle to a running controller.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl CallHandle {
    /// Start calling `participant_id`.
    ///
    /// Returns once the call has moved to `Calling`; later failures are
    /// reported through [`Notification::Failed`] and `CallView::error`.
    pub async fn initiate_call(
        &self,
        participant_id: impl Into<String>,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Command(Command::Initiate {
            participant_id: participant_id.into(),
            call_type,
            reply,
        }))?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    /// Accept the pending incoming call.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Command(Command::Accept { reply }))?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    /// Reject the pending incoming call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Command(Command::Reject { reply }))?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    /// End or cancel whatever call is in progress. No-op when idle.
    pub fn end_call(&self) {
        let _ = self.send(Input::Command(Command::End));
    }

    pub fn toggle_video(&self) {
        let _ = self.send(Input::Command(Command::Toggle(TrackKind::Video)));
    }

    pub fn toggle_audio(&self) {
        let _ = self.send(Input::Command(Command::Toggle(TrackKind::Audio)));
    }

    /// Hand an inbound signaling message to the controller.
    pub fn deliver(&self, signal: InboundSignal) {
        let _ = self.send(Input::Signal(signal));
    }

    /// End any active call and stop the controller.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Input::Command(Command::Shutdown { done })).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, input: Input) -> Result<(), CallError> {
        self.tx.send(input).map_err(|_| {
            tracing::error!("Call controller channel closed -- input dropped");
            CallError::ControllerClosed
        })
    }
}

/// Receiving side of a running controller.
pub struct CallEvents {
    pub view: watch::Receiver<CallView>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub task: JoinHandle<()>,
}

pub struct CallController {
    config: ControllerConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaCapability>,
    peers: Arc<dyn PeerConnectionFactory>,
    machine: Machine,
    /// Bumped whenever a new call starts.
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    video_enabled: bool,
    audio_enabled: bool,
    error: Option<String>,
    inbox: mpsc::WeakUnboundedSender<Input>,
    view_tx: watch::Sender<CallView>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl CallController {
    /// Spawn the controller task.
    ///
    /// The task ends on [`CallHandle::shutdown`] or when every handle is
    /// dropped; either way an active call is ended first.
    pub fn start(
        config: ControllerConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaCapability>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> (CallHandle, CallEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(CallView::default());
        let (notify_tx, notifications) = mpsc::unbounded_channel();

        let controller = Self {
            machine: Machine::new(config.user_id.clone()),
            config,
            transport,
            media,
            peers,
            generation: 0,
            peer: None,
            local: None,
            remote: None,
            video_enabled: true,
            audio_enabled: true,
            error: None,
            inbox: tx.downgrade(),
            view_tx,
            notify_tx,
        };
        let task = tokio::spawn(controller.run(rx));

        (
            CallHandle { tx },
            CallEvents {
                view,
                notifications,
                task,
            },
        )
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = rx.recv().await {
            if let Input::Command(Command::Shutdown { done }) = input {
                self.shutdown().await;
                let _ = done.send(());
                return;
            }
            self.handle(input).await;
            self.publish();
        }
        tracing::debug!("All call handles dropped");
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        tracing::info!("Call controller shutting down");
        self.dispatch(Trigger::End).await;
        // Nothing may outlive the controller, even if the machine was idle.
        self.release_resources();
        self.publish();
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command).await,
            Input::Signal(signal) => {
                tracing::debug!("Signal received: {}", signal.kind());
                self.dispatch(Trigger::Signal(signal)).await;
            }
            Input::Peer { generation, event } => self.handle_peer_event(generation, event).await,
            Input::Step { generation, step } => self.handle_step(generation, step).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let (trigger, reply) = match command {
            Command::Initiate {
                participant_id,
                call_type,
                reply,
            } => (
                Trigger::Initiate {
                    participant_id,
                    call_type,
                },
                Some(reply),
            ),
            Command::Accept { reply } => (Trigger::Accept, Some(reply)),
            Command::Reject { reply } => (Trigger::Reject, Some(reply)),
            Command::End => (Trigger::End, None),
            Command::Toggle(kind) => {
                self.toggle(kind);
                return;
            }
            // Handled by the run loop.
            Command::Shutdown { .. } => return,
        };

        match self.apply(trigger) {
            Ok(effects) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                self.run_effects(effects).await;
            }
            Err(e) => {
                tracing::warn!("Rejected user action: {}", e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if self.is_stale(generation) {
            tracing::debug!("Dropping peer event from a finished call: {:?}", event);
            if let PeerEvent::RemoteTrack(track) = event {
                track.stop();
            }
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.dispatch(Trigger::LocalCandidate(candidate)).await
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::info!("Remote {} track arrived", track.kind());
                self.remote
                    .get_or_insert_with(|| {
                        MediaStream::new(
                            format!("remote-{}", uuid::Uuid::new_v4().simple()),
                            Vec::new(),
                        )
                    })
                    .push(track);
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection state: {:?}", state);
                self.dispatch(Trigger::Connection(state)).await
            }
        }
    }

    async fn handle_step(&mut self, generation: u64, step: Step) {
        if self.is_stale(generation) {
            // Dropping a stale stream stops its tracks.
            if let Step::MediaReady(Ok(stream)) = step {
                tracing::info!("Discarding media acquired for a finished call");
                drop(stream);
            } else {
                tracing::debug!("Discarding result of a finished call");
            }
            return;
        }

        let trigger = match step {
            Step::MediaReady(Ok(stream)) => {
                self.store_local(stream);
                Trigger::MediaReady
            }
            Step::MediaReady(Err(e)) => Trigger::Failed(CallFailure::Media(e.to_string())),
            Step::Negotiated(Ok(desc)) => match desc.sdp_type {
                SdpType::Offer => Trigger::LocalOfferReady(desc),
                SdpType::Answer => Trigger::LocalAnswerReady(desc),
            },
            Step::Negotiated(Err(e)) | Step::RemoteAnswer(Err(e)) => {
                Trigger::Failed(CallFailure::Negotiation(e.to_string()))
            }
            Step::RemoteAnswer(Ok(())) => Trigger::RemoteAnswerApplied,
        };
        self.dispatch(trigger).await;
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation || self.machine.state().is_idle()
    }

    /// Apply a trigger, starting a new generation when a call begins.
    fn apply(&mut self, trigger: Trigger) -> Result<Vec<Effect>, CallError> {
        let was_idle = self.machine.state().is_idle();
        let effects = self.machine.apply(trigger)?;
        if was_idle && !self.machine.state().is_idle() {
            self.generation += 1;
            self.error = None;
        }
        Ok(effects)
    }

    async fn dispatch(&mut self, trigger: Trigger) {
        match self.apply(trigger) {
            Ok(effects) => self.run_effects(effects).await,
            Err(e) => tracing::warn!("{}", e),
        }
    }

    /// Execute effects in order. Effects that fail synchronously produce a
    /// follow-up trigger, processed after the current batch.
    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut batches = VecDeque::from([effects]);
        while let Some(batch) = batches.pop_front() {
            for effect in batch {
                if let Some(trigger) = self.execute(effect).await {
                    match self.apply(trigger) {
                        Ok(more) => batches.push_back(more),
                        Err(e) => tracing::warn!("{}", e),
                    }
                    // The rest of this batch belongs to a call that just failed.
                    break;
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Trigger> {
        match effect {
            Effect::AcquireMedia(call_type) => {
                let constraints = MediaConstraints::for_call(call_type, &self.config.video);
                let media = Arc::clone(&self.media);
                tracing::info!("Acquiring local media for {} call", call_type);
                self.spawn_step(async move { Step::MediaReady(media.acquire(&constraints).await) });
                None
            }
            Effect::Negotiate(plan) => self.start_negotiation(plan).err(),
            Effect::ApplyRemoteAnswer(answer) => {
                match &self.peer {
                    Some(pc) => {
                        let pc = Arc::clone(pc);
                        self.spawn_step(async move {
                            Step::RemoteAnswer(pc.set_remote_description(answer).await)
                        });
                    }
                    None => tracing::debug!("Dropping answer: no peer connection"),
                }
                None
            }
            Effect::AddRemoteCandidate(candidate) => {
                match &self.peer {
                    Some(pc) => {
                        let pc = Arc::clone(pc);
                        tokio::spawn(async move {
                            if let Err(e) = pc.add_ice_candidate(candidate).await {
                                tracing::warn!("Failed to add remote ICE candidate: {}", e);
                            }
                        });
                    }
                    None => tracing::debug!("Dropping remote ICE candidate: no peer connection"),
                }
                None
            }
            Effect::Send(signal) => self.send_signal(signal).await,
            Effect::Notify(notification) => {
                if let Notification::Failed { message } = &notification {
                    self.error = Some(message.clone());
                }
                tracing::info!("{}", notification);
                let _ = self.notify_tx.send(notification);
                None
            }
            Effect::Teardown => {
                self.release_resources();
                self.machine.finish_teardown();
                None
            }
        }
    }

    /// Create the peer connection, attach local tracks and start the
    /// offer/answer exchange in the background.
    fn start_negotiation(&mut self, plan: Negotiation) -> Result<(), Trigger> {
        let negotiation_failed =
            |e: PeerError| Trigger::Failed(CallFailure::Negotiation(e.to_string()));

        if let Some(old) = self.peer.take() {
            tracing::warn!("Closing leftover peer connection before negotiating");
            old.close();
        }
        let pc = self
            .peers
            .create(&self.config.rtc, self.peer_sink())
            .map_err(negotiation_failed)?;
        // Owned by the controller from here on, so teardown closes it even if
        // attaching tracks fails.
        self.peer = Some(Arc::clone(&pc));

        if let Some(local) = &self.local {
            for track in local.tracks() {
                pc.add_track(Arc::clone(track)).map_err(negotiation_failed)?;
            }
        }

        self.spawn_step(async move {
            let result = match plan {
                Negotiation::Offer => peer::negotiate_offer(pc.as_ref()).await,
                Negotiation::Answer(offer) => peer::negotiate_answer(pc.as_ref(), offer).await,
            };
            Step::Negotiated(result)
        });
        Ok(())
    }

    async fn send_signal(&mut self, signal: OutboundSignal) -> Option<Trigger> {
        let event = signal.event_name();
        let to = signal.to().to_string();
        let required = matches!(
            signal,
            OutboundSignal::Initiate { .. } | OutboundSignal::Accept { .. }
        );
        match self.transport.send(signal).await {
            Ok(()) => {
                tracing::info!("Sent {} to {}", event, to);
                None
            }
            Err(e) if required => Some(Trigger::Failed(CallFailure::Signaling(e.to_string()))),
            Err(e) => {
                tracing::warn!("Failed to send {} to {}: {}", event, to, e);
                None
            }
        }
    }

    fn store_local(&mut self, stream: MediaStream) {
        tracing::info!("Local media {} ready ({} tracks)", stream.id(), stream.tracks().len());
        for track in stream.tracks() {
            let enabled = match track.kind() {
                TrackKind::Audio => self.audio_enabled,
                TrackKind::Video => self.video_enabled,
            };
            track.set_enabled(enabled);
        }
        if self.local.replace(stream).is_some() {
            tracing::warn!("Replaced leftover local media");
        }
    }

    /// Flip one local track and the matching preference. No-op without a
    /// local stream or a track of that kind.
    fn toggle(&mut self, kind: TrackKind) {
        let Some(track) = self.local.as_ref().and_then(|s| s.first_of(kind)) else {
            tracing::debug!("No local {} track to toggle", kind);
            return;
        };
        let flag = match kind {
            TrackKind::Audio => &mut self.audio_enabled,
            TrackKind::Video => &mut self.video_enabled,
        };
        *flag = !*flag;
        track.set_enabled(*flag);
        tracing::info!("Local {} {}", kind, if *flag { "enabled" } else { "disabled" });
    }

    /// Close the peer connection and stop every local and remote track.
    /// Safe to call with any subset of resources present.
    fn release_resources(&mut self) {
        if let Some(pc) = self.peer.take() {
            pc.close();
            tracing::debug!("Peer connection closed");
        }
        if let Some(local) = self.local.take() {
            local.stop_all();
        }
        if let Some(remote) = self.remote.take() {
            remote.stop_all();
        }
    }

    fn spawn_step<F>(&self, fut: F)
    where
        F: Future<Output = Step> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let step = fut.await;
            // A gone controller drops the step, which releases any media in it.
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::Step { generation, step });
            }
        });
    }

    fn peer_sink(&self) -> PeerEventSink {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        PeerEventSink::new(move |event| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::Peer { generation, event });
            }
        })
    }

    fn publish(&self) {
        let session = self.machine.session();
        let view = CallView {
            call_state: self.machine.state(),
            call_type: session.map(|s| s.call_type),
            current_call: session.cloned(),
            local_stream: self.local.as_ref().map(MediaStream::info),
            remote_stream: self.remote.as_ref().map(MediaStream::info),
            is_video_enabled: self.video_enabled,
            is_audio_enabled: self.audio_enabled,
            error: self.error.clone(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
