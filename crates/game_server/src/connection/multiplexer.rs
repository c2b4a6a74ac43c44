//! Per-connection stream multiplexer.
//!
//! One [`StreamMultiplexer::run`] call owns one player stream end to end:
//!
//! ```text
//!   network ──► receive pump ──(cap 1)──┐
//!                                       ├──► select loop ──► FrameSender ──► network
//!   other tasks ──► PushSink ──(queue)──┤         │
//!   server shutdown token ──────────────┘         └──► route_message (under the latch)
//! ```
//!
//! The receive pump decouples the blocking network receive from the select
//! loop. It forwards one frame at a time through a capacity-1 channel, so a
//! busy loop (e.g. waiting on the latch) stalls network reads instead of
//! buffering in memory.
//!
//! Ordering holds per source only: inbound frames are processed in arrival
//! order and pushed frames are delivered in the order they were queued, but
//! a handler response and an interleaved push may go out in either order.
//!
//! # Session states
//!
//! * INIT: only `Register`, `Ping` and `Unregister` are accepted
//! * REGISTERED: push sink published in the registry, messages dispatched
//! * KICKED_OUT: set by a handler, a `Kick` frame is sent and the stream ends
//! * TERMINATED: registry entry removed exactly once, pump released

use super::{FrameReceiver, FrameSender};
use crate::error::SessionError;
use crate::messaging::{route_message, Frame, FrameType, HandlerTable};
use crate::session::{Latch, PushSink, Session, SessionFlags, SessionRegistry, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Default capacity of a session's push queue.
pub const DEFAULT_PUSH_QUEUE_CAPACITY: usize = 16;

/// Shared context every player stream runs with.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    registry: Arc<SessionRegistry>,
    handlers: Arc<HandlerTable>,
    latch: Arc<Latch>,
    push_queue_capacity: usize,
    shutdown: CancellationToken,
}

/// What the select loop does after a frame was handled.
enum Flow {
    Continue,
    Stop,
}

/// Releases everything a session holds, on every exit path.
///
/// Runs on normal return, on error return, and when the `run` future is
/// dropped or unwinds, so the pump always observes the session ending and
/// the registry never keeps an entry for a dead stream.
struct Teardown<'a> {
    registry: &'a SessionRegistry,
    sink: PushSink,
    registered: Option<UserId>,
    dying: CancellationToken,
}

impl Teardown<'_> {
    fn release_registration(&mut self) {
        if let Some(user_id) = self.registered.take() {
            if self.registry.unregister_if_current(user_id, &self.sink) {
                debug!("removed registry entry for user {}", user_id);
            } else {
                debug!("registry entry for user {} already superseded", user_id);
            }
        }
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.release_registration();
        self.dying.cancel();
    }
}

impl StreamMultiplexer {
    pub fn new(registry: Arc<SessionRegistry>, handlers: Arc<HandlerTable>, latch: Arc<Latch>) -> Self {
        Self {
            registry,
            handlers,
            latch,
            push_queue_capacity: DEFAULT_PUSH_QUEUE_CAPACITY,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_push_queue_capacity(mut self, capacity: usize) -> Self {
        self.push_queue_capacity = capacity.max(1);
        self
    }

    /// Ends every stream run by this multiplexer once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    /// Drives one player stream until it terminates.
    ///
    /// Returns `Ok(())` for graceful ends (unregister, client close, kick,
    /// server shutdown) and the fatal [`SessionError`] otherwise. Registry
    /// cleanup has already happened by the time this returns.
    pub async fn run<R, W>(&self, receiver: R, mut sender: W) -> Result<(), SessionError>
    where
        R: FrameReceiver,
        W: FrameSender,
    {
        let mut session = Session::new();
        let dying = CancellationToken::new();
        let (sink, mut pushes) = PushSink::channel(self.push_queue_capacity);
        let mut teardown = Teardown {
            registry: &self.registry,
            sink,
            registered: None,
            dying: dying.clone(),
        };
        let mut inbound = spawn_receive_pump(receiver, dying);

        let result = self
            .select_loop(&mut session, &mut teardown, &mut inbound, &mut pushes, &mut sender)
            .await;

        if teardown.registered.is_some() {
            session.flags.remove(SessionFlags::REGISTERED);
        }
        drop(teardown);
        trace!("stream end: {}", session.user_id);
        result
    }

    async fn select_loop<W: FrameSender>(
        &self,
        session: &mut Session,
        teardown: &mut Teardown<'_>,
        inbound: &mut mpsc::Receiver<Result<Frame, SessionError>>,
        pushes: &mut mpsc::Receiver<Frame>,
        sender: &mut W,
    ) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                received = inbound.recv() => {
                    let frame = match received {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            error!("receive failed for user {}: {}", session.user_id, e);
                            return Err(e);
                        }
                        None => {
                            debug!("client closed stream for user {}", session.user_id);
                            return Ok(());
                        }
                    };
                    match self.handle_frame(frame, session, teardown, sender).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => return Ok(()),
                        Err(e) => {
                            error!("session for user {} terminated: {}", session.user_id, e);
                            return Err(e);
                        }
                    }
                }
                Some(frame) = pushes.recv() => {
                    if let Err(e) = sender.send(frame).await {
                        error!("push delivery failed for user {}: {}", session.user_id, e);
                        return Err(e);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("server shutting down, kicking user {}", session.user_id);
                    let _ = sender.send(Frame::kick()).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame<W: FrameSender>(
        &self,
        frame: Frame,
        session: &mut Session,
        teardown: &mut Teardown<'_>,
        sender: &mut W,
    ) -> Result<Flow, SessionError> {
        match frame.frame_type {
            FrameType::Message => {
                let response =
                    route_message(&frame.message, session, &self.handlers, &self.latch).await?;
                if let Some(payload) = response {
                    sender.send(Frame::message(payload)).await?;
                }

                // session control by logic
                if session.is_kicked_out() {
                    info!("user {} kicked out by game logic", session.user_id);
                    sender.send(Frame::kick()).await?;
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            FrameType::Register => {
                let requested = frame.user_id;
                if session.is_registered() {
                    if session.user_id != requested {
                        return Err(SessionError::AlreadyRegistered {
                            current: session.user_id,
                            requested,
                        });
                    }
                    self.registry.register(requested, teardown.sink.clone());
                    debug!("user {} re-registered", requested);
                    return Ok(Flow::Continue);
                }

                self.registry.register(requested, teardown.sink.clone());
                teardown.registered = Some(requested);
                session.user_id = requested;
                session.flags.insert(SessionFlags::REGISTERED);
                info!("👋 userid {} logged in", requested);
                Ok(Flow::Continue)
            }
            FrameType::Unregister => {
                if session.is_registered() {
                    teardown.release_registration();
                    session.flags.remove(SessionFlags::REGISTERED);
                    info!("userid {} logged out", session.user_id);
                }
                Ok(Flow::Stop)
            }
            FrameType::Ping => {
                sender.send(frame).await?;
                trace!("pinged");
                Ok(Flow::Continue)
            }
            FrameType::Kick => Err(SessionError::IncorrectFrameType(FrameType::Kick)),
        }
    }
}

/// Spawns the task that makes stream receiving selectable.
///
/// The pump exits on end-of-stream, after forwarding a receive error, or as
/// soon as `dying` is cancelled, whichever comes first. Cancellation is
/// observed both while waiting on the network and while waiting to forward,
/// so the pump never outlives its session.
fn spawn_receive_pump<R: FrameReceiver>(
    mut receiver: R,
    dying: CancellationToken,
) -> mpsc::Receiver<Result<Frame, SessionError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = receiver.recv() => received,
                _ = dying.cancelled() => return,
            };
            let item = match received {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => return,
                Err(e) => Err(e),
            };
            let fatal = item.is_err();
            tokio::select! {
                sent = tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = dying.cancelled() => return,
            }
            if fatal {
                return;
            }
        }
    });
    rx
}
