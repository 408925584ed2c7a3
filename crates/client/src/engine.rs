// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Async shell around [`ModuleManager`].
//!
//! One task owns the manager and the transport. [`Engine`] handles talk to
//! it over a command channel, so every mutation of engine state happens on
//! that task and callers never share locks with it.

use std::fmt;
use std::time::Duration;

use ml_core::Frame;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{error::Elapsed, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::correlation::SubscriptionId;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::initial_data::Decoder;
use crate::manager::{EngineStatus, ModuleAction, ModuleManager, Output, Reply};
use crate::polling::PollChannel;
use crate::registry::Module;
use crate::transport::{Transport, TransportResult, WebSocketTransport};

const COMMAND_QUEUE: usize = 256;

enum Command {
    Send {
        codes: String,
        payload: Option<Value>,
        reply: Reply<()>,
    },
    Request {
        codes: String,
        payload: Option<Value>,
        response_codes: String,
        timeout: Option<Duration>,
        reply: Reply<Frame>,
    },
    Login {
        password: String,
        username: String,
        reply: Reply<u32>,
    },
    LoginWithToken {
        token: String,
        reply: Reply<u32>,
    },
    Logout,
    ModuleCommand {
        uid: u32,
        data: Value,
        timeout: Option<Duration>,
        reply: Reply<Value>,
    },
    InstrumentCommand {
        uid: u32,
        command: String,
        data: Value,
        timeout: Option<Duration>,
        reply: Reply<Value>,
    },
    Perform {
        action: ModuleAction,
        reply: Reply<()>,
    },
    RegisterPromise {
        timeout: Option<Duration>,
        reply: Reply<Value>,
        id: oneshot::Sender<u32>,
    },
    InvokePromise {
        id: u32,
        data: Value,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        channel: PollChannel,
        uid: u32,
        reply: Reply<()>,
    },
    Unsubscribe {
        channel: PollChannel,
        uid: u32,
        reply: oneshot::Sender<bool>,
    },
    SubscribeFrames {
        prefix: String,
        tx: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    UnsubscribeFrames(SubscriptionId),
    Module {
        uid: u32,
        reply: oneshot::Sender<Option<Module>>,
    },
    Modules(oneshot::Sender<Vec<Module>>),
    Children {
        uid: u32,
        reply: oneshot::Sender<Vec<u32>>,
    },
    Path {
        uid: u32,
        reply: oneshot::Sender<Vec<u32>>,
    },
    Status(oneshot::Sender<EngineStatus>),
    InitialData {
        designator: String,
        key: Option<String>,
        reply: oneshot::Sender<Option<Value>>,
    },
    RegisterDecoder {
        designator: String,
        decoder: Decoder,
        reply: Reply<()>,
    },
    Remove(oneshot::Sender<()>),
}

/// Handle to a running engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::Sender<Command>,
    events: EventBus,
}

impl Engine {
    /// Validates `config` and starts an engine on a WebSocket transport.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        Ok(Self::spawn_with_transport(config, WebSocketTransport::new()))
    }

    /// Starts an engine over any transport. The first connect attempt is
    /// made immediately.
    pub fn spawn_with_transport<T>(config: EngineConfig, transport: T) -> Engine
    where
        T: Transport + 'static,
    {
        let events = EventBus::default();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let manager = ModuleManager::new(config, events.clone(), Instant::now());
        tokio::spawn(run_engine(manager, transport, rx));
        Engine {
            commands: tx,
            events,
        }
    }

    /// Subscribes to engine events from now on.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn send_message(&self, codes: &str, payload: Option<Value>) -> Result<()> {
        self.call(|reply| Command::Send {
            codes: codes.to_string(),
            payload,
            reply,
        })
        .await?
    }

    /// Sends a frame and waits for the first inbound frame whose type codes
    /// start with `response_codes`.
    pub async fn send_message_response(
        &self,
        codes: &str,
        payload: Option<Value>,
        response_codes: &str,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        self.call(|reply| Command::Request {
            codes: codes.to_string(),
            payload,
            response_codes: response_codes.to_string(),
            timeout,
            reply,
        })
        .await?
    }

    /// Logs in with a password; resolves to the granted user number.
    pub async fn login(&self, password: &str, username: &str) -> Result<u32> {
        self.call(|reply| Command::Login {
            password: password.to_string(),
            username: username.to_string(),
            reply,
        })
        .await?
    }

    pub async fn login_with_token(&self, token: &str) -> Result<u32> {
        self.call(|reply| Command::LoginWithToken {
            token: token.to_string(),
            reply,
        })
        .await?
    }

    pub async fn logout(&self) -> Result<()> {
        self.commands
            .send(Command::Logout)
            .await
            .map_err(|_| Error::EngineStopped)
    }

    /// Sends a command to a module and waits for its answer.
    pub async fn command(&self, uid: u32, data: Value, timeout: Option<Duration>) -> Result<Value> {
        self.call(|reply| Command::ModuleCommand {
            uid,
            data,
            timeout,
            reply,
        })
        .await?
    }

    /// Runs an instrument command and waits for the device's answer.
    pub async fn instrument_command(
        &self,
        uid: u32,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.call(|reply| Command::InstrumentCommand {
            uid,
            command: command.to_string(),
            data,
            timeout,
            reply,
        })
        .await?
    }

    pub async fn perform(&self, action: ModuleAction) -> Result<()> {
        self.call(|reply| Command::Perform { action, reply }).await?
    }

    /// Reserves a message id whose answer can be awaited later.
    pub async fn message_promise(&self, timeout: Option<Duration>) -> Result<MessagePromise> {
        let (reply, rx) = oneshot::channel();
        let id = self
            .call(|id| Command::RegisterPromise { timeout, reply, id })
            .await?;
        Ok(MessagePromise { id, rx })
    }

    /// Resolves a message promise. False if no promise holds `id`.
    pub async fn invoke_message_promise(&self, id: u32, data: Value) -> Result<bool> {
        self.call(|reply| Command::InvokePromise { id, data, reply })
            .await
    }

    pub async fn subscribe(&self, channel: PollChannel, uid: u32) -> Result<()> {
        self.call(|reply| Command::Subscribe {
            channel,
            uid,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, channel: PollChannel, uid: u32) -> Result<bool> {
        self.call(|reply| Command::Unsubscribe {
            channel,
            uid,
            reply,
        })
        .await
    }

    /// Receives every inbound frame whose type codes start with `prefix`
    /// until the subscription is dropped.
    pub async fn subscribe_frames(&self, prefix: &str) -> Result<FrameSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .call(|reply| Command::SubscribeFrames {
                prefix: prefix.to_string(),
                tx,
                reply,
            })
            .await?;
        Ok(FrameSubscription {
            id,
            rx,
            commands: self.commands.clone(),
        })
    }

    pub async fn module(&self, uid: u32) -> Result<Option<Module>> {
        self.call(|reply| Command::Module { uid, reply }).await
    }

    pub async fn modules(&self) -> Result<Vec<Module>> {
        self.call(Command::Modules).await
    }

    pub async fn children(&self, uid: u32) -> Result<Vec<u32>> {
        self.call(|reply| Command::Children { uid, reply }).await
    }

    pub async fn path(&self, uid: u32) -> Result<Vec<u32>> {
        self.call(|reply| Command::Path { uid, reply }).await
    }

    /// Number of live modules, root included.
    pub async fn amount(&self) -> Result<usize> {
        Ok(self.status().await?.live_modules)
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.call(Command::Status).await
    }

    pub async fn initial_data(&self, designator: &str, key: Option<&str>) -> Result<Option<Value>> {
        self.call(|reply| Command::InitialData {
            designator: designator.to_string(),
            key: key.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn register_initial_decoder(&self, designator: &str, decoder: Decoder) -> Result<()> {
        self.call(|reply| Command::RegisterDecoder {
            designator: designator.to_string(),
            decoder,
            reply,
        })
        .await?
    }

    /// Waits until the registry mirrors the device.
    pub async fn wait_synced(&self) -> Result<()> {
        let mut events = self.events();
        if self.status().await?.synced {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(EngineEvent::Synced) | Ok(EngineEvent::Resynced) => return Ok(()),
                Ok(EngineEvent::Removed) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::EngineStopped)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("event observer lagged by {}", skipped);
                    if self.status().await?.synced {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Closes the link for good and stops the engine task. Later calls on
    /// any handle fail with [`Error::EngineStopped`].
    pub async fn remove(&self) -> Result<()> {
        self.call(Command::Remove).await
    }
}

/// Awaitable answer to a reserved message id.
#[derive(Debug)]
pub struct MessagePromise {
    id: u32,
    rx: oneshot::Receiver<Result<Value>>,
}

impl MessagePromise {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn wait(self) -> Result<Value> {
        self.rx.await.map_err(|_| Error::EngineStopped)?
    }
}

/// Stream of inbound frames matching a prefix.
pub struct FrameSubscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::Sender<Command>,
}

impl fmt::Debug for FrameSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl FrameSubscription {
    /// Next matching frame, `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        // A full queue is fine: the entry is pruned on its next failed send.
        let _ = self.commands.try_send(Command::UnsubscribeFrames(self.id));
    }
}

enum Step {
    Command(Option<Command>),
    Inbound(TransportResult<Option<String>>),
    Timer,
}

/// How a connect attempt ended.
enum Attempt {
    Finished(std::result::Result<TransportResult<()>, Elapsed>),
    /// Removed, or every handle dropped, while connecting.
    Stop(Option<oneshot::Sender<()>>),
}

async fn run_engine<T: Transport>(
    mut manager: ModuleManager,
    mut transport: T,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        if manager.connect_due(Instant::now()) {
            match connect(&mut manager, &mut transport, &mut commands).await {
                Attempt::Finished(Ok(Ok(()))) => manager.on_open(Instant::now()),
                Attempt::Finished(Ok(Err(e))) => {
                    manager.on_connect_failed(Instant::now(), &e.to_string())
                }
                Attempt::Finished(Err(_)) => {
                    manager.on_connect_failed(Instant::now(), "connect timed out")
                }
                Attempt::Stop(reply) => {
                    stop(&mut manager, &mut transport, reply).await;
                    break;
                }
            }
        }
        manager.poll_timers(Instant::now());
        flush(&mut manager, &mut transport).await;

        let deadline = manager.next_deadline();
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            inbound = transport.recv(), if manager.is_open() => Step::Inbound(inbound),
            _ = sleep_until_deadline(deadline) => Step::Timer,
        };

        match step {
            Step::Command(Some(Command::Remove(reply))) => {
                stop(&mut manager, &mut transport, Some(reply)).await;
                break;
            }
            Step::Command(None) => {
                stop(&mut manager, &mut transport, None).await;
                break;
            }
            Step::Command(Some(command)) => handle_command(&mut manager, command, Instant::now()),
            Step::Inbound(Ok(Some(text))) => manager.on_text(&text, Instant::now()),
            Step::Inbound(Ok(None)) => {
                let _ = transport.disconnect().await;
                manager.on_socket_closed(Instant::now());
            }
            Step::Inbound(Err(e)) => {
                warn!("receive failed: {}", e);
                let _ = transport.disconnect().await;
                manager.on_socket_closed(Instant::now());
            }
            Step::Timer => {}
        }
    }
}

/// Runs one connect attempt while still serving handle commands.
async fn connect<T: Transport>(
    manager: &mut ModuleManager,
    transport: &mut T,
    commands: &mut mpsc::Receiver<Command>,
) -> Attempt {
    let url = manager.url();
    let limit = manager.config().timing.connect_timeout();
    let attempt = timeout(limit, transport.connect(&url));
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            result = &mut attempt => return Attempt::Finished(result),
            command = commands.recv() => match command {
                Some(Command::Remove(reply)) => return Attempt::Stop(Some(reply)),
                None => return Attempt::Stop(None),
                Some(command) => handle_command(manager, command, Instant::now()),
            },
        }
    }
}

async fn stop<T: Transport>(
    manager: &mut ModuleManager,
    transport: &mut T,
    reply: Option<oneshot::Sender<()>>,
) {
    if reply.is_none() {
        debug!("all engine handles dropped");
    }
    manager.shutdown(Instant::now());
    flush(manager, transport).await;
    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Performs queued outputs. A failed send counts as the socket closing.
async fn flush<T: Transport>(manager: &mut ModuleManager, transport: &mut T) {
    for output in manager.take_outputs() {
        match output {
            Output::Send(text) => {
                if let Err(e) = transport.send(text).await {
                    warn!("send failed: {}", e);
                    let _ = transport.disconnect().await;
                    manager.on_socket_closed(Instant::now());
                    break;
                }
            }
            Output::Close => {
                let _ = transport.disconnect().await;
            }
        }
    }
}

fn handle_command(manager: &mut ModuleManager, command: Command, now: Instant) {
    match command {
        Command::Send {
            codes,
            payload,
            reply,
        } => {
            let _ = reply.send(manager.send_message(&codes, payload));
        }
        Command::Request {
            codes,
            payload,
            response_codes,
            timeout,
            reply,
        } => manager.send_message_response(&codes, payload, &response_codes, timeout, reply, now),
        Command::Login {
            password,
            username,
            reply,
        } => manager.login(&password, &username, Some(reply), now),
        Command::LoginWithToken { token, reply } => {
            manager.login_with_token(&token, Some(reply), now)
        }
        Command::Logout => manager.logout(),
        Command::ModuleCommand {
            uid,
            data,
            timeout,
            reply,
        } => manager.module_command(uid, data, timeout, reply, now),
        Command::InstrumentCommand {
            uid,
            command,
            data,
            timeout,
            reply,
        } => manager.instrument_command(uid, &command, data, timeout, reply, now),
        Command::Perform { action, reply } => {
            let _ = reply.send(manager.perform(action));
        }
        Command::RegisterPromise { timeout, reply, id } => {
            let _ = id.send(manager.register_message_promise(reply, timeout, now));
        }
        Command::InvokePromise { id, data, reply } => {
            let _ = reply.send(manager.invoke_message_promise(id, data));
        }
        Command::Subscribe {
            channel,
            uid,
            reply,
        } => {
            let _ = reply.send(manager.subscribe(channel, uid, now));
        }
        Command::Unsubscribe {
            channel,
            uid,
            reply,
        } => {
            let _ = reply.send(manager.unsubscribe(channel, uid));
        }
        Command::SubscribeFrames { prefix, tx, reply } => {
            let _ = reply.send(manager.subscribe_frames(&prefix, tx));
        }
        Command::UnsubscribeFrames(id) => {
            manager.unsubscribe_frames(id);
        }
        Command::Module { uid, reply } => {
            let _ = reply.send(manager.module(uid));
        }
        Command::Modules(reply) => {
            let _ = reply.send(manager.modules());
        }
        Command::Children { uid, reply } => {
            let _ = reply.send(manager.children(uid));
        }
        Command::Path { uid, reply } => {
            let _ = reply.send(manager.path(uid));
        }
        Command::Status(reply) => {
            let _ = reply.send(manager.status());
        }
        Command::InitialData {
            designator,
            key,
            reply,
        } => {
            let _ = reply.send(manager.initial_data(&designator, key.as_deref()));
        }
        Command::RegisterDecoder {
            designator,
            decoder,
            reply,
        } => {
            let _ = reply.send(manager.register_initial_decoder(&designator, decoder));
        }
        // The loop intercepts removal before dispatch.
        Command::Remove(reply) => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
