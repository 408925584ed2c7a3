// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol core of the engine.
//!
//! [`ModuleManager`] performs no IO and reads no clock. The actor loop feeds
//! it socket text, commands and the current instant, then drains the queued
//! [`Output`]s and performs them on the transport. Every protocol rule lives
//! here so it can be exercised without sockets or real time.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ml_core::protocol::{
    pack_ipv4, CommandEnvelope, LoginRequest, SameProbe, ServerResult, SimulatedAddress,
    SyncHeader, TechnicalInfo, TimeHeader,
};
use ml_core::{codes, ConnectionType, Frame, ModuleDescriptor, ModuleKind, Negotiation};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::correlation::{PendingRequests, PrefixTrie, Promises, RollingId, SubscriptionId};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, Notice, Operation};
use crate::initial_data::{Decoder, InitialDataStore};
use crate::link::{Supervisor, WatchdogAction};
use crate::polling::{Batcher, PollChannel};
use crate::registry::{parse_descriptor, Module, Reading, Registry};
use crate::session::{AccessLevel, AccessSession};
use crate::sync::{SyncOutcome, SyncPhase, SyncRequest, SyncEngine};

/// Where a reply is delivered.
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Work for the actor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Send(String),
    Close,
}

enum Responder {
    Frame(Reply<Frame>),
    Login {
        persist: bool,
        reply: Option<Reply<u32>>,
    },
}

/// Operations on a single module.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleAction {
    SetValue { uid: u32, value: Value },
    RequestConfigs { uid: u32 },
    SaveConfigs { uid: u32, data: Value },
    Rename { uid: u32, name: String },
    Delete { uid: u32 },
    AddSubModule { uid: u32, designator: String, data: Value },
    ChangeAccess { uid: u32, user: u32, user2: u32 },
    InstrumentCommand { uid: u32, command: String, data: Value },
}

impl ModuleAction {
    pub fn uid(&self) -> u32 {
        match self {
            ModuleAction::SetValue { uid, .. }
            | ModuleAction::RequestConfigs { uid }
            | ModuleAction::SaveConfigs { uid, .. }
            | ModuleAction::Rename { uid, .. }
            | ModuleAction::Delete { uid }
            | ModuleAction::AddSubModule { uid, .. }
            | ModuleAction::ChangeAccess { uid, .. }
            | ModuleAction::InstrumentCommand { uid, .. } => *uid,
        }
    }
}

/// Snapshot of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub connected: bool,
    pub synced: bool,
    pub phase: SyncPhase,
    pub save_number: u64,
    pub amount_on_server: u32,
    pub live_modules: usize,
    pub user: u32,
    pub access: AccessLevel,
    pub server_name: String,
    pub version: Option<String>,
    pub clock_offset_ms: i64,
    pub frames_sent: u64,
    pub max_message_size: usize,
}

pub struct ModuleManager {
    config: EngineConfig,
    events: EventBus,
    link: Supervisor,
    sync: SyncEngine,
    registry: Registry,
    pending: PendingRequests<Responder>,
    message_ids: RollingId,
    promises: Promises<u32, Reply<Value>>,
    command_nums: HashMap<u32, RollingId>,
    commands: Promises<(u32, u32), Reply<Value>>,
    frame_subscribers: PrefixTrie<mpsc::UnboundedSender<Frame>>,
    values: Batcher,
    status: Batcher,
    instruments: Batcher,
    session: AccessSession,
    initial: InitialDataStore,
    max_message_size: usize,
    /// Set by technical info, cleared on close.
    connected: bool,
    aborted_by_server: bool,
    frames_sent: u64,
    outbox: VecDeque<Output>,
}

impl ModuleManager {
    /// Creates a manager with the root module seeded and the first connect
    /// attempt due at `now`.
    pub fn new(config: EngineConfig, events: EventBus, now: Instant) -> Self {
        let mut registry = Registry::new();
        if let Err(e) = registry.add(ModuleDescriptor::root()) {
            warn!("failed to seed root module: {}", e);
        }
        let interval = config.timing.poll_interval();
        let batching = &config.batching;
        ModuleManager {
            link: Supervisor::new(&config.timing, now),
            sync: SyncEngine::new(),
            registry,
            pending: PendingRequests::new(),
            message_ids: RollingId::message_ids(),
            promises: Promises::new(),
            command_nums: HashMap::new(),
            commands: Promises::new(),
            frame_subscribers: PrefixTrie::new(),
            values: Batcher::new(PollChannel::Value, batching.max_values_per_message, interval),
            status: Batcher::new(PollChannel::Status, batching.max_status_per_message, interval),
            instruments: Batcher::new(
                PollChannel::Instrument,
                batching.instrument_cap(batching.initial_max_message_size),
                interval,
            ),
            session: AccessSession::new(config.access_token.clone()),
            initial: InitialDataStore::new(),
            max_message_size: batching.initial_max_message_size,
            connected: false,
            aborted_by_server: false,
            frames_sent: 0,
            outbox: VecDeque::new(),
            events,
            config,
        }
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// True between technical info and the next close.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.sync.is_synced()
    }

    pub fn is_shut_down(&self) -> bool {
        self.link.is_shut_down()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn session(&self) -> &AccessSession {
        &self.session
    }

    pub fn batcher(&self, channel: PollChannel) -> &Batcher {
        match channel {
            PollChannel::Value => &self.values,
            PollChannel::Status => &self.status,
            PollChannel::Instrument => &self.instruments,
        }
    }

    fn batcher_mut(&mut self, channel: PollChannel) -> &mut Batcher {
        match channel {
            PollChannel::Value => &mut self.values,
            PollChannel::Status => &mut self.status,
            PollChannel::Instrument => &mut self.instruments,
        }
    }

    pub fn take_outputs(&mut self) -> Vec<Output> {
        self.outbox.drain(..).collect()
    }

    // Link lifecycle

    /// True, and the attempt is considered started, if a connect is due.
    pub fn connect_due(&mut self, now: Instant) -> bool {
        if self.link.connect_due(now) {
            info!("connecting to {}", self.url());
            self.sync.connecting();
            true
        } else {
            false
        }
    }

    pub fn on_open(&mut self, now: Instant) {
        info!("connection open to {}", self.config.host);
        self.link.opened(now);
        self.max_message_size = self.config.batching.initial_max_message_size;
        self.events.emit(EngineEvent::Opened);

        let type_codes = format!("{}{}", codes::CONNECTION_TYPE, self.config.connection_type.code());
        let payload = match self.config.connection_type {
            ConnectionType::FixedSimulated => {
                let ip = self.config.simulated_ip.as_deref().unwrap_or_default();
                match pack_ipv4(ip) {
                    Ok(ip) => serde_json::to_value(SimulatedAddress { ip }).ok(),
                    Err(e) => {
                        warn!("cannot negotiate simulated address: {}", e);
                        None
                    }
                }
            }
            ConnectionType::Settings | ConnectionType::Fixed => None,
        };
        self.send_or_warn(&type_codes, payload);
    }

    pub fn on_connect_failed(&mut self, now: Instant, reason: &str) {
        debug!("connect to {} failed: {}", self.config.host, reason);
        self.link.connect_failed(now);
        self.sync.on_closed();
    }

    /// Handles one inbound socket message.
    pub fn on_text(&mut self, text: &str, now: Instant) {
        self.link.activity(now);
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping inbound message: {}", e);
                return;
            }
        };
        if self.config.logging.should_log(&frame.type_codes) {
            debug!(target: "modlink::wire", "recv {}", text.escape_debug());
        }
        self.dispatch(frame, now);
    }

    /// The socket closed, by the peer, the network or a failed send.
    pub fn on_socket_closed(&mut self, now: Instant) {
        self.handle_closed(now);
    }

    fn handle_closed(&mut self, now: Instant) {
        self.outbox.clear();
        let was_open = self.link.closed(now);
        if std::mem::take(&mut self.connected) {
            info!(
                "connection to {} terminated, reconnecting in {:?}",
                self.config.host,
                self.config.timing.reconnect_delay()
            );
            self.registry.mark_offline();
            self.events.emit(EngineEvent::Closed);
        } else if was_open {
            debug!("connection to {} closed before technical info", self.config.host);
        }
        self.sync.on_closed();
    }

    /// Tears down without any further reconnect.
    pub fn shutdown(&mut self, now: Instant) {
        info!("closing connection to {}", self.config.host);
        self.link.shut_down();
        self.handle_closed(now);
        self.outbox.push_back(Output::Close);
        self.events.emit(EngineEvent::Removed);
    }

    // Timers

    /// Runs everything due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        match self.link.poll_watchdog(now) {
            Some(WatchdogAction::Ping) => self.send_or_warn(codes::PING, None),
            Some(WatchdogAction::Close) => {
                warn!("no traffic from {}, closing", self.config.host);
                self.handle_closed(now);
                self.outbox.push_back(Output::Close);
            }
            None => {}
        }

        for (codes, responder) in self.pending.expire(now) {
            let err = Error::RequestTimeout { codes };
            match responder {
                Responder::Frame(reply) => {
                    let _ = reply.send(Err(err));
                }
                Responder::Login { reply, .. } => {
                    debug!("login failed: {}", err);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
        for (id, reply) in self.promises.expire(now) {
            let _ = reply.send(Err(Error::PromiseTimeout { id }));
        }
        for ((uid, num), reply) in self.commands.expire(now) {
            let _ = reply.send(Err(Error::CommandTimeout { uid, num }));
        }

        for channel in [PollChannel::Value, PollChannel::Status, PollChannel::Instrument] {
            let batches = self.batcher_mut(channel).tick(now);
            if !self.sync.is_synced() {
                continue;
            }
            for batch in batches {
                self.send_or_warn(channel.codes(), Some(json!(batch)));
            }
        }
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.link.next_deadline(),
            self.pending.next_deadline(),
            self.promises.next_deadline(),
            self.commands.next_deadline(),
            self.values.next_deadline(),
            self.status.next_deadline(),
            self.instruments.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // Sending

    /// Queues a frame. Frames over the negotiated size are refused.
    pub fn send_message(&mut self, type_codes: &str, payload: Option<Value>) -> Result<()> {
        if !self.link.is_open() {
            return Err(Error::NotConnected);
        }
        let frame = Frame {
            type_codes: type_codes.to_string(),
            payload,
        };
        let text = frame.encode_within(self.max_message_size).inspect_err(|e| {
            warn!("was not sent: {}", e);
        })?;
        if self.config.logging.should_log(type_codes) {
            debug!(target: "modlink::wire", "send {}", text.escape_debug());
        }
        self.frames_sent += 1;
        self.outbox.push_back(Output::Send(text));
        Ok(())
    }

    fn send_or_warn(&mut self, type_codes: &str, payload: Option<Value>) {
        if let Err(e) = self.send_message(type_codes, payload) {
            debug!("could not send '{}': {}", type_codes, e);
        }
    }

    /// Sends a frame and resolves `reply` with the first inbound frame whose
    /// type codes start with `response_codes`, or with a timeout error.
    pub fn send_message_response(
        &mut self,
        type_codes: &str,
        payload: Option<Value>,
        response_codes: &str,
        timeout: Option<Duration>,
        reply: Reply<Frame>,
        now: Instant,
    ) {
        if let Err(e) = self.send_message(type_codes, payload) {
            let _ = reply.send(Err(e));
            return;
        }
        let deadline = now + self.config.timing.response_timeout(timeout);
        self.pending
            .register(response_codes, deadline, Responder::Frame(reply));
    }

    // Access

    pub fn login(
        &mut self,
        password: &str,
        username: &str,
        reply: Option<Reply<u32>>,
        now: Instant,
    ) {
        let request = AccessSession::password_request(password, username);
        self.request_login(request, true, reply, now);
    }

    pub fn login_with_token(&mut self, token: &str, reply: Option<Reply<u32>>, now: Instant) {
        let request = LoginRequest::Token {
            access_token: token.to_string(),
        };
        self.request_login(request, false, reply, now);
    }

    fn request_login(
        &mut self,
        request: LoginRequest,
        persist: bool,
        reply: Option<Reply<u32>>,
        now: Instant,
    ) {
        let sent = serde_json::to_value(&request)
            .map_err(Error::from)
            .and_then(|payload| self.send_message(codes::LOGIN, Some(payload)));
        if let Err(e) = sent {
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }
        let deadline = now + self.config.timing.response_timeout(None);
        self.pending
            .register(codes::LOGIN, deadline, Responder::Login { persist, reply });
    }

    /// Notifies the device and resets access without waiting for an answer.
    pub fn logout(&mut self) {
        self.send_or_warn(codes::LOGOUT, None);
        self.apply_logout();
    }

    fn apply_logout(&mut self) {
        let old_user = self.session.logout();
        self.events.emit(EngineEvent::AccessChanged {
            user: 0,
            old_user,
            level: AccessLevel::Read,
        });
    }

    fn on_login_response(&mut self, frame: &Frame, persist: bool, reply: Option<Reply<u32>>) {
        let result = self.session.apply_login(frame, persist).map(|outcome| {
            if let Some(old_user) = outcome.changed {
                self.events.emit(EngineEvent::AccessChanged {
                    user: outcome.user,
                    old_user,
                    level: AccessLevel::for_user(outcome.user),
                });
            }
            if let Some(token) = outcome.saved_token {
                self.events.emit(EngineEvent::TokenSaved(token));
            }
            outcome.user
        });
        if let Err(e) = &result {
            debug!("login failed: {}", e);
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    // Numeric-id correlation

    /// Allocates the next message id. Ids wrap after 9999.
    pub fn next_message_id(&mut self) -> u32 {
        self.message_ids.next_id()
    }

    /// Registers `reply` under a fresh message id and returns the id.
    pub fn register_message_promise(
        &mut self,
        reply: Reply<Value>,
        timeout: Option<Duration>,
        now: Instant,
    ) -> u32 {
        let id = self.message_ids.next_id();
        self.register_promise_at(id, reply, timeout, now);
        id
    }

    fn register_promise_at(
        &mut self,
        id: u32,
        reply: Reply<Value>,
        timeout: Option<Duration>,
        now: Instant,
    ) {
        let deadline = now + self.config.timing.command_timeout(timeout);
        if let Some(replaced) = self.promises.register(id, deadline, reply) {
            debug!("message id {} reused before it was answered", id);
            let _ = replaced.send(Err(Error::PromiseTimeout { id }));
        }
    }

    /// Resolves the promise under `id`. False if none is registered.
    pub fn invoke_message_promise(&mut self, id: u32, data: Value) -> bool {
        match self.promises.invoke(id) {
            Some(reply) => {
                let _ = reply.send(Ok(data));
                true
            }
            None => false,
        }
    }

    /// Sends a command to a module and resolves `reply` with its answer.
    pub fn module_command(
        &mut self,
        uid: u32,
        data: Value,
        timeout: Option<Duration>,
        reply: Reply<Value>,
        now: Instant,
    ) {
        if !self.registry.contains(uid) {
            let _ = reply.send(Err(Error::ModuleNotFound(uid)));
            return;
        }
        let num = self
            .command_nums
            .entry(uid)
            .or_insert_with(RollingId::command_nums)
            .next_id();
        let envelope = CommandEnvelope { id: uid, num, data };
        let sent = serde_json::to_value(&envelope)
            .map_err(Error::from)
            .and_then(|payload| self.send_message(codes::COMMAND, Some(payload)));
        if let Err(e) = sent {
            let _ = reply.send(Err(e));
            return;
        }
        let deadline = now + self.config.timing.command_timeout(timeout);
        if let Some(replaced) = self.commands.register((uid, num), deadline, reply) {
            let _ = replaced.send(Err(Error::CommandTimeout { uid, num }));
        }
    }

    // Module actions

    /// Performs an outbound module operation without waiting for an answer.
    pub fn perform(&mut self, action: ModuleAction) -> Result<()> {
        let uid = action.uid();
        if !self.registry.contains(uid) {
            return Err(Error::ModuleNotFound(uid));
        }
        match action {
            ModuleAction::SetValue { uid, value } => {
                let mut payload = Map::new();
                payload.insert(uid.to_string(), value);
                self.send_message(codes::SET_VALUE, Some(Value::Object(payload)))
            }
            ModuleAction::RequestConfigs { uid } => {
                self.send_message(codes::CONFIGS, Some(json!({ "modID": uid })))
            }
            ModuleAction::SaveConfigs { uid, data } => {
                let mid = self.next_message_id();
                self.send_message(
                    codes::SAVE_CONFIGS,
                    Some(json!({ "modID": uid, "mid": mid, "data": data })),
                )
            }
            ModuleAction::Rename { uid, name } => {
                let num = self.next_message_id();
                self.send_message(
                    codes::SAVE_CONFIGS,
                    Some(json!({ "modID": uid, "num": num, "data": { "name": name } })),
                )
            }
            ModuleAction::Delete { uid } => {
                self.send_message(codes::DELETE_MODULE, Some(json!({ "modID": uid })))
            }
            ModuleAction::AddSubModule {
                uid,
                designator,
                data,
            } => {
                if ModuleKind::from_designator(&designator).is_none() {
                    return Err(ml_core::Error::UnknownDesignator(designator).into());
                }
                let num = self.next_message_id();
                self.send_message(
                    codes::ADD_MODULE,
                    Some(json!({ "modID": uid, "des": designator, "num": num, "data": data })),
                )
            }
            ModuleAction::ChangeAccess { uid, user, user2 } => self.send_message(
                codes::ACCESS_CHANGE,
                Some(json!({ "modID": uid, "user": user, "user2": user2 })),
            ),
            ModuleAction::InstrumentCommand { uid, command, data } => {
                self.send_instrument_command(uid, &command, data).map(|_| ())
            }
        }
    }

    /// Sends an instrument command and resolves `reply` when the device
    /// answers with the same `mid`.
    pub fn instrument_command(
        &mut self,
        uid: u32,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
        reply: Reply<Value>,
        now: Instant,
    ) {
        if !self.registry.contains(uid) {
            let _ = reply.send(Err(Error::ModuleNotFound(uid)));
            return;
        }
        match self.send_instrument_command(uid, command, data) {
            Ok(mid) => self.register_promise_at(mid, reply, timeout, now),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn send_instrument_command(&mut self, uid: u32, command: &str, data: Value) -> Result<u32> {
        let mid = self.next_message_id();
        self.send_message(
            codes::INSTRUMENT_COMMAND,
            Some(json!({ "modID": uid, "mid": mid, "command": command, "data": data })),
        )?;
        Ok(mid)
    }

    // Subscriptions

    /// Adds a polling listener for `uid` on `channel`.
    pub fn subscribe(&mut self, channel: PollChannel, uid: u32, now: Instant) -> Result<()> {
        let module = self.registry.get(uid).ok_or(Error::ModuleNotFound(uid))?;
        if channel == PollChannel::Value && !module.has_value() {
            return Err(Error::NotPollable(uid));
        }
        if self.batcher_mut(channel).register(uid, now) {
            debug!("{} polling started", channel);
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, channel: PollChannel, uid: u32) -> bool {
        let removed = self.batcher_mut(channel).deregister(uid);
        if removed && !self.batcher(channel).is_polling() {
            debug!("{} polling stopped", channel);
        }
        removed
    }

    /// Forwards every inbound frame whose codes start with `prefix`.
    pub fn subscribe_frames(
        &mut self,
        prefix: &str,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> SubscriptionId {
        self.frame_subscribers.insert(prefix, tx)
    }

    pub fn unsubscribe_frames(&mut self, id: SubscriptionId) -> bool {
        self.frame_subscribers.remove(id).is_some()
    }

    // Queries

    pub fn module(&self, uid: u32) -> Option<Module> {
        self.registry.get(uid).cloned()
    }

    pub fn modules(&self) -> Vec<Module> {
        self.registry.modules().into_iter().cloned().collect()
    }

    pub fn children(&self, uid: u32) -> Vec<u32> {
        self.registry.children(uid)
    }

    pub fn path(&self, uid: u32) -> Vec<u32> {
        self.registry.path(uid)
    }

    /// Number of live modules, root included.
    pub fn amount(&self) -> usize {
        self.registry.len()
    }

    pub fn status(&self) -> EngineStatus {
        let server = self.sync.server();
        EngineStatus {
            connected: self.connected,
            synced: self.sync.is_synced(),
            phase: self.sync.phase(),
            save_number: self.sync.save_number(),
            amount_on_server: self.sync.amount_on_server(),
            live_modules: self.registry.len(),
            user: self.session.user(),
            access: self.session.level(),
            server_name: server.name.clone(),
            version: server.version.clone(),
            clock_offset_ms: server.clock_offset_ms,
            frames_sent: self.frames_sent,
            max_message_size: self.max_message_size,
        }
    }

    /// Initial data for a designator, or one key of it.
    pub fn initial_data(&self, designator: &str, key: Option<&str>) -> Option<Value> {
        match key {
            Some(key) => self.initial.get_key(designator, key).cloned(),
            None => self.initial.get(designator).cloned().map(Value::Object),
        }
    }

    pub fn register_initial_decoder(&mut self, designator: &str, decoder: Decoder) -> Result<()> {
        self.initial.register(designator, decoder)
    }

    // Dispatch

    fn dispatch(&mut self, frame: Frame, now: Instant) {
        let mut chars = frame.type_codes.chars();
        match (chars.next(), chars.next()) {
            (Some('C'), Some('T')) => self.on_negotiation(&frame),
            (Some('C'), Some('I')) => self.on_technical_info(&frame),
            (Some('C'), Some('r')) => self.events.emit(EngineEvent::ReloadRequested),
            (Some('S'), Some('S')) => self.on_sync_header(&frame),
            (Some('S'), Some('T')) => self.on_time_header(&frame),
            (Some('S'), Some('N')) => self.on_probe(&frame, now),
            (Some('S'), Some('O')) => self.on_module_object(&frame),
            (Some('S'), Some('D')) => self.on_sync_done(now),
            (Some('S'), Some('R')) => self.on_module_removed(&frame),
            (Some('S'), Some('V')) => self.on_readings(PollChannel::Value, &frame),
            (Some('S'), Some('s')) => self.on_readings(PollChannel::Status, &frame),
            (Some('I'), Some('V')) => self.on_instrument_values(&frame),
            (Some('S'), Some('M')) => self.on_configs(&frame),
            (Some('I'), Some('C')) => self.on_instrument_configs(&frame),
            (Some('S'), Some('I')) => {
                if let Some(des) = self.initial.ingest(frame.payload.as_ref()) {
                    debug!("initial data stored for {}", des);
                }
            }
            (Some('S'), Some('C')) => self.on_server_notice(&frame, Operation::Save),
            (Some('S'), Some('A')) => self.on_server_notice(&frame, Operation::AddTo),
            (Some('o'), Some('R')) => self.on_server_notice(&frame, Operation::Rename),
            (Some('a'), Some('C')) => self.on_server_notice(&frame, Operation::ChangeAccess),
            (Some('a'), Some('D')) => self.notice(Notice::AccessDenied),
            (Some('a'), Some('L')) => self.apply_logout(),
            (Some('M'), second) => self.on_command(&frame, second),
            _ => {}
        }

        match self.pending.resolve(&frame.type_codes) {
            Some(Responder::Frame(reply)) => {
                let _ = reply.send(Ok(frame.clone()));
            }
            Some(Responder::Login { persist, reply }) => {
                self.on_login_response(&frame, persist, reply)
            }
            None => {}
        }

        let mut closed = Vec::new();
        for id in self.frame_subscribers.matching(&frame.type_codes) {
            if let Some(tx) = self.frame_subscribers.get(id) {
                if tx.send(frame.clone()).is_err() {
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.frame_subscribers.remove(id);
        }
    }

    fn notice(&self, notice: Notice) {
        info!("{}", notice);
        self.events.emit(EngineEvent::Notice(notice));
    }

    /// Answers on the third type code: `E` not found, `N` access, plus the
    /// operation specific codes.
    fn on_server_notice(&self, frame: &Frame, operation: Operation) {
        match (frame.code(2), operation) {
            (Some('E'), _) => self.notice(Notice::ModuleNotFound),
            (Some('N'), op) => self.notice(Notice::AccessInsufficient(op)),
            (Some('T'), Operation::Rename) => self.notice(Notice::NotRenameable),
            (Some('C'), Operation::Save) => self.notice(Notice::NoDataFound),
            _ => {}
        }
    }

    fn on_negotiation(&mut self, frame: &Frame) {
        let answer = Negotiation::from_code(frame.code(2));
        if answer == Negotiation::Accepted {
            self.send_or_warn(codes::TECHNICAL_INFO, None);
            return;
        }
        if !self.aborted_by_server {
            self.notice(Notice::Refused(answer));
        }
        self.aborted_by_server = true;
    }

    fn on_technical_info(&mut self, frame: &Frame) {
        let info: TechnicalInfo = match frame.payload_as() {
            Ok(info) => info,
            Err(e) => {
                warn!("technical info malformed: {}", e);
                return;
            }
        };
        self.max_message_size = info.buff_size;
        self.connected = true;
        let cap = self.config.batching.instrument_cap(info.buff_size);
        self.instruments.set_cap(cap);
        self.sync.set_version(Some(info.version.clone()));
        self.events.emit(EngineEvent::Connected {
            version: info.version,
        });

        match self.sync.on_connected() {
            SyncRequest::Full => self.start_enumeration(),
            SyncRequest::Probe => self.send_or_warn(codes::SYNC_SAME, None),
        }
    }

    fn start_enumeration(&mut self) {
        if self.sync.once_synced() {
            info!("resync started");
        } else {
            info!("starting sync");
        }
        self.sync.start_sync(self.registry.uids());
        self.send_or_warn(codes::SYNC_START, None);
    }

    fn on_sync_header(&mut self, frame: &Frame) {
        match frame.payload_as::<SyncHeader>() {
            Ok(header) => self.sync.on_header(&header, wall_clock_ms()),
            Err(e) => warn!("sync header malformed: {}", e),
        }
    }

    fn on_time_header(&mut self, frame: &Frame) {
        match frame.payload_as::<TimeHeader>() {
            Ok(header) => self.sync.on_time(&header, wall_clock_ms()),
            Err(e) => warn!("time header malformed: {}", e),
        }
    }

    fn on_probe(&mut self, frame: &Frame, now: Instant) {
        let probe: SameProbe = match frame.payload_as() {
            Ok(probe) => probe,
            Err(e) => {
                warn!("sync header malformed: {}", e);
                return;
            }
        };
        if !self.sync.is_awaiting_probe() {
            debug!("save number answer outside of a resync");
            return;
        }
        if self.sync.on_probe(&probe, self.registry.len()) {
            let outcome = self.sync.finish();
            self.finish_sync(outcome, now);
        } else {
            self.start_enumeration();
        }
    }

    fn on_module_object(&mut self, frame: &Frame) {
        let descriptor = match parse_descriptor(frame.payload.as_ref()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("dropping module object: {}", e);
                return;
            }
        };
        let uid = descriptor.uid;
        if self.sync.is_enumerating() {
            self.apply_descriptor(descriptor);
            let (amount, total) = self.sync.touch(uid);
            self.events.emit(EngineEvent::SyncProgress { amount, total });
        } else if self.sync.is_synced() {
            let num = descriptor.num;
            self.apply_descriptor(descriptor);
            self.registry.link_all();
            if let Some(num) = num {
                self.sync.adopt_save_number(num);
            }
        } else {
            debug!("module object {} outside of a session", uid);
        }
    }

    /// Updates in place when the designator matches, otherwise replaces.
    fn apply_descriptor(&mut self, descriptor: ModuleDescriptor) {
        let uid = descriptor.uid;
        let same_kind = self
            .registry
            .get(uid)
            .map(|m| m.descriptor().designator == descriptor.designator);
        match same_kind {
            Some(true) => match self.registry.update(descriptor) {
                Ok(()) => self.events.emit(EngineEvent::ModuleUpdated { uid }),
                Err(e) => warn!("dropping module update: {}", e),
            },
            Some(false) => {
                self.remove_module(uid);
                self.add_module(descriptor);
            }
            None => self.add_module(descriptor),
        }
    }

    fn add_module(&mut self, descriptor: ModuleDescriptor) {
        match self.registry.add(descriptor) {
            Ok(module) => {
                let event = EngineEvent::ModuleAdded {
                    uid: module.uid(),
                    kind: module.kind(),
                };
                self.events.emit(event);
            }
            Err(e) => warn!("dropping module: {}", e),
        }
    }

    fn remove_module(&mut self, uid: u32) {
        let children = self.registry.children(uid);
        let Some(module) = self.registry.remove(uid) else {
            return;
        };
        self.values.purge(uid);
        self.status.purge(uid);
        self.instruments.purge(uid);
        self.command_nums.remove(&uid);
        self.events
            .emit(EngineEvent::ModuleRemoved { module, children });
    }

    fn on_sync_done(&mut self, now: Instant) {
        match self.sync.on_done() {
            Some(outcome) => self.finish_sync(outcome, now),
            None => debug!("sync done outside of an enumeration"),
        }
    }

    fn finish_sync(&mut self, outcome: SyncOutcome, now: Instant) {
        info!("sync done");
        for uid in outcome.stale {
            self.remove_module(uid);
        }
        self.registry.link_all();
        self.events.emit(if outcome.first {
            EngineEvent::Synced
        } else {
            EngineEvent::Resynced
        });
        self.send_or_warn(codes::SYNC_ACK, None);
        if let Some(request) = self.session.token_request() {
            self.request_login(request, false, None, now);
        }
    }

    fn on_module_removed(&mut self, frame: &Frame) {
        match frame.code(2) {
            Some('E') => self.notice(Notice::ModuleNotFound),
            Some('N') => self.notice(Notice::AccessInsufficient(Operation::Remove)),
            _ => match mod_id(frame) {
                Some(uid) => self.remove_module(uid),
                None => warn!("module removal without modID"),
            },
        }
    }

    fn on_readings(&mut self, channel: PollChannel, frame: &Frame) {
        let Some(object) = frame.object() else {
            return;
        };
        let mut touched = Vec::new();
        for (key, value) in object {
            let Ok(uid) = key.parse::<u32>() else {
                continue;
            };
            let known = match channel {
                PollChannel::Value => self.registry.set_value(uid, Reading::from_wire(value.clone())),
                PollChannel::Status => self.registry.set_status(uid, value.clone()),
                PollChannel::Instrument => self.registry.set_instrument(uid, value.clone()),
            };
            if known {
                touched.push(uid);
            }
        }
        if touched.is_empty() {
            return;
        }
        touched.sort_unstable();
        self.events.emit(match channel {
            PollChannel::Value => EngineEvent::ValuesUpdated(touched),
            PollChannel::Status => EngineEvent::StatusUpdated(touched),
            PollChannel::Instrument => EngineEvent::InstrumentUpdated(touched),
        });
    }

    fn on_instrument_values(&mut self, frame: &Frame) {
        if frame.type_codes.len() <= 2 {
            self.on_readings(PollChannel::Instrument, frame);
            return;
        }
        match ServerResult::from_payload(frame.payload.as_ref()) {
            Some(result) => self.notice(Notice::Failed(result)),
            None => warn!("instrument result malformed"),
        }
    }

    fn on_configs(&mut self, frame: &Frame) {
        match frame.code(2) {
            Some('E') => self.notice(Notice::ModuleNotFound),
            Some('N') => self.notice(Notice::AccessInsufficient(Operation::GetConfigs)),
            _ => self.store_configs(frame),
        }
    }

    fn on_instrument_configs(&mut self, frame: &Frame) {
        match frame.code(2) {
            Some('E') => self.notice(Notice::ModuleNotFound),
            Some('N') => self.notice(Notice::AccessInsufficient(Operation::GetConfigs)),
            _ => {
                let mid = frame
                    .object()
                    .and_then(|o| o.get("mid"))
                    .and_then(Value::as_u64)
                    .and_then(|mid| u32::try_from(mid).ok());
                match (mid, frame.payload.as_ref()) {
                    (Some(mid), Some(payload)) => {
                        let data = payload.get("data").cloned().unwrap_or_else(|| payload.clone());
                        if !self.invoke_message_promise(mid, data) {
                            debug!("no promise waiting on message {}", mid);
                        }
                    }
                    _ => self.store_configs(frame),
                }
            }
        }
    }

    fn store_configs(&mut self, frame: &Frame) {
        let (Some(uid), Some(payload)) = (mod_id(frame), frame.payload.as_ref()) else {
            warn!("configs without modID");
            return;
        };
        if self.registry.set_configs(uid, payload.clone()) {
            self.events.emit(EngineEvent::ConfigsUpdated { uid });
        }
    }

    fn on_command(&mut self, frame: &Frame, second: Option<char>) {
        let envelope = frame.payload_as::<CommandEnvelope>().ok();
        match second {
            Some('A') => {
                self.notice(Notice::AccessInsufficient(Operation::RunCommand));
                if let Some(env) = envelope {
                    self.resolve_command(env.id, env.num, Err(Error::AccessInsufficient(env.id)));
                }
            }
            Some('E') => {
                self.notice(Notice::ModuleNotFound);
                if let Some(env) = envelope {
                    self.resolve_command(env.id, env.num, Err(Error::ModuleNotFound(env.id)));
                }
            }
            Some('R') => {
                if let Some(result) = ServerResult::from_payload(frame.payload.as_ref()) {
                    if !result.success {
                        self.notice(Notice::Failed(result));
                    }
                }
            }
            _ => match envelope {
                Some(env) => self.resolve_command(env.id, env.num, Ok(env.data)),
                None => warn!("command response malformed"),
            },
        }
    }

    fn resolve_command(&mut self, uid: u32, num: u32, result: Result<Value>) {
        match self.commands.invoke((uid, num)) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!("no command {} pending for module {}", num, uid),
        }
    }
}

fn mod_id(frame: &Frame) -> Option<u32> {
    frame
        .object()?
        .get("modID")?
        .as_u64()
        .and_then(|uid| u32::try_from(uid).ok())
}

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
