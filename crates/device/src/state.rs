// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Device state management.
//!
//! [`Device`] is the plain module table plus readings and accounts, and
//! answers one frame at a time. [`DeviceState`] shares it between
//! connections and fans live changes out to every connected client.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use ml_core::protocol::{CommandEnvelope, LoginRequest, SimulatedAddress};
use ml_core::{codes, Frame, ModuleDescriptor, ROOT_UID};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::Result;

const DEFAULT_BUFF_SIZE: usize = 4096;
const PROTOCOL_VERSION: &str = "2.1";

/// Something every connection must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Forward this frame to the client.
    Frame(Frame),
    /// Close the connection.
    Disconnect,
}

#[derive(Debug, Clone)]
struct Account {
    password_hash: String,
    user: u32,
}

/// Protocol state of one client connection.
#[derive(Debug, Default)]
pub struct Session {
    negotiated: bool,
    user: u32,
}

impl Session {
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn user(&self) -> u32 {
        self.user
    }
}

/// The simulated device.
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    buff_size: usize,
    save_number: u64,
    modules: BTreeMap<u32, ModuleDescriptor>,
    values: HashMap<u32, Value>,
    status: HashMap<u32, Value>,
    configs: HashMap<u32, Map<String, Value>>,
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, u32>,
    issued: u64,
}

impl Default for Device {
    fn default() -> Self {
        Device::new("ml-device")
    }
}

impl Device {
    /// A device holding only the root module.
    pub fn new(name: impl Into<String>) -> Self {
        let mut modules = BTreeMap::new();
        modules.insert(ROOT_UID, ModuleDescriptor::root());
        Device {
            name: name.into(),
            buff_size: DEFAULT_BUFF_SIZE,
            save_number: 1,
            modules,
            values: HashMap::new(),
            status: HashMap::new(),
            configs: HashMap::new(),
            accounts: HashMap::new(),
            tokens: HashMap::new(),
            issued: 0,
        }
    }

    /// Replaces the module table. The root is kept if `modules` lacks it.
    pub fn with_modules(mut self, modules: Vec<ModuleDescriptor>) -> Self {
        self.replace_modules(modules);
        self
    }

    pub fn with_buff_size(mut self, buff_size: usize) -> Self {
        self.buff_size = buff_size;
        self
    }

    /// Adds an account. `user` 1 is the administrator.
    pub fn with_user(mut self, username: &str, password: &str, user: u32) -> Self {
        self.accounts.insert(
            username.to_string(),
            Account {
                password_hash: sha1_hex(password),
                user,
            },
        );
        self
    }

    pub fn with_value(mut self, uid: u32, value: Value) -> Self {
        self.values.insert(uid, value);
        self
    }

    pub fn with_configs(mut self, uid: u32, configs: Map<String, Value>) -> Self {
        self.configs.insert(uid, configs);
        self
    }

    /// Reads a JSON array of module objects.
    pub fn load_modules(path: &Path) -> Result<Vec<ModuleDescriptor>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_number(&self) -> u64 {
        self.save_number
    }

    pub fn buff_size(&self) -> usize {
        self.buff_size
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    fn replace_modules(&mut self, modules: Vec<ModuleDescriptor>) {
        self.modules = modules.into_iter().map(|m| (m.uid, m)).collect();
        self.modules
            .entry(ROOT_UID)
            .or_insert_with(ModuleDescriptor::root);
    }

    fn header(&self, now_secs: f64) -> Frame {
        Frame::with_payload(
            codes::SYNC_START,
            json!({
                "amount": self.modules.len(),
                "num": self.save_number,
                "name": self.name,
                "time": now_secs,
                "timeOffset": 0,
            }),
        )
    }

    /// Answers one client frame. Frames the device does not answer yield
    /// nothing.
    pub fn respond(&mut self, frame: &Frame, session: &mut Session, now_secs: f64) -> Vec<Frame> {
        let type_codes = frame.type_codes.as_str();
        if type_codes.starts_with(codes::CONNECTION_TYPE) {
            return vec![self.negotiate(frame, session)];
        }
        if !session.negotiated {
            debug!("ignoring '{}' before negotiation", type_codes);
            return Vec::new();
        }

        match type_codes {
            codes::TECHNICAL_INFO => vec![Frame::with_payload(
                codes::TECHNICAL_INFO,
                json!({"buffSize": self.buff_size, "version": PROTOCOL_VERSION}),
            )],
            codes::SYNC_START => {
                let mut frames = Vec::with_capacity(self.modules.len() + 2);
                frames.push(self.header(now_secs));
                for module in self.modules.values() {
                    if let Ok(object) = serde_json::to_value(module) {
                        frames.push(Frame::with_payload(codes::SYNC_OBJECT, object));
                    }
                }
                frames.push(Frame::new(codes::SYNC_DONE));
                frames
            }
            codes::SYNC_SAME => vec![Frame::with_payload(
                codes::SYNC_SAME,
                json!({"num": self.save_number, "amount": self.modules.len()}),
            )],
            codes::SYNC_ACK => Vec::new(),
            codes::VALUES => vec![self.readings(codes::VALUES, frame, |device, uid| {
                device.values.get(&uid).cloned().unwrap_or(json!(0))
            })],
            codes::STATUS => vec![self.readings(codes::STATUS, frame, |device, uid| {
                device.status.get(&uid).cloned().unwrap_or(json!(0))
            })],
            codes::INSTRUMENT => vec![self.readings(codes::INSTRUMENT, frame, |_, _| json!({}))],
            codes::SET_VALUE => {
                if let Some(object) = frame.object() {
                    for (key, value) in object {
                        if let Ok(uid) = key.parse::<u32>() {
                            self.values.insert(uid, value.clone());
                        }
                    }
                }
                Vec::new()
            }
            codes::PING => vec![Frame::new(codes::PONG)],
            codes::LOGIN => vec![self.login(frame, session)],
            codes::LOGOUT => {
                session.user = 0;
                vec![Frame::new(codes::LOGOUT)]
            }
            codes::COMMAND => self.command(frame),
            codes::CONFIGS => vec![self.configs_of(frame)],
            other => {
                debug!("no answer for '{}'", other);
                Vec::new()
            }
        }
    }

    fn negotiate(&self, frame: &Frame, session: &mut Session) -> Frame {
        let answer = match frame.code(2) {
            Some('S') | Some('F') => 'Y',
            Some('f') if frame.payload_as::<SimulatedAddress>().is_ok() => 'Y',
            Some('f') => 'e',
            _ => 'T',
        };
        session.negotiated = answer == 'Y';
        Frame::new(format!("{}{}", codes::CONNECTION_TYPE, answer))
    }

    /// Answers a poll: the payload is an array of UIDs, the answer an object
    /// keyed by the UIDs the device knows.
    fn readings(
        &self,
        type_codes: &str,
        frame: &Frame,
        read: impl Fn(&Device, u32) -> Value,
    ) -> Frame {
        let uids: Vec<u32> = frame.payload_as().unwrap_or_default();
        let mut answer = Map::new();
        for uid in uids {
            if self.modules.contains_key(&uid) {
                answer.insert(uid.to_string(), read(self, uid));
            }
        }
        Frame::with_payload(type_codes, Value::Object(answer))
    }

    fn login(&mut self, frame: &Frame, session: &mut Session) -> Frame {
        let rejected = Frame::new(format!("{}E", codes::LOGIN));
        let Ok(request) = frame.payload_as::<LoginRequest>() else {
            return rejected;
        };
        match request {
            LoginRequest::Password { password, username } => {
                let Some(account) = self.accounts.get(&username) else {
                    return rejected;
                };
                if account.password_hash != password {
                    return rejected;
                }
                let user = account.user;
                self.issued += 1;
                let token = sha1_hex(&format!("{}:{}", username, self.issued));
                self.tokens.insert(token.clone(), user);
                session.user = user;
                Frame::with_payload(codes::LOGIN, json!({"user": user, "accessToken": token}))
            }
            LoginRequest::Token { access_token } => match self.tokens.get(&access_token) {
                Some(&user) => {
                    session.user = user;
                    Frame::with_payload(codes::LOGIN, json!({"user": user}))
                }
                None => rejected,
            },
        }
    }

    fn command(&self, frame: &Frame) -> Vec<Frame> {
        let Ok(envelope) = frame.payload_as::<CommandEnvelope>() else {
            return Vec::new();
        };
        let answer = if self.modules.contains_key(&envelope.id) {
            Frame::with_payload(codes::COMMAND, json!(envelope))
        } else {
            Frame::with_payload(
                format!("{}E", codes::COMMAND),
                json!({"id": envelope.id, "num": envelope.num}),
            )
        };
        vec![answer]
    }

    fn configs_of(&self, frame: &Frame) -> Frame {
        let uid = frame
            .payload
            .as_ref()
            .and_then(|p| p.get("modID"))
            .and_then(Value::as_u64)
            .and_then(|uid| u32::try_from(uid).ok());
        match uid {
            Some(uid) if self.modules.contains_key(&uid) => {
                let mut payload = self.configs.get(&uid).cloned().unwrap_or_default();
                payload.insert("modID".to_string(), json!(uid));
                Frame::with_payload(codes::CONFIGS, Value::Object(payload))
            }
            _ => Frame::with_payload(format!("{}E", codes::CONFIGS), json!({"modID": uid})),
        }
    }
}

fn sha1_hex(text: &str) -> String {
    hex::encode(Sha1::digest(text.as_bytes()))
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Shared device state for all connections.
#[derive(Clone)]
pub struct DeviceState {
    inner: Arc<DeviceStateInner>,
}

struct DeviceStateInner {
    device: RwLock<Device>,
    push_tx: broadcast::Sender<Push>,
}

impl DeviceState {
    pub fn new(device: Device) -> Self {
        let (push_tx, _) = broadcast::channel(1024);
        DeviceState {
            inner: Arc::new(DeviceStateInner {
                device: RwLock::new(device),
                push_tx,
            }),
        }
    }

    /// A default device seeded with `modules`.
    pub fn with_modules(modules: Vec<ModuleDescriptor>) -> Self {
        Self::new(Device::default().with_modules(modules))
    }

    /// Subscribes to live changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Push> {
        self.inner.push_tx.subscribe()
    }

    pub async fn respond(&self, frame: &Frame, session: &mut Session) -> Vec<Frame> {
        self.inner
            .device
            .write()
            .await
            .respond(frame, session, now_secs())
    }

    pub async fn save_number(&self) -> u64 {
        self.inner.device.read().await.save_number()
    }

    pub async fn module_count(&self) -> usize {
        self.inner.device.read().await.module_count()
    }

    /// Advances the save number so reconnecting clients re-enumerate.
    pub async fn bump_save_number(&self) -> u64 {
        let mut device = self.inner.device.write().await;
        device.save_number += 1;
        device.save_number
    }

    /// Replaces the module table silently and bumps the save number.
    pub async fn set_modules(&self, modules: Vec<ModuleDescriptor>) {
        let mut device = self.inner.device.write().await;
        device.replace_modules(modules);
        device.save_number += 1;
    }

    pub async fn set_value(&self, uid: u32, value: Value) {
        self.inner.device.write().await.values.insert(uid, value);
    }

    pub async fn set_status(&self, uid: u32, status: Value) {
        self.inner.device.write().await.status.insert(uid, status);
    }

    /// Adds or replaces a module and announces it to connected clients.
    pub async fn add_module(&self, mut module: ModuleDescriptor) {
        let mut device = self.inner.device.write().await;
        device.save_number += 1;
        module.num = Some(device.save_number);
        let object = serde_json::to_value(&module);
        device.modules.insert(module.uid, module);
        drop(device);
        if let Ok(object) = object {
            let _ = self
                .inner
                .push_tx
                .send(Push::Frame(Frame::with_payload(codes::SYNC_OBJECT, object)));
        }
    }

    /// Removes a module and announces it. The root cannot be removed.
    pub async fn remove_module(&self, uid: u32) -> bool {
        if uid == ROOT_UID {
            return false;
        }
        let mut device = self.inner.device.write().await;
        if device.modules.remove(&uid).is_none() {
            return false;
        }
        device.save_number += 1;
        drop(device);
        let _ = self.inner.push_tx.send(Push::Frame(Frame::with_payload(
            codes::SYNC_REMOVE,
            json!({"modID": uid}),
        )));
        true
    }

    /// Pushes a value update to every client.
    pub fn push_values(&self, values: Map<String, Value>) {
        let _ = self
            .inner
            .push_tx
            .send(Push::Frame(Frame::with_payload(codes::VALUES, Value::Object(values))));
    }

    /// Closes every open connection.
    pub fn disconnect_all(&self) {
        let _ = self.inner.push_tx.send(Push::Disconnect);
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
