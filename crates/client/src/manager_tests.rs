// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use super::*;
use crate::test_helpers::{object_with_designator, root_object, sync_header, value_object};
use serde_json::json;
use tokio::sync::broadcast;
use yare::parameterized;

const SECOND: Duration = Duration::from_secs(1);
const BIG_BUFFER: usize = 65_536;

struct Harness {
    manager: ModuleManager,
    events: broadcast::Receiver<EngineEvent>,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::new("10.0.0.5"))
    }

    fn with_config(config: EngineConfig) -> Self {
        let bus = EventBus::new(4096);
        let events = bus.subscribe();
        let now = Instant::now();
        Harness {
            manager: ModuleManager::new(config, bus, now),
            events,
            now,
        }
    }

    /// Connected, fully synced over the given module objects, with sent
    /// frames and events drained.
    fn synced(objects: &[Value]) -> Self {
        let mut h = Self::new();
        h.connect(BIG_BUFFER);
        h.enumerate(1, objects);
        h.sent();
        h.events();
        h
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.manager.poll_timers(self.now);
    }

    fn push(&mut self, frame: Frame) {
        self.manager.on_text(&frame.encode(), self.now);
    }

    fn sent(&mut self) -> Vec<Frame> {
        self.manager
            .take_outputs()
            .into_iter()
            .filter_map(|out| match out {
                Output::Send(text) => Some(Frame::decode(&text).unwrap()),
                Output::Close => None,
            })
            .collect()
    }

    fn sent_codes(&mut self) -> Vec<String> {
        self.sent().into_iter().map(|f| f.type_codes).collect()
    }

    fn events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Opens and negotiates; returns the frames sent along the way.
    fn connect(&mut self, buff_size: usize) -> Vec<Frame> {
        assert!(self.manager.connect_due(self.now));
        self.manager.on_open(self.now);
        self.push(Frame::new("CTY"));
        self.push(Frame::with_payload(
            "CI",
            json!({"buffSize": buff_size, "version": "2.1"}),
        ));
        self.sent()
    }

    fn enumerate(&mut self, num: u64, objects: &[Value]) {
        self.push(sync_header(objects.len() as u32, num));
        for object in objects {
            self.push(Frame::with_payload("SO", object.clone()));
        }
        self.push(Frame::new("SD"));
    }

    fn drop_link(&mut self) {
        self.manager.on_socket_closed(self.now);
    }

    fn reconnect(&mut self, buff_size: usize) -> Vec<Frame> {
        self.now += SECOND;
        self.connect(buff_size)
    }
}

fn three_modules() -> Vec<Value> {
    vec![root_object(), value_object(2, 1, 1), value_object(3, 1, 2)]
}

fn count_added(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::ModuleAdded { .. }))
        .count()
}

fn removed_uids(events: &[EngineEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ModuleRemoved { module, .. } => Some(module.uid()),
            _ => None,
        })
        .collect()
}

#[test]
fn root_seeded_before_traffic() {
    let h = Harness::new();
    assert_eq!(h.manager.amount(), 1);
    assert_eq!(h.manager.module(1).unwrap().kind(), ModuleKind::MODMA);
    assert!(!h.manager.is_open());
}

#[test]
fn full_connect_and_sync_scenario() {
    let mut h = Harness::new();
    assert!(h.manager.connect_due(h.now));
    h.manager.on_open(h.now);
    assert_eq!(h.sent_codes(), vec!["CTS"]);

    h.push(Frame::new("CTY"));
    assert_eq!(h.sent_codes(), vec!["CI"]);

    h.push(Frame::with_payload(
        "CI",
        json!({"buffSize": 4096, "version": "2.1"}),
    ));
    assert_eq!(h.manager.batcher(PollChannel::Instrument).cap(), 10);
    assert_eq!(h.manager.status().max_message_size, 4096);
    assert_eq!(h.sent_codes(), vec!["SS"]);

    h.push(sync_header(3, 17));
    for object in three_modules() {
        h.push(Frame::with_payload("SO", object));
        assert!(!h.manager.is_synced());
    }
    h.push(Frame::new("SD"));

    assert!(h.manager.is_synced());
    assert_eq!(h.manager.amount(), 3);
    assert_eq!(h.manager.sync().save_number(), 17);
    assert_eq!(h.sent_codes(), vec!["Sd"]);

    let events = h.events();
    assert_eq!(count_added(&events), 2);
    assert!(events.contains(&EngineEvent::Opened));
    assert!(events.contains(&EngineEvent::Connected {
        version: "2.1".to_string()
    }));
    assert!(events.contains(&EngineEvent::SyncProgress {
        amount: 3,
        total: 3
    }));
    assert_eq!(events.last(), Some(&EngineEvent::Synced));
    assert_eq!(h.manager.children(1), vec![2, 3]);
}

#[test]
fn registry_matches_announced_set() {
    let mut h = Harness::new();
    h.connect(BIG_BUFFER);
    let objects = vec![
        root_object(),
        value_object(7, 1, 1),
        value_object(9, 7, 1),
        object_with_designator(12, 1, "DRIVE"),
    ];
    h.enumerate(3, &objects);
    assert_eq!(h.manager.registry().uids(), vec![1, 7, 9, 12]);
    assert_eq!(h.manager.path(9), vec![1, 7, 9]);
}

#[test]
fn unknown_designator_dropped_without_harm() {
    let mut h = Harness::new();
    h.connect(BIG_BUFFER);
    h.enumerate(
        3,
        &[
            root_object(),
            object_with_designator(4, 1, "ZZZZZ"),
            value_object(5, 1, 1),
            json!({"des": "VABAS"}),
        ],
    );
    assert!(h.manager.is_synced());
    assert_eq!(h.manager.registry().uids(), vec![1, 5]);
}

#[test]
fn resync_removes_missing_and_keeps_identity() {
    let mut h = Harness::synced(&three_modules());
    let before = h.manager.module(3).unwrap().incarnation();

    h.drop_link();
    assert!(h.events().contains(&EngineEvent::Closed));
    let sent = h.reconnect(BIG_BUFFER);
    assert_eq!(sent.last().unwrap().type_codes, "SN");

    h.push(Frame::with_payload("SN", json!({"num": 2, "amount": 2})));
    assert_eq!(h.sent_codes(), vec!["SS"]);

    h.push(sync_header(2, 2));
    h.push(Frame::with_payload("SO", root_object()));
    h.push(Frame::with_payload("SO", value_object(3, 1, 2)));
    assert!(removed_uids(&h.events()).is_empty());
    assert!(h.manager.module(2).is_some());

    h.push(Frame::new("SD"));
    let events = h.events();
    assert_eq!(removed_uids(&events), vec![2]);
    assert_eq!(count_added(&events), 0);
    assert_eq!(events.last(), Some(&EngineEvent::Resynced));
    assert_eq!(h.manager.registry().uids(), vec![1, 3]);
    assert_eq!(h.manager.module(3).unwrap().incarnation(), before);
    assert_eq!(h.manager.children(1), vec![3]);
}

#[test]
fn resync_noop_when_probe_matches() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    h.reconnect(BIG_BUFFER);
    h.events();

    h.push(Frame::with_payload("SN", json!({"num": 1, "amount": 3})));
    assert_eq!(h.sent_codes(), vec!["Sd"]);
    assert!(h.manager.is_synced());
    assert_eq!(h.events(), vec![EngineEvent::Resynced]);
}

#[test]
fn done_before_probe_answer_is_ignored() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    let sent = h.reconnect(BIG_BUFFER);
    assert_eq!(sent.last().unwrap().type_codes, "SN");
    h.events();

    h.push(Frame::new("SD"));
    h.push(Frame::with_payload("SO", value_object(9, 1, 3)));
    assert!(!h.manager.is_synced());
    assert!(h.manager.module(9).is_none());
    assert!(h.sent().is_empty());
    assert!(h.events().is_empty());

    h.push(Frame::with_payload("SN", json!({"num": 1, "amount": 3})));
    assert_eq!(h.sent_codes(), vec!["Sd"]);
    assert!(h.manager.is_synced());

    h.push(Frame::with_payload("SN", json!({"num": 4, "amount": 3})));
    assert!(h.sent().is_empty());
    assert_eq!(h.manager.sync().save_number(), 1);
}

#[test]
fn designator_change_replaces_module() {
    let mut h = Harness::synced(&three_modules());
    let before = h.manager.module(2).unwrap().incarnation();
    h.drop_link();
    h.reconnect(BIG_BUFFER);
    h.push(Frame::with_payload("SN", json!({"num": 9, "amount": 3})));
    h.enumerate(
        9,
        &[
            root_object(),
            object_with_designator(2, 1, "DRIVE"),
            value_object(3, 1, 2),
        ],
    );
    let events = h.events();
    assert_eq!(removed_uids(&events), vec![2]);
    assert_eq!(count_added(&events), 1);
    let module = h.manager.module(2).unwrap();
    assert_eq!(module.kind(), ModuleKind::DRIVE);
    assert_ne!(module.incarnation(), before);
}

#[test]
fn close_during_resync_keeps_modules() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    h.reconnect(BIG_BUFFER);
    h.push(Frame::with_payload("SN", json!({"num": 9, "amount": 3})));
    h.push(sync_header(1, 9));
    h.push(Frame::with_payload("SO", root_object()));
    h.drop_link();
    assert_eq!(h.manager.amount(), 3);
    assert!(removed_uids(&h.events()).is_empty());
    assert_eq!(h.manager.sync().save_number(), 1);
}

#[test]
fn token_relogin_after_sync() {
    let mut config = EngineConfig::new("10.0.0.5");
    config.access_token = Some("cached".to_string());
    let mut h = Harness::with_config(config);
    h.connect(BIG_BUFFER);
    h.enumerate(1, &three_modules());
    let sent = h.sent();
    let codes: Vec<&str> = sent.iter().map(|f| f.type_codes.as_str()).collect();
    assert_eq!(codes, vec!["Sd", "aA"]);
    assert_eq!(sent[1].payload, Some(json!({"accessToken": "cached"})));

    h.push(Frame::with_payload("aA", json!({"user": 1})));
    assert_eq!(h.manager.session().level(), AccessLevel::Write);
    assert!(!h
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::TokenSaved(_))));
}

#[test]
fn refusal_noticed_once() {
    let mut h = Harness::new();
    h.manager.connect_due(h.now);
    h.manager.on_open(h.now);
    h.sent();
    h.push(Frame::new("CTN"));
    h.push(Frame::new("CTT"));
    let notices: Vec<EngineEvent> = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Notice(_)))
        .collect();
    assert_eq!(
        notices,
        vec![EngineEvent::Notice(Notice::Refused(Negotiation::TooManyUsers))]
    );
    assert!(h.sent().is_empty());
}

#[test]
fn connected_only_after_technical_info() {
    let mut h = Harness::new();
    h.manager.connect_due(h.now);
    h.manager.on_open(h.now);
    h.push(Frame::new("CTY"));
    assert!(h.manager.is_open());
    assert!(!h.manager.status().connected);

    h.push(Frame::with_payload(
        "CI",
        json!({"buffSize": 4096, "version": "2.1"}),
    ));
    assert!(h.manager.status().connected);
    assert!(h.manager.is_connected());
}

#[test]
fn refused_sessions_never_report_closed() {
    let mut h = Harness::new();
    for _ in 0..3 {
        assert!(h.manager.connect_due(h.now));
        h.manager.on_open(h.now);
        h.push(Frame::new("CTN"));
        assert!(!h.manager.status().connected);
        h.drop_link();
        h.now += SECOND;
    }
    let events = h.events();
    assert!(!events.contains(&EngineEvent::Closed));
    assert_eq!(
        events.iter().filter(|e| **e == EngineEvent::Opened).count(),
        3
    );
}

#[test]
fn refusal_after_sync_keeps_single_closed() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    h.now += SECOND;
    h.manager.connect_due(h.now);
    h.manager.on_open(h.now);
    h.push(Frame::new("CTA"));
    h.drop_link();
    let closed = h
        .events()
        .into_iter()
        .filter(|e| *e == EngineEvent::Closed)
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn simulated_type_sends_packed_address() {
    let mut config = EngineConfig::new("10.0.0.5");
    config.connection_type = ConnectionType::FixedSimulated;
    config.simulated_ip = Some("192.168.1.1".to_string());
    let mut h = Harness::with_config(config);
    h.manager.connect_due(h.now);
    h.manager.on_open(h.now);
    let sent = h.sent();
    assert_eq!(sent[0].type_codes, "CTf");
    assert_eq!(sent[0].payload, Some(json!({"ip": 3_232_235_777u32})));
}

#[test]
fn send_requires_open_link() {
    let mut h = Harness::new();
    assert!(matches!(
        h.manager.send_message("SV", None),
        Err(Error::NotConnected)
    ));
}

#[test]
fn oversized_frame_not_sent() {
    let mut h = Harness::new();
    h.manager.connect_due(h.now);
    h.manager.on_open(h.now);
    h.sent();
    let frames_before = h.manager.status().frames_sent;
    let big = json!({"blob": "x".repeat(200)});
    assert!(matches!(
        h.manager.send_message("SP", Some(big)),
        Err(Error::Core(ml_core::Error::FrameTooLarge { limit: 100, .. }))
    ));
    assert!(h.sent().is_empty());
    assert_eq!(h.manager.status().frames_sent, frames_before);
}

#[test]
fn response_resolves_once() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .send_message_response("SM", Some(json!({"modID": 2})), "SM", None, tx, h.now);
    assert_eq!(h.sent_codes(), vec!["SM"]);

    h.push(Frame::with_payload("SM", json!({"modID": 2, "gain": 4})));
    let frame = rx.try_recv().unwrap().unwrap();
    assert_eq!(frame.type_codes, "SM");

    h.advance(SECOND * 10);
    assert!(h.manager.pending.is_empty());
}

#[test]
fn response_times_out() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .send_message_response("SM", None, "SM", Some(SECOND), tx, h.now);
    h.advance(SECOND / 2);
    assert!(rx.try_recv().is_err());
    h.advance(SECOND);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::RequestTimeout { codes }) if codes == "SM"
    ));

    h.push(Frame::new("SM"));
    assert!(h.manager.pending.is_empty());
}

#[test]
fn response_send_failure_resolves_immediately() {
    let mut h = Harness::new();
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .send_message_response("SM", None, "SM", None, tx, h.now);
    assert!(matches!(rx.try_recv().unwrap(), Err(Error::NotConnected)));
    assert!(h.manager.pending.is_empty());
}

#[test]
fn oldest_request_wins() {
    let mut h = Harness::synced(&three_modules());
    let (first_tx, mut first) = oneshot::channel();
    let (second_tx, mut second) = oneshot::channel();
    h.manager
        .send_message_response("SM", None, "SM", None, first_tx, h.now);
    h.manager
        .send_message_response("SM", None, "SM", None, second_tx, h.now);
    h.push(Frame::new("SM"));
    assert!(first.try_recv().unwrap().is_ok());
    assert!(second.try_recv().is_err());
    h.push(Frame::new("SME"));
    assert_eq!(second.try_recv().unwrap().unwrap().type_codes, "SME");
}

#[test]
fn watchdog_pings_then_closes_once() {
    let mut h = Harness::synced(&three_modules());
    h.advance(SECOND * 4);
    assert!(h.sent().is_empty());
    h.advance(SECOND);
    assert_eq!(h.sent_codes(), vec!["CP"]);

    h.advance(SECOND * 9);
    assert!(h.manager.take_outputs().is_empty());
    h.advance(SECOND);
    assert_eq!(h.manager.take_outputs(), vec![Output::Close]);
    assert!(!h.manager.is_open());

    h.drop_link();
    h.drop_link();
    let closed = h
        .events()
        .into_iter()
        .filter(|e| *e == EngineEvent::Closed)
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn traffic_defers_watchdog() {
    let mut h = Harness::synced(&three_modules());
    h.advance(SECOND * 4);
    h.push(Frame::new("Cp"));
    h.advance(SECOND * 4);
    assert!(h.sent().is_empty());
    h.advance(SECOND);
    assert_eq!(h.sent_codes(), vec!["CP"]);
}

#[test]
fn repeated_close_schedules_one_reconnect() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    let first = h.manager.link.reconnect_at();
    assert_eq!(first, Some(h.now + SECOND));
    h.now += SECOND / 2;
    h.drop_link();
    assert_eq!(h.manager.link.reconnect_at(), first);

    assert!(!h.manager.connect_due(h.now));
    h.now += SECOND / 2;
    assert!(h.manager.connect_due(h.now));
    assert!(!h.manager.connect_due(h.now));
}

#[test]
fn failed_connect_retries_forever() {
    let mut h = Harness::new();
    for _ in 0..5 {
        assert!(h.manager.connect_due(h.now));
        h.manager.on_connect_failed(h.now, "refused");
        assert!(!h.manager.connect_due(h.now));
        h.now += SECOND;
    }
    assert!(h.events().is_empty());
}

#[parameterized(
    under_cap = { 150, 1 },
    two = { 201, 2 },
    three = { 401, 3 },
)]
fn value_polls_split_by_cap(n: u32, expected: usize) {
    let mut objects = vec![root_object()];
    objects.extend((2..n + 2).map(|uid| value_object(uid, 1, uid)));
    let mut h = Harness::synced(&objects);
    for uid in 2..n + 2 {
        h.manager.subscribe(PollChannel::Value, uid, h.now).unwrap();
    }
    h.advance(SECOND);
    let polls: Vec<Frame> = h
        .sent()
        .into_iter()
        .filter(|f| f.type_codes == "SV")
        .collect();
    assert_eq!(polls.len(), expected);
    let mut total = 0;
    for poll in &polls {
        let uids = poll.payload.as_ref().unwrap().as_array().unwrap();
        assert!(uids.len() <= 200);
        total += uids.len();
    }
    assert_eq!(total, n as usize);
}

#[test]
fn status_polls_use_status_cap() {
    let mut objects = vec![root_object()];
    objects.extend((2..43).map(|uid| value_object(uid, 1, uid)));
    let mut h = Harness::synced(&objects);
    for uid in 2..43 {
        h.manager.subscribe(PollChannel::Status, uid, h.now).unwrap();
    }
    h.advance(SECOND);
    let sizes: Vec<usize> = h
        .sent()
        .into_iter()
        .filter(|f| f.type_codes == "Ss")
        .map(|f| f.payload.unwrap().as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![40, 1]);
}

fn batch_sizes(h: &mut Harness, codes: &str) -> Vec<usize> {
    h.sent()
        .into_iter()
        .filter(|f| f.type_codes == codes)
        .map(|f| f.payload.unwrap().as_array().unwrap().len())
        .collect()
}

#[test]
fn instrument_cap_follows_buffer_size() {
    let mut objects = vec![root_object()];
    objects.extend((2..27).map(|uid| value_object(uid, 1, uid)));
    let mut h = Harness::new();
    h.connect(4096);
    h.enumerate(1, &objects);
    assert_eq!(h.manager.batcher(PollChannel::Instrument).cap(), 10);
    for uid in 2..27 {
        h.manager.subscribe(PollChannel::Instrument, uid, h.now).unwrap();
    }
    h.sent();
    h.advance(SECOND);
    assert_eq!(batch_sizes(&mut h, "IV"), vec![10, 10, 5]);

    h.drop_link();
    h.reconnect(2048);
    assert_eq!(h.manager.batcher(PollChannel::Instrument).cap(), 5);
    h.push(Frame::with_payload("SN", json!({"num": 1, "amount": 26})));
    assert!(h.manager.is_synced());
    h.sent();
    h.advance(SECOND);
    assert_eq!(batch_sizes(&mut h, "IV"), vec![5; 5]);
}

#[test]
fn polls_wait_for_sync() {
    let mut h = Harness::synced(&three_modules());
    h.manager.subscribe(PollChannel::Value, 2, h.now).unwrap();
    h.drop_link();
    h.advance(SECOND);
    assert!(h.sent().is_empty());
    assert!(h.manager.batcher(PollChannel::Value).is_polling());
}

#[test]
fn subscribe_validation() {
    let mut h = Harness::synced(&three_modules());
    assert!(matches!(
        h.manager.subscribe(PollChannel::Value, 1, h.now),
        Err(Error::NotPollable(1))
    ));
    assert!(matches!(
        h.manager.subscribe(PollChannel::Status, 40, h.now),
        Err(Error::ModuleNotFound(40))
    ));
    h.manager.subscribe(PollChannel::Status, 1, h.now).unwrap();
    assert!(h.manager.unsubscribe(PollChannel::Status, 1));
    assert!(!h.manager.batcher(PollChannel::Status).is_polling());
}

#[test]
fn value_push_updates_readings() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload(
        "SV",
        json!({"2": 3.5, "3": "CL", "99": 1}),
    ));
    assert_eq!(h.events(), vec![EngineEvent::ValuesUpdated(vec![2, 3])]);
    assert_eq!(*h.manager.module(2).unwrap().value(), Reading::Live(json!(3.5)));
    assert_eq!(
        *h.manager.module(3).unwrap().value(),
        Reading::Fault("CL".to_string())
    );

    h.push(Frame::with_payload("IV", json!({"2": {"rpm": 900}})));
    assert_eq!(h.events(), vec![EngineEvent::InstrumentUpdated(vec![2])]);

    h.drop_link();
    let module = h.manager.module(2).unwrap();
    assert_eq!(*module.value(), Reading::Offline);
    assert!(module.instrument().is_none());
}

#[test]
fn status_push() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload("Ss", json!({"3": {"alarm": true}})));
    assert_eq!(h.events(), vec![EngineEvent::StatusUpdated(vec![3])]);
    assert_eq!(
        h.manager.module(3).unwrap().status(),
        Some(&json!({"alarm": true}))
    );
}

#[test]
fn instrument_result_becomes_notice() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload(
        "IVR",
        json!({"result": {"code": 4, "reason": "sensor fault", "success": false}}),
    ));
    match h.events().as_slice() {
        [EngineEvent::Notice(Notice::Failed(result))] => {
            assert_eq!(result.reason, "sensor fault")
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn command_round_trip() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .module_command(2, json!({"run": true}), None, tx, h.now);
    let sent = h.sent();
    assert_eq!(sent[0].type_codes, "M");
    assert_eq!(
        sent[0].payload,
        Some(json!({"id": 2, "num": 0, "data": {"run": true}}))
    );

    h.push(Frame::with_payload(
        "M",
        json!({"id": 2, "num": 0, "data": {"done": 1}}),
    ));
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"done": 1}));
}

#[test]
fn command_numbers_are_per_module() {
    let mut h = Harness::synced(&three_modules());
    for uid in [2, 2, 3] {
        let (tx, _rx) = oneshot::channel();
        h.manager.module_command(uid, json!(null), None, tx, h.now);
    }
    let nums: Vec<Value> = h
        .sent()
        .into_iter()
        .map(|f| f.payload.unwrap()["num"].clone())
        .collect();
    assert_eq!(nums, vec![json!(0), json!(1), json!(0)]);
}

#[test]
fn command_access_denied() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager.module_command(2, json!(1), None, tx, h.now);
    h.push(Frame::with_payload("MA", json!({"id": 2, "num": 0})));
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::AccessInsufficient(2))
    ));
    assert!(h.events().contains(&EngineEvent::Notice(Notice::AccessInsufficient(
        Operation::RunCommand
    ))));
}

#[test]
fn command_timeout_and_unknown_module() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager.module_command(2, json!(1), None, tx, h.now);
    h.advance(SECOND * 3);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::CommandTimeout { uid: 2, num: 0 })
    ));

    let (tx, mut rx) = oneshot::channel();
    h.manager.module_command(77, json!(1), None, tx, h.now);
    assert!(matches!(rx.try_recv().unwrap(), Err(Error::ModuleNotFound(77))));
}

#[test]
fn failed_command_result_noticed() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload(
        "MR",
        json!({"result": {"code": 1, "reason": "busy", "success": false}}),
    ));
    h.push(Frame::with_payload(
        "MR",
        json!({"result": {"code": 0, "reason": "", "success": true}}),
    ));
    let notices = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Notice(_)))
        .count();
    assert_eq!(notices, 1);
}

#[test]
fn message_promises() {
    let mut h = Harness::new();
    let (tx, mut rx) = oneshot::channel();
    let id = h.manager.register_message_promise(tx, None, h.now);
    assert_eq!(id, 1);
    assert!(h.manager.invoke_message_promise(id, json!("ok")));
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!("ok"));
    assert!(!h.manager.invoke_message_promise(id, json!("again")));

    let (tx, mut rx) = oneshot::channel();
    let id = h.manager.register_message_promise(tx, Some(SECOND), h.now);
    h.advance(SECOND);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::PromiseTimeout { id: timed_out }) if timed_out == id
    ));
}

#[test]
fn instrument_command_awaits_mid() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .instrument_command(2, "zero", json!({}), None, tx, h.now);
    let frame = h.sent().remove(0);
    assert_eq!(frame.type_codes, "IC");
    let mid = frame.payload.as_ref().unwrap()["mid"].as_u64().unwrap();

    h.push(Frame::with_payload(
        "IC",
        json!({"modID": 2, "mid": mid, "data": {"zeroed": true}}),
    ));
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"zeroed": true}));
    assert!(h.manager.module(2).unwrap().configs().is_none());
}

#[test]
fn instrument_command_fails_fast_when_offline() {
    let mut h = Harness::synced(&three_modules());
    h.drop_link();
    let (tx, mut rx) = oneshot::channel();
    h.manager
        .instrument_command(2, "zero", json!({}), None, tx, h.now);
    assert!(matches!(rx.try_recv().unwrap(), Err(Error::NotConnected)));
    assert!(h.manager.promises.is_empty());
}

#[test]
fn instrument_configs_without_mid_are_stored() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload("IC", json!({"modID": 2, "range": 10})));
    assert_eq!(h.events(), vec![EngineEvent::ConfigsUpdated { uid: 2 }]);
}

#[parameterized(
    set_value = {
        ModuleAction::SetValue { uid: 2, value: json!(5) },
        "SP", json!({"2": 5})
    },
    request_configs = {
        ModuleAction::RequestConfigs { uid: 2 },
        "SM", json!({"modID": 2})
    },
    save_configs = {
        ModuleAction::SaveConfigs { uid: 2, data: json!({"gain": 2}) },
        "SC", json!({"modID": 2, "mid": 1, "data": {"gain": 2}})
    },
    rename = {
        ModuleAction::Rename { uid: 2, name: "Pump".to_string() },
        "SC", json!({"modID": 2, "num": 1, "data": {"name": "Pump"}})
    },
    delete = {
        ModuleAction::Delete { uid: 3 },
        "SD", json!({"modID": 3})
    },
    add_sub_module = {
        ModuleAction::AddSubModule { uid: 1, designator: "DRIVE".to_string(), data: json!({}) },
        "SA", json!({"modID": 1, "des": "DRIVE", "num": 1, "data": {}})
    },
    change_access = {
        ModuleAction::ChangeAccess { uid: 2, user: 3, user2: 4 },
        "aC", json!({"modID": 2, "user": 3, "user2": 4})
    },
)]
fn actions_encode(action: ModuleAction, codes: &str, payload: Value) {
    let mut h = Harness::synced(&three_modules());
    h.manager.perform(action).unwrap();
    let frame = h.sent().remove(0);
    assert_eq!(frame.type_codes, codes);
    assert_eq!(frame.payload, Some(payload));
}

#[test]
fn action_validation() {
    let mut h = Harness::synced(&three_modules());
    assert!(matches!(
        h.manager.perform(ModuleAction::Delete { uid: 55 }),
        Err(Error::ModuleNotFound(55))
    ));
    assert!(matches!(
        h.manager.perform(ModuleAction::AddSubModule {
            uid: 1,
            designator: "NOPE1".to_string(),
            data: json!({}),
        }),
        Err(Error::Core(ml_core::Error::UnknownDesignator(_)))
    ));
    assert!(h.sent().is_empty());
}

#[test]
fn server_removal() {
    let mut objects = three_modules();
    objects.push(value_object(4, 3, 1));
    let mut h = Harness::synced(&objects);
    h.manager.subscribe(PollChannel::Value, 3, h.now).unwrap();

    h.push(Frame::with_payload("SR", json!({"modID": 3})));
    match h.events().as_slice() {
        [EngineEvent::ModuleRemoved { module, children }] => {
            assert_eq!(module.uid(), 3);
            assert_eq!(children, &vec![4]);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(h.manager.module(3).is_none());
    assert!(h.manager.children(3).is_empty());
    assert!(!h.manager.batcher(PollChannel::Value).is_polling());
    assert_eq!(h.manager.amount(), 3);
}

#[parameterized(
    not_found = { "SRE", Notice::ModuleNotFound },
    no_access = { "SRN", Notice::AccessInsufficient(Operation::Remove) },
    rename_denied = { "oRN", Notice::AccessInsufficient(Operation::Rename) },
    not_renameable = { "oRT", Notice::NotRenameable },
    add_denied = { "SAN", Notice::AccessInsufficient(Operation::AddTo) },
    save_missing = { "SCC", Notice::NoDataFound },
    save_denied = { "SCN", Notice::AccessInsufficient(Operation::Save) },
    configs_denied = { "SMN", Notice::AccessInsufficient(Operation::GetConfigs) },
    access_change_denied = { "aCN", Notice::AccessInsufficient(Operation::ChangeAccess) },
    access_denied = { "aD", Notice::AccessDenied },
    command_module_missing = { "ME", Notice::ModuleNotFound },
)]
fn server_notices(codes: &str, expected: Notice) {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload(codes, json!({})));
    assert_eq!(h.events(), vec![EngineEvent::Notice(expected)]);
    assert_eq!(h.manager.amount(), 3);
}

#[test]
fn live_module_added_after_sync() {
    let mut h = Harness::synced(&three_modules());
    let mut object = value_object(8, 2, 1);
    object["num"] = json!(44);
    h.push(Frame::with_payload("SO", object));
    assert_eq!(
        h.events(),
        vec![EngineEvent::ModuleAdded {
            uid: 8,
            kind: ModuleKind::VABAS
        }]
    );
    assert_eq!(h.manager.children(2), vec![8]);
    assert_eq!(h.manager.sync().save_number(), 44);
}

#[test]
fn configs_stored() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload("SM", json!({"modID": 2, "gain": 7})));
    assert_eq!(h.events(), vec![EngineEvent::ConfigsUpdated { uid: 2 }]);
    assert_eq!(
        h.manager.module(2).unwrap().configs(),
        Some(&json!({"modID": 2, "gain": 7}))
    );
}

#[test]
fn password_login_and_logout() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager.login("abc", "admin", Some(tx), h.now);
    let frame = h.sent().remove(0);
    assert_eq!(frame.type_codes, "aA");
    assert_eq!(
        frame.payload,
        Some(json!({"password": "a9993e364706816aba3e25717850c26c9cd0d89d", "username": "admin"}))
    );

    h.push(Frame::with_payload(
        "aA",
        json!({"user": 1, "accessToken": "fresh"}),
    ));
    assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
    assert_eq!(
        h.events(),
        vec![
            EngineEvent::AccessChanged {
                user: 1,
                old_user: 0,
                level: AccessLevel::Write
            },
            EngineEvent::TokenSaved("fresh".to_string()),
        ]
    );

    h.manager.logout();
    assert_eq!(h.sent_codes(), vec!["aL"]);
    assert_eq!(h.manager.session().user(), 0);
    assert!(h.manager.session().token().is_none());
}

#[test]
fn rejected_login() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = oneshot::channel();
    h.manager.login("bad", "admin", Some(tx), h.now);
    h.push(Frame::new("aAE"));
    assert!(matches!(rx.try_recv().unwrap(), Err(Error::LoginRejected)));
    assert!(h.events().is_empty());
}

#[test]
fn server_logout() {
    let mut h = Harness::synced(&three_modules());
    h.manager.login_with_token("tok", None, h.now);
    h.push(Frame::with_payload("aA", json!({"user": 3})));
    h.events();
    h.push(Frame::new("aL"));
    assert_eq!(
        h.events(),
        vec![EngineEvent::AccessChanged {
            user: 0,
            old_user: 3,
            level: AccessLevel::Read
        }]
    );
}

#[test]
fn initial_data_ingested() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::with_payload(
        "SI",
        json!({"des": "WLOCA", "cards": {"750-430": {"inputs": 8}}}),
    ));
    assert_eq!(
        h.manager.initial_data("WLOCA", Some("cards")),
        Some(json!({"750-430": {"inputs": 8}}))
    );
    assert!(h.manager.initial_data("WLOCA", None).is_some());
    assert!(h.manager.initial_data("DRIVE", None).is_none());
}

#[test]
fn frame_subscribers() {
    let mut h = Harness::synced(&three_modules());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = h.manager.subscribe_frames("S", tx);
    h.push(Frame::with_payload("SV", json!({})));
    h.push(Frame::new("Cp"));
    assert_eq!(rx.try_recv().unwrap().type_codes, "SV");
    assert!(rx.try_recv().is_err());

    drop(rx);
    h.push(Frame::new("Ss"));
    assert!(!h.manager.unsubscribe_frames(id));
}

#[test]
fn reload_request() {
    let mut h = Harness::synced(&three_modules());
    h.push(Frame::new("Cr"));
    assert_eq!(h.events(), vec![EngineEvent::ReloadRequested]);
}

#[test]
fn malformed_frames_skipped() {
    let mut h = Harness::synced(&three_modules());
    h.manager.on_text("no marker", h.now);
    h.manager.on_text("\u{1D}SS\u{1F}{broken", h.now);
    h.push(Frame::with_payload("SS", json!("not a header")));
    h.push(Frame::with_payload("ST", json!(5)));
    assert!(h.events().is_empty());
    assert!(h.manager.is_synced());
}

#[test]
fn shutdown_stops_reconnects() {
    let mut h = Harness::synced(&three_modules());
    h.manager.shutdown(h.now);
    assert_eq!(h.manager.take_outputs(), vec![Output::Close]);
    assert_eq!(h.events(), vec![EngineEvent::Closed, EngineEvent::Removed]);
    h.now += SECOND * 60;
    assert!(!h.manager.connect_due(h.now));
    assert!(h.manager.is_shut_down());
    assert!(h.manager.next_deadline().is_none());
}

#[test]
fn status_snapshot() {
    let mut h = Harness::synced(&three_modules());
    let status = h.manager.status();
    assert!(status.connected);
    assert!(status.synced);
    assert_eq!(status.phase, SyncPhase::Synced);
    assert_eq!(status.save_number, 1);
    assert_eq!(status.amount_on_server, 3);
    assert_eq!(status.live_modules, 3);
    assert_eq!(status.server_name, "Test device");
    assert_eq!(status.version.as_deref(), Some("2.1"));
    assert_eq!(status.access, AccessLevel::Read);
    h.drop_link();
    assert!(!h.manager.status().connected);
}
