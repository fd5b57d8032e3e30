//! Gateway command routing tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use common::{OWN, RecordedGateway, SimGateway, settle};
use meshlink_gateway::db::MemoryStore;
use meshlink_gateway::mesh::{Address, Capability, GROUP_ADDRESS, MeshEvent, Opcode};
use meshlink_gateway::router::{Dispatch, MonitorState, PendingSend};

fn vendor_reply(source: Address, text: &str) -> MeshEvent {
    MeshEvent::Reply {
        source,
        opcode: Opcode::VendorStatus,
        payload: text.as_bytes().to_vec(),
        in_reply_to: Opcode::VendorSend,
    }
}

fn vendor_timeout(target: Address) -> MeshEvent {
    MeshEvent::Timeout {
        target,
        opcode: Opcode::VendorSend,
    }
}

fn payloads(gw: &RecordedGateway) -> Vec<(Address, String)> {
    gw.transport
        .sends()
        .into_iter()
        .map(|m| (m.dst, String::from_utf8(m.payload).unwrap()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unicast_duty_gets_sent_and_reading() {
    let gw = SimGateway::start(2).await;

    let dispatch = gw.router.handle_command("1:DUTY:40").await;
    assert_eq!(dispatch, Dispatch::Unicast(Address(0x0006)));
    settle().await;

    let messages = gw.notifier.messages();
    assert!(messages.contains(&"SENT:DUTY".to_string()));
    assert!(messages.contains(&"DEVICE1:DATA:D:40%,V:12.000V,I:200.00mA,P:2400.0mW".to_string()));
    assert!(gw.notifier.frames().len() > messages.len(), "reading should span frames");

    assert_eq!(gw.node_load(1).duty(), 40);
    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert_eq!(gw.router.known_nodes(), vec![Address(0x0006)]);
}

#[tokio::test(start_paused = true)]
async fn duty_without_value_uses_default() {
    let gw = SimGateway::start(2).await;

    gw.router.handle_command("2:duty").await;
    settle().await;

    assert_eq!(gw.node_load(2).duty(), 50);
    assert!(gw.notifier.messages().contains(&"SENT:DUTY".to_string()));
}

#[tokio::test(start_paused = true)]
async fn all_reaches_every_node_and_this_device() {
    let gw = SimGateway::start(2).await;

    let dispatch = gw.router.handle_command("ALL:DUTY:60").await;
    assert_eq!(dispatch, Dispatch::Group(GROUP_ADDRESS));
    settle().await;

    assert_eq!(gw.load.duty(), 60);
    assert_eq!(gw.node_load(1).duty(), 60);
    assert_eq!(gw.node_load(2).duty(), 60);

    let messages = gw.notifier.messages();
    for id in 0..=2 {
        assert!(
            messages
                .iter()
                .any(|m| m.starts_with(&format!("DEVICE{id}:DATA:D:60%"))),
            "no reading from device {id}: {messages:?}"
        );
    }
    let mut known = gw.router.known_nodes();
    known.sort();
    assert_eq!(known, vec![Address(0x0006), Address(0x0007)]);
}

#[tokio::test(start_paused = true)]
async fn all_runs_locally_then_sends_once_to_group() {
    let gw = RecordedGateway::new().bound().await;

    let dispatch = gw.router.handle_command("ALL:DUTY:30").await;
    assert_eq!(dispatch, Dispatch::Group(GROUP_ADDRESS));

    assert_eq!(gw.load.duty(), 30);
    assert_eq!(payloads(&gw), vec![(GROUP_ADDRESS, "duty:30".to_string())]);
    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert_eq!(
        gw.notifier.messages(),
        vec![
            "DEVICE0:DATA:D:30%,V:12.000V,I:150.00mA,P:1800.0mW".to_string(),
            "SENT:DUTY".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn own_index_runs_locally() {
    let gw = RecordedGateway::new().bound().await;
    gw.load.set_duty(80);

    let dispatch = gw.router.handle_command("0:STOP").await;
    assert_eq!(dispatch, Dispatch::Local);

    assert!(gw.transport.sends().is_empty());
    assert_eq!(gw.load.duty(), 0);
    assert_eq!(
        gw.notifier.messages(),
        vec!["DEVICE0:DATA:D:0%,V:12.000V,I:0.00mA,P:0.0mW".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn second_unicast_waits_for_reply() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("1:ON").await;
    assert!(matches!(
        gw.router.pending_send(),
        PendingSend::InFlight { target, .. } if target == Address(0x0006)
    ));

    let waiter = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gw.transport.sends().len(), 1, "second send left early");
        gw.router
            .handle_event(vendor_reply(Address(0x0006), "D:0%"))
            .await;
    };
    let (dispatch, ()) = tokio::join!(gw.router.handle_command("2:OFF"), waiter);
    assert_eq!(dispatch, Dispatch::Unicast(Address(0x0007)));

    assert_eq!(
        payloads(&gw),
        vec![
            (Address(0x0006), "r".to_string()),
            (Address(0x0007), "s".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_send_is_reclaimed_at_ceiling() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("1:READ").await;
    let started = Instant::now();
    gw.router.handle_command("2:READ").await;

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(gw.transport.sends().len(), 2);
    assert!(matches!(
        gw.router.pending_send(),
        PendingSend::InFlight { target, .. } if target == Address(0x0007)
    ));
}

#[tokio::test(start_paused = true)]
async fn fallback_on_off_without_vendor_binding() {
    let gw = RecordedGateway::new().keyed().await;
    gw.notifier.clear();

    let dispatch = gw.router.handle_command("1:ON").await;
    assert_eq!(dispatch, Dispatch::Fallback(vec![Address(0x0006)]));

    let dispatch = gw.router.handle_command("ALL:OFF").await;
    assert_eq!(dispatch, Dispatch::Fallback(vec![Address(0x0006)]));

    let sends = gw.transport.sends();
    assert_eq!(sends.len(), 2);
    assert!(sends.iter().all(|m| m.opcode == Opcode::OnOffSet));
    assert_eq!(sends[0].payload[0], 1);
    assert_eq!(sends[1].payload[0], 0);
    // transaction id moves on
    assert_ne!(sends[0].payload[1], sends[1].payload[1]);

    assert_eq!(
        gw.notifier.messages(),
        vec!["SENT:ON(fallback)".to_string(), "SENT:OFF(fallback)".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn fallback_all_walks_known_nodes() {
    let gw = RecordedGateway::new().keyed().await;
    gw.router
        .handle_event(vendor_reply(Address(0x0006), "D:0%"))
        .await;
    gw.router
        .handle_event(vendor_reply(Address(0x0008), "D:0%"))
        .await;

    let started = Instant::now();
    let dispatch = gw.router.handle_command("ALL:DUTY:10").await;

    assert_eq!(dispatch, Dispatch::Fallback(vec![Address(0x0006), Address(0x0008)]));
    assert!(started.elapsed() >= Duration::from_millis(20));
    let targets: Vec<Address> = gw.transport.sends().iter().map(|m| m.dst).collect();
    assert_eq!(targets, vec![Address(0x0006), Address(0x0008)]);
}

#[tokio::test(start_paused = true)]
async fn fallback_reports_refused_send() {
    let gw = RecordedGateway::new().keyed().await;
    gw.notifier.clear();
    gw.transport.set_fail_sends(true);

    let dispatch = gw.router.handle_command("1:ON").await;

    assert_eq!(dispatch, Dispatch::Failed);
    assert_eq!(gw.notifier.messages(), vec!["ERROR:MESH_SEND_FAIL".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn fallback_all_reports_each_refused_node() {
    let gw = RecordedGateway::new().keyed().await;
    gw.router
        .handle_event(vendor_reply(Address(0x0006), "D:0%"))
        .await;
    gw.router
        .handle_event(vendor_reply(Address(0x0008), "D:0%"))
        .await;
    gw.notifier.clear();
    gw.transport.refuse(Address(0x0008));

    let dispatch = gw.router.handle_command("ALL:ON").await;

    assert_eq!(dispatch, Dispatch::Fallback(vec![Address(0x0006), Address(0x0008)]));
    assert_eq!(
        gw.notifier.messages(),
        vec!["ERROR:MESH_SEND_FAIL".to_string(), "SENT:ON(fallback)".to_string()]
    );

    gw.notifier.clear();
    gw.transport.set_fail_sends(true);
    let dispatch = gw.router.handle_command("ALL:OFF").await;

    assert_eq!(dispatch, Dispatch::Failed);
    assert_eq!(gw.notifier.messages(), vec!["ERROR:MESH_SEND_FAIL".to_string(); 2]);
}

#[tokio::test(start_paused = true)]
async fn not_ready_without_application_key() {
    let gw = RecordedGateway::new();

    let dispatch = gw.router.handle_command("1:ON").await;
    assert_eq!(dispatch, Dispatch::Rejected("ERROR:NOT_READY".to_string()));
    assert!(gw.transport.sends().is_empty());
    assert_eq!(gw.notifier.messages(), vec!["ERROR:NOT_READY".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn malformed_commands_are_answered() {
    let gw = RecordedGateway::new().bound().await;

    for input in [":ON", "1", "1:", "42:ON", "x:ON", "1:BLINK"] {
        assert!(matches!(
            gw.router.handle_command(input).await,
            Dispatch::Rejected(_)
        ));
    }

    assert!(gw.transport.sends().is_empty());
    assert_eq!(
        gw.notifier.messages(),
        vec![
            "ERROR:NO_NODE_ID",
            "ERROR:NO_COMMAND",
            "ERROR:NO_COMMAND",
            "ERROR:INVALID_NODE",
            "ERROR:INVALID_NODE",
            "ERROR:UNKNOWN_CMD:BLINK",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn monitor_polls_until_another_command() {
    let gw = RecordedGateway::new().bound().await;

    let dispatch = gw.router.handle_command("1:MONITOR").await;
    assert_eq!(dispatch, Dispatch::MonitorArmed(Address(0x0006)));
    assert_eq!(gw.notifier.messages(), vec!["SENT:MONITOR".to_string()]);
    assert!(gw.transport.sends().is_empty());

    tokio::time::sleep(Duration::from_millis(110)).await;
    assert_eq!(payloads(&gw), vec![(Address(0x0006), "read".to_string())]);
    assert_eq!(
        gw.router.monitor_state(),
        MonitorState::Armed {
            target: Address(0x0006),
            awaiting_reply: true
        }
    );

    // unanswered poll holds the next tick back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gw.transport.sends().len(), 1);

    gw.router
        .handle_event(vendor_reply(Address(0x0006), "D:0%"))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gw.transport.sends().len(), 2);

    // last poll is never answered; the stop goes out after the bounded wait
    gw.router.handle_command("1:STOP").await;
    assert_eq!(gw.router.monitor_state(), MonitorState::Idle);
    assert_eq!(
        payloads(&gw).last(),
        Some(&(Address(0x0006), "s".to_string()))
    );

    let sent = gw.transport.sends().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(gw.transport.sends().len(), sent);
}

#[tokio::test(start_paused = true)]
async fn monitor_skips_poll_while_send_in_flight() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("2:ON").await;
    gw.router.handle_command("1:MONITOR").await;
    tokio::time::sleep(Duration::from_millis(110)).await;

    assert_eq!(payloads(&gw), vec![(Address(0x0007), "r".to_string())]);
    assert_eq!(
        gw.router.monitor_state(),
        MonitorState::Armed {
            target: Address(0x0006),
            awaiting_reply: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn monitor_all_picks_first_known_node() {
    let gw = RecordedGateway::new().bound().await;

    let dispatch = gw.router.handle_command("ALL:MONITOR").await;
    assert_eq!(dispatch, Dispatch::MonitorArmed(Address(0x0006)));

    gw.router
        .handle_event(vendor_reply(Address(0x0009), "D:0%"))
        .await;
    let dispatch = gw.router.handle_command("ALL:MONITOR").await;
    assert_eq!(dispatch, Dispatch::MonitorArmed(Address(0x0009)));
}

#[tokio::test(start_paused = true)]
async fn monitor_needs_vendor_binding() {
    let gw = RecordedGateway::new().keyed().await;

    let dispatch = gw.router.handle_command("1:MONITOR").await;
    assert_eq!(dispatch, Dispatch::Rejected("ERROR:NOT_READY".to_string()));
    assert_eq!(gw.router.monitor_state(), MonitorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn timeouts_reported_only_outside_monitoring() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("1:READ").await;
    gw.router.handle_event(vendor_timeout(Address(0x0006))).await;
    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert!(gw.notifier.messages().contains(&"ERROR:MESH_TIMEOUT".to_string()));

    gw.notifier.clear();
    gw.router.handle_command("1:MONITOR").await;
    tokio::time::sleep(Duration::from_millis(110)).await;
    gw.router.handle_event(vendor_timeout(Address(0x0006))).await;

    assert_eq!(gw.notifier.messages(), vec!["SENT:MONITOR".to_string()]);
    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert_eq!(
        gw.router.monitor_state(),
        MonitorState::Armed {
            target: Address(0x0006),
            awaiting_reply: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_with_nothing_in_flight_is_ignored() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("ALL:READ").await;
    gw.notifier.clear();
    gw.router.handle_event(vendor_timeout(GROUP_ADDRESS)).await;
    gw.router.handle_event(vendor_timeout(Address(0x0006))).await;

    assert!(gw.notifier.messages().is_empty());
    assert!(!gw.router.is_discovery_complete());
}

#[tokio::test(start_paused = true)]
async fn timeout_past_known_range_completes_discovery() {
    let gw = RecordedGateway::new().bound().await;
    gw.router
        .handle_event(vendor_reply(Address(0x0006), "D:0%"))
        .await;

    gw.router.handle_command("1:READ").await;
    gw.router.handle_event(vendor_timeout(Address(0x0006))).await;
    assert!(!gw.router.is_discovery_complete());

    gw.router.handle_command("3:READ").await;
    gw.router.handle_event(vendor_timeout(Address(0x0008))).await;
    assert!(gw.router.is_discovery_complete());

    // a new node reopens discovery
    gw.router
        .handle_event(vendor_reply(Address(0x0007), "D:0%"))
        .await;
    assert!(!gw.router.is_discovery_complete());
}

#[tokio::test(start_paused = true)]
async fn on_off_replies_and_timeouts_are_forwarded() {
    let gw = RecordedGateway::new().keyed().await;
    gw.notifier.clear();

    gw.router
        .handle_event(MeshEvent::Reply {
            source: Address(0x0006),
            opcode: Opcode::OnOffStatus,
            payload: vec![1],
            in_reply_to: Opcode::OnOffSet,
        })
        .await;
    gw.router
        .handle_event(MeshEvent::Timeout {
            target: Address(0x0007),
            opcode: Opcode::OnOffSet,
        })
        .await;

    assert_eq!(
        gw.notifier.messages(),
        vec![
            "DEVICE1:ACK:1".to_string(),
            "DEVICE2:TIMEOUT:0x0007".to_string(),
        ]
    );
    // on/off replies do not teach the tracker
    assert!(gw.router.known_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transport_refusal_reports_send_failure() {
    let gw = RecordedGateway::new().bound().await;
    gw.transport.set_fail_sends(true);

    let dispatch = gw.router.handle_command("1:ON").await;
    assert_eq!(dispatch, Dispatch::Failed);
    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert_eq!(gw.notifier.messages(), vec!["ERROR:MESH_SEND_FAIL".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn late_send_failure_releases_slot() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_command("1:ON").await;
    gw.router
        .handle_event(MeshEvent::SendFailed {
            target: Address(0x0006),
            reason: "no route".to_string(),
        })
        .await;

    assert_eq!(gw.router.pending_send(), PendingSend::Idle);
    assert!(gw.notifier.messages().contains(&"ERROR:MESH_SEND_FAIL".to_string()));
}

#[tokio::test(start_paused = true)]
async fn own_echo_is_dropped() {
    let gw = RecordedGateway::new().bound().await;

    gw.router.handle_event(vendor_reply(OWN, "D:0%")).await;

    assert!(gw.notifier.messages().is_empty());
    assert!(gw.router.known_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn binding_events_announce_readiness() {
    let gw = RecordedGateway::new().keyed().await;

    gw.router
        .handle_event(MeshEvent::ModelBound {
            model: Capability::ActuatorClient.model(),
            app_index: 0,
        })
        .await;
    assert!(!gw.router.gateway_state().vendor_bound);

    gw.router
        .handle_event(MeshEvent::ModelBound {
            model: Capability::VendorClient.model(),
            app_index: 0,
        })
        .await;

    let state = gw.router.gateway_state();
    assert!(state.vendor_bound);
    assert_eq!(state.own_address, OWN);
    assert_eq!(state.app_index, Some(0));
    assert_eq!(
        gw.notifier.messages(),
        vec!["MESH_READY".to_string(), "MESH_READY:VENDOR".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn link_state_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let gw = RecordedGateway::with_store(store.clone()).bound().await;
    assert!(store.keys().contains(&"gateway".to_string()));
    drop(gw);

    let gw = RecordedGateway::with_store(store);
    let state = gw.router.gateway_state();
    assert!(state.vendor_bound);
    assert_eq!(state.own_address, OWN);

    // usable straight away, no binding events needed
    let dispatch = gw.router.handle_command("1:ON").await;
    assert_eq!(dispatch, Dispatch::Unicast(Address(0x0006)));
}
