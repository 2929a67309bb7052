//! End-to-end bridge tests over real TCP with a simulated PSU.
//!
//! These run the listener, registry, dispatcher, and poller exactly as the
//! binary wires them; only the bus is replaced by the outbound event
//! channel, and inbound control goes through the adapter's handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use rd60xx_proto::frame;
use rd60xx_proto::registers::reg;
use zenoh_bridge_rd60xx::adapter::InboundHandler;
use zenoh_bridge_rd60xx::config::PsuConfig;
use zenoh_bridge_rd60xx::listener;
use zenoh_bridge_rd60xx::messages::{BusEvent, StatePayload};
use zenoh_bridge_rd60xx::registry::Registry;

const FUNC_READ: u8 = 0x03;
const FUNC_WRITE_SINGLE: u8 = 0x06;
const FUNC_WRITE_MULTIPLE: u8 = 0x10;

/// Register file and write log shared between a sim task and the test body.
#[derive(Clone)]
struct SimState {
    regs: Arc<Mutex<Vec<u16>>>,
    writes: Arc<Mutex<Vec<(u16, Vec<u16>)>>>,
}

impl SimState {
    fn new(model: u16, serial_no: u32) -> Self {
        let mut regs = vec![0u16; 128];
        regs[reg::MODEL as usize] = model;
        regs[reg::SERIAL_HI as usize] = (serial_no >> 16) as u16;
        regs[reg::SERIAL_LO as usize] = (serial_no & 0xFFFF) as u16;
        regs[reg::FIRMWARE as usize] = 141;
        Self {
            regs: Arc::new(Mutex::new(regs)),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn write_log(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    fn register(&self, register: u16) -> u16 {
        self.regs.lock().unwrap()[register as usize]
    }
}

/// Dial the bridge and answer Modbus requests like an RD60xx would.
async fn run_sim(mut stream: TcpStream, state: SimState) {
    let mut header = [0u8; 2];
    loop {
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let (address, function) = (header[0], header[1]);

        let reply = match function {
            FUNC_READ => {
                let mut body = [0u8; 6];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                let start = u16::from_be_bytes([body[0], body[1]]) as usize;
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                let words: Vec<u16> =
                    state.regs.lock().unwrap()[start..start + count].to_vec();
                frame::read_response(address, &words)
            }
            FUNC_WRITE_SINGLE => {
                let mut body = [0u8; 6];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                let register = u16::from_be_bytes([body[0], body[1]]);
                let value = u16::from_be_bytes([body[2], body[3]]);
                state.regs.lock().unwrap()[register as usize] = value;
                state.writes.lock().unwrap().push((register, vec![value]));
                frame::encode(address, function, &body[..4])
            }
            FUNC_WRITE_MULTIPLE => {
                let mut head = [0u8; 5];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let byte_count = head[4] as usize;
                let mut rest = vec![0u8; byte_count + 2];
                if stream.read_exact(&mut rest).await.is_err() {
                    return;
                }
                let start = u16::from_be_bytes([head[0], head[1]]);
                let values: Vec<u16> = rest[..byte_count]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                {
                    let mut regs = state.regs.lock().unwrap();
                    for (i, value) in values.iter().enumerate() {
                        regs[start as usize + i] = *value;
                    }
                }
                state.writes.lock().unwrap().push((start, values.clone()));
                let mut payload = [0u8; 4];
                payload[..2].copy_from_slice(&start.to_be_bytes());
                payload[2..].copy_from_slice(&(values.len() as u16).to_be_bytes());
                frame::encode(address, function, &payload)
            }
            _ => return,
        };

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

struct Bridge {
    addr: std::net::SocketAddr,
    registry: Arc<Registry>,
    events: mpsc::Receiver<BusEvent>,
    handler: InboundHandler,
}

/// Bind the bridge on an ephemeral port with the bus stubbed out.
async fn start_bridge(names: HashMap<String, String>, default_period: f64) -> Bridge {
    let config = PsuConfig {
        listen: "127.0.0.1:0".to_string(),
        request_timeout_ms: 500,
        request_retries: 1,
        default_period_secs: default_period,
        set_clock_on_connect: false,
        names: names.clone(),
        ..Default::default()
    };

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let registry = Arc::new(Registry::new(names, default_period));
    let (events_tx, events_rx) = mpsc::channel(64);
    let handler = InboundHandler::new(
        "riden_psu".to_string(),
        registry.clone(),
        events_tx.clone(),
    );

    tokio::spawn(listener::serve(
        tcp,
        config,
        registry.clone(),
        events_tx,
    ));

    Bridge {
        addr,
        registry,
        events: events_rx,
        handler,
    }
}

async fn connect_sim(addr: std::net::SocketAddr, state: SimState) -> tokio::task::JoinHandle<()> {
    let stream = TcpStream::connect(addr).await.unwrap();
    tokio::spawn(run_sim(stream, state))
}

async fn next_event(events: &mut mpsc::Receiver<BusEvent>) -> BusEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a bus event")
        .expect("event channel closed")
}

async fn next_state(events: &mut mpsc::Receiver<BusEvent>) -> (String, StatePayload) {
    match next_event(events).await {
        BusEvent::State { identity, payload } => (identity, payload),
        other => panic!("expected state event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_onboarding_publishes_online_list_and_state() {
    let mut bridge = start_bridge(HashMap::new(), 0.0).await;
    let sim = SimState::new(60062, 23024);
    let sim_task = connect_sim(bridge.addr, sim.clone()).await;

    // Online notification first: connectivity only.
    let (identity, payload) = next_state(&mut bridge.events).await;
    assert_eq!(identity, "60062_23024");
    assert!(payload.connected);
    assert_eq!(payload.period, 0.0);
    assert!(payload.snapshot.is_none());

    // Then the refreshed device list, with the fallback name.
    match next_event(&mut bridge.events).await {
        BusEvent::List(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].identity, "60062_23024");
            assert_eq!(entries[0].name, "Unnamed");
            assert_eq!(entries[0].model, 60062);
            assert_eq!(entries[0].serial_no, 23024);
        }
        other => panic!("expected list event, got {other:?}"),
    }

    // Then the first full telemetry read.
    let (_, payload) = next_state(&mut bridge.events).await;
    assert!(payload.connected);
    let snapshot = payload.snapshot.expect("full payload");
    assert_eq!(snapshot.identity(), "60062_23024");
    assert_eq!(snapshot.firmware_version, "1.41");
    assert!(!snapshot.output_enable);

    // No writes happened: onboarding is read-only with the clock disabled.
    assert!(sim.write_log().is_empty());
    assert!(bridge.registry.get("60062_23024").unwrap().connected);

    sim_task.abort();
}

#[tokio::test]
async fn test_set_output_enable_issues_one_write() {
    let mut bridge = start_bridge(HashMap::new(), 0.0).await;
    let sim = SimState::new(60062, 23024);
    let sim_task = connect_sim(bridge.addr, sim.clone()).await;

    // Drain onboarding traffic.
    next_state(&mut bridge.events).await;
    next_event(&mut bridge.events).await;
    next_state(&mut bridge.events).await;

    bridge
        .handler
        .handle_state_set(
            "riden_psu/psu/60062_23024/state/set",
            br#"{"output_enable": true}"#,
        )
        .await;

    // The write is applied asynchronously on the device queue.
    timeout(Duration::from_secs(2), async {
        while sim.write_log().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("write should reach the wire");

    assert_eq!(sim.write_log(), vec![(reg::OUTPUT_ENABLE, vec![1])]);
    assert_eq!(sim.register(reg::OUTPUT_ENABLE), 1);

    // The next state publish reflects the applied value.
    bridge
        .handler
        .handle_state_get(
            "riden_psu/psu/60062_23024/state/get",
            br#"{"query": true}"#,
        )
        .await;
    let (_, payload) = next_state(&mut bridge.events).await;
    let snapshot = payload.snapshot.expect("query returns a full payload");
    assert!(snapshot.output_enable);

    sim_task.abort();
}

#[tokio::test]
async fn test_disconnect_preserves_name_and_period() {
    let mut names = HashMap::new();
    names.insert("60062_23024".to_string(), "Bench left".to_string());
    let mut bridge = start_bridge(names, 0.0).await;

    let sim = SimState::new(60062, 23024);
    let sim_task = connect_sim(bridge.addr, sim.clone()).await;

    // Drain onboarding traffic.
    next_state(&mut bridge.events).await;
    next_event(&mut bridge.events).await;
    next_state(&mut bridge.events).await;

    // Configure a poll period large enough to stay quiet during the test.
    bridge
        .handler
        .handle_state_set(
            "riden_psu/psu/60062_23024/state/set",
            br#"{"period": 3600}"#,
        )
        .await;
    assert_eq!(bridge.registry.get("60062_23024").unwrap().period, 3600.0);

    // Peer drops: offline publish with the configured period retained.
    sim_task.abort();
    let (identity, payload) = next_state(&mut bridge.events).await;
    assert_eq!(identity, "60062_23024");
    assert!(!payload.connected);
    assert_eq!(payload.period, 3600.0);
    assert!(payload.snapshot.is_none());

    match next_event(&mut bridge.events).await {
        BusEvent::List(entries) => assert!(entries.is_empty()),
        other => panic!("expected list event, got {other:?}"),
    }

    // The last snapshot is retained as stale data; configuration persists.
    let view = bridge.registry.get("60062_23024").unwrap();
    assert!(!view.connected);
    assert!(view.snapshot.is_some());
    assert_eq!(view.name, "Bench left");

    // Reconnect under the same identity resumes the configuration.
    let sim_task = connect_sim(bridge.addr, SimState::new(60062, 23024)).await;
    let (_, payload) = next_state(&mut bridge.events).await;
    assert!(payload.connected);
    assert_eq!(payload.period, 3600.0);

    match next_event(&mut bridge.events).await {
        BusEvent::List(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "Bench left");
        }
        other => panic!("expected list event, got {other:?}"),
    }

    sim_task.abort();
}

#[tokio::test]
async fn test_query_disconnected_identity_answers_from_cache() {
    let mut bridge = start_bridge(HashMap::new(), 0.0).await;
    let sim_task = connect_sim(bridge.addr, SimState::new(60062, 23024)).await;

    next_state(&mut bridge.events).await;
    next_event(&mut bridge.events).await;
    next_state(&mut bridge.events).await;

    sim_task.abort();
    next_state(&mut bridge.events).await; // offline
    next_event(&mut bridge.events).await; // list

    bridge
        .handler
        .handle_state_get(
            "riden_psu/psu/60062_23024/state/get",
            br#"{"query": true}"#,
        )
        .await;

    let (identity, payload) = next_state(&mut bridge.events).await;
    assert_eq!(identity, "60062_23024");
    assert!(!payload.connected);
    assert!(payload.snapshot.is_none());
}
