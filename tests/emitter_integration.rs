//! Integration tests for PoE emission against a mock sidecar
//!
//! These tests verify the delivery contract end to end:
//! - One POST per emit, with the record's exact fields
//! - Content-Length matches the body byte for byte
//! - Concurrent emits stay independent
//! - emit never blocks on the network and never surfaces failures
//! - The deadline is advisory and leaves nothing behind

use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use poe::record::{self, FieldCase, Identity};
use poe::{Emitter, Outcome, SidecarConfig};

/// A request as the mock sidecar saw it
#[derive(Debug, Clone)]
struct Captured {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Captured {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("body is not JSON")
    }
}

struct MockSidecar {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Captured>>>,
    open_connections: Arc<AtomicUsize>,
}

impl MockSidecar {
    /// Start a sidecar that answers 200 after `delay`
    fn start(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let open_connections = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&requests);
        let open = Arc::clone(&open_connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let sink = Arc::clone(&sink);
                let open = Arc::clone(&open);
                open.fetch_add(1, Ordering::SeqCst);

                thread::spawn(move || {
                    if let Some(captured) = read_request(&mut stream) {
                        sink.lock().unwrap().push(captured);
                    }
                    thread::sleep(delay);
                    let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
                    drop(stream);
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            requests,
            open_connections,
        }
    }

    fn url(&self) -> String {
        format!("http://{}/prove", self.addr)
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

fn read_request(stream: &mut std::net::TcpStream) -> Option<Captured> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers.get("content-length")?.parse().ok()?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).ok()?;

    Some(Captured {
        method,
        path,
        headers,
        body,
    })
}

fn sidecar_config(url: &str) -> SidecarConfig {
    SidecarConfig {
        url: url.to_string(),
        ..SidecarConfig::default()
    }
}

fn full_identity() -> Identity {
    Identity {
        service_name: "orders".to_string(),
        service_namespace: Some("sock-shop".to_string()),
        pod_name: Some("orders-5c6f".to_string()),
        pod_uid: Some("2b1f-77".to_string()),
        image_digest: Some("sha256:0123".to_string()),
        code_version: Some("0.4.7".to_string()),
        code_hash: None,
    }
}

fn observed(emitter: Emitter) -> (Emitter, Arc<Mutex<Vec<(String, Outcome)>>>) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let emitter = emitter.with_observer(move |req_id, outcome| {
        sink.lock().unwrap().push((req_id.to_string(), outcome.clone()));
    });
    (emitter, outcomes)
}

fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("cyclic structure"))
    }
}

#[test]
fn test_one_post_per_emit_with_exact_fields() {
    let sidecar = MockSidecar::start(Duration::ZERO);
    let (emitter, outcomes) = observed(Emitter::new(&sidecar_config(&sidecar.url()), full_identity()));

    let input = json!({"customer": "c-1", "items": [{"id": 3, "qty": 2}]});
    let output = json!({"orderId": "o-99", "total": 12.5});
    emitter.emit("req-abc", &input, &output);

    assert!(emitter.drain(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(100));

    let requests = sidecar.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/prove");
    assert_eq!(request.headers.get("content-type").map(String::as_str), Some("application/json"));

    let body = request.json();
    assert_eq!(body["reqId"], "req-abc");
    assert_eq!(body["input"], serde_json::to_string(&input).unwrap());
    assert_eq!(body["output"], serde_json::to_string(&output).unwrap());
    assert_eq!(body["serviceName"], "orders");
    assert_eq!(body["serviceNamespace"], "sock-shop");
    assert_eq!(body["podName"], "orders-5c6f");
    assert_eq!(body["podUid"], "2b1f-77");
    assert_eq!(body["imageDigest"], "sha256:0123");
    assert_eq!(body["codeVersion"], "0.4.7");
    assert!(body["codeHash"].is_null());
    assert_eq!(body.as_object().unwrap().len(), 10);

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![("req-abc".to_string(), Outcome::Sent { status: 200 })]
    );
}

#[test]
fn test_body_is_byte_exact_with_declared_length() {
    let sidecar = MockSidecar::start(Duration::ZERO);
    let emitter = Emitter::new(&sidecar_config(&sidecar.url()), Identity::new("payment"));

    let payloads = [
        json!(null),
        json!(""),
        json!({"note": "caf\u{e9} \u{1f980}"}),
        json!({"blob": "x".repeat(128 * 1024)}),
    ];

    for (i, payload) in payloads.iter().enumerate() {
        emitter.emit(&format!("len-{}", i), payload, payload);
    }
    assert!(emitter.drain(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(2), || sidecar.requests().len() == payloads.len()));

    for request in sidecar.requests() {
        assert!(!request.headers.contains_key("transfer-encoding"));
        let declared: usize = request.headers["content-length"].parse().unwrap();
        assert_eq!(declared, request.body.len());

        let req_id = request.json()["reqId"].as_str().unwrap().to_string();
        let index: usize = req_id.trim_start_matches("len-").parse().unwrap();
        let payload = &payloads[index];
        let expected = record::build(&req_id, payload, payload, &Identity::new("payment"))
            .unwrap()
            .to_wire(FieldCase::Camel)
            .unwrap();
        assert_eq!(request.body, expected);
    }
}

#[test]
fn test_concurrent_emits_are_independent() {
    let sidecar = MockSidecar::start(Duration::from_millis(20));
    let emitter = Arc::new(Emitter::new(&sidecar_config(&sidecar.url()), full_identity()));

    let handles: Vec<_> = (0..24)
        .map(|i| {
            let emitter = Arc::clone(&emitter);
            thread::spawn(move || {
                let req_id = format!("req-{}", i);
                emitter.emit(&req_id, &json!({"for": req_id}), &json!({"echo": i}));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(emitter.drain(Duration::from_secs(10)));
    let requests = sidecar.requests();
    assert_eq!(requests.len(), 24);

    let mut seen = HashSet::new();
    for request in &requests {
        let body = request.json();
        let req_id = body["reqId"].as_str().unwrap().to_string();
        let input: Value = serde_json::from_str(body["input"].as_str().unwrap()).unwrap();
        let output: Value = serde_json::from_str(body["output"].as_str().unwrap()).unwrap();
        let i: u64 = req_id.trim_start_matches("req-").parse().unwrap();

        assert_eq!(input["for"], req_id.as_str());
        assert_eq!(output["echo"], i);
        assert!(seen.insert(req_id));
    }

    let expected: HashSet<String> = (0..24).map(|i| format!("req-{}", i)).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_emit_does_not_block_on_unroutable_sidecar() {
    let emitter = Emitter::new(&sidecar_config("http://10.255.255.1:8089/prove"), Identity::new("frontend"));

    for i in 0..10 {
        let started = Instant::now();
        emitter.emit(&format!("blackhole-{}", i), &json!({"i": i}), &json!(null));
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "emit took {:?}",
            started.elapsed()
        );
    }
}

#[test]
fn test_emit_does_not_block_on_sidecar_that_never_accepts() {
    // Bound but never accepted: the kernel finishes the handshake, nobody reads
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/prove", listener.local_addr().unwrap());
    let mut config = sidecar_config(&url);
    config.release_timeout_ms = Some(300);
    let emitter = Emitter::new(&config, Identity::new("frontend"));

    let started = Instant::now();
    emitter.emit("stuck", &1, &2);
    assert!(started.elapsed() < Duration::from_millis(50));

    assert!(emitter.drain(Duration::from_secs(5)));
    drop(listener);
}

#[test]
fn test_large_body_to_stalled_sidecar_does_not_pin_send_thread() {
    // Never accepted and never read: the body write fills the socket buffers and stalls
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/prove", listener.local_addr().unwrap());
    let mut config = sidecar_config(&url);
    config.release_timeout_ms = Some(300);
    let (emitter, outcomes) = observed(Emitter::new(&config, Identity::new("orders")));

    let input = json!({"blob": "z".repeat(16 * 1024 * 1024)});
    emitter.emit("stalled-write", &input, &json!(null));

    assert!(emitter.drain(Duration::from_secs(8)), "in_flight={}", emitter.in_flight());
    let outcomes = outcomes.lock().unwrap();
    assert!(
        outcomes
            .iter()
            .any(|(id, o)| id == "stalled-write" && matches!(o, Outcome::ConnectFailed { .. }))
    );
    drop(listener);
}

#[test]
fn test_refused_connection_is_logged_not_raised() {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{}/prove", port);
    let (emitter, outcomes) = observed(Emitter::new(&sidecar_config(&url), Identity::new("orders")));

    emitter.emit("refused", &json!({}), &json!({}));
    assert!(emitter.drain(Duration::from_secs(5)));

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1, Outcome::ConnectFailed { .. }));
}

#[test]
fn test_unserializable_values_never_reach_sidecar() {
    let sidecar = MockSidecar::start(Duration::ZERO);
    let (emitter, outcomes) = observed(Emitter::new(&sidecar_config(&sidecar.url()), Identity::new("orders")));

    emitter.emit("bad-input", &Unserializable, &json!(1));
    emitter.emit("bad-output", &json!(1), &Unserializable);

    assert_eq!(emitter.in_flight(), 0);
    thread::sleep(Duration::from_millis(100));
    assert!(sidecar.requests().is_empty());

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, o)| matches!(o, Outcome::SerializeFailed { .. })));
}

#[test]
fn test_timeout_is_advisory_and_leaks_nothing() {
    let sidecar = MockSidecar::start(Duration::from_millis(400));
    let (emitter, outcomes) = observed(
        Emitter::new(&sidecar_config(&sidecar.url()), Identity::new("orders")).with_deadline(Duration::from_millis(100)),
    );

    for round in 0..3 {
        let req_id = format!("slow-{}", round);
        emitter.emit(&req_id, &json!({"round": round}), &json!(null));
        assert!(emitter.drain(Duration::from_secs(5)));

        let seen: Vec<Outcome> = outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == req_id)
            .map(|(_, o)| o.clone())
            .collect();
        assert_eq!(
            seen,
            vec![
                Outcome::TimedOutObserved {
                    deadline: Duration::from_millis(100)
                },
                Outcome::Sent { status: 200 },
            ]
        );
    }

    assert_eq!(sidecar.requests().len(), 3);
    assert_eq!(emitter.in_flight(), 0);
    assert!(wait_until(Duration::from_secs(2), || sidecar
        .open_connections
        .load(Ordering::SeqCst)
        == 0));
}

#[test]
fn test_snake_case_collector() {
    let sidecar = MockSidecar::start(Duration::ZERO);
    let mut config = sidecar_config(&sidecar.url());
    config.field_case = FieldCase::Snake;
    let emitter = Emitter::new(&config, full_identity());

    emitter.emit("snake-1", &"in", &"out");
    assert!(emitter.drain(Duration::from_secs(5)));

    let body = sidecar.requests()[0].json();
    assert_eq!(body["req_id"], "snake-1");
    assert_eq!(body["service_name"], "orders");
    assert_eq!(body["input"], r#""in""#);
    assert!(body["code_hash"].is_null());
}
