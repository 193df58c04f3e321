//! End-to-end tests for the capture, flush and replay flows
//!
//! These tests run the agent against a minimal in-process HTTP stub server
//! and assert on the wire payloads it records.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

use posthog_agent::{Agent, AgentConfig, SessionReplayConfig, Store};

// ============================================
// Stub HTTP server
// ============================================

#[derive(Debug, Clone)]
struct RecordedRequest {
    path: String,
    body: String,
}

struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responses: Arc<Mutex<VecDeque<u16>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StubServer {
    /// Start a server that answers every POST with 200 unless a status was
    /// queued via `queue_status`.
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<VecDeque<u16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_requests = Arc::clone(&requests);
        let thread_responses = Arc::clone(&responses);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if thread_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { break };
                handle_connection(stream, &thread_requests, &thread_responses);
            }
        });

        Self {
            addr,
            requests,
            responses,
            shutdown,
            handle: Some(handle),
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn queue_status(&self, status: u16) {
        self.responses.lock().unwrap().push_back(status);
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    requests: &Mutex<Vec<RecordedRequest>>,
    responses: &Mutex<VecDeque<u16>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));

    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = find_header_end(&raw) {
                    break pos;
                }
            }
            Err(_) => return,
        }
    };

    let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let path = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("")
        .to_string();
    let content_length: usize = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    while raw.len() < body_start + content_length {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    let body = String::from_utf8_lossy(&raw[body_start..]).to_string();

    requests.lock().unwrap().push(RecordedRequest { path, body });

    let status = responses.lock().unwrap().pop_front().unwrap_or(200);
    let reason = if status < 400 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
        status, reason
    );
    let _ = stream.write_all(response.as_bytes());
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

// ============================================
// Helpers
// ============================================

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

fn batch_events(request: &RecordedRequest) -> Vec<Value> {
    let payload: Value = serde_json::from_str(&request.body).expect("body should be JSON");
    payload["batch"].as_array().cloned().unwrap_or_default()
}

fn png_1x1() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(1, 1, image::Rgb([200, 100, 50]));
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

// ============================================
// Scenarios
// ============================================

#[test]
fn setup_and_single_capture() {
    let server = StubServer::start();
    let tmp = TempDir::new().unwrap();

    let agent = Agent::setup(AgentConfig {
        api_key: "phc_test".to_string(),
        host: server.url(),
        flush_at: 1,
        preload_feature_flags: false,
        data_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    agent.capture("hello", None);

    assert!(wait_until(Duration::from_secs(2), || server.request_count() >= 1));
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/capture/");

    let payload: Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(payload["api_key"], "phc_test");

    let batch = batch_events(&requests[0]);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0]["event"], "$screen");
    assert_eq!(batch[0]["properties"]["$screen_name"], "App Started");
    assert_eq!(batch[1]["event"], "hello");

    // Both events share one identity and one session
    assert_eq!(batch[0]["distinct_id"], batch[1]["distinct_id"]);
    assert_eq!(
        batch[0]["properties"]["$session_id"],
        batch[1]["properties"]["$session_id"]
    );
    assert_eq!(agent.queue_size(), 0);

    agent.close();
}

#[test]
fn flush_at_threshold_inline_flush() {
    let server = StubServer::start();
    let tmp = TempDir::new().unwrap();

    let agent = Agent::setup(AgentConfig {
        api_key: "phc_test".to_string(),
        host: server.url(),
        flush_at: 3,
        preload_feature_flags: false,
        data_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    // Queue: [$screen]; below the threshold, nothing is sent
    agent.capture("a", None);
    assert_eq!(server.request_count(), 0);

    // Third queued event hits the threshold, inline flush posts all three
    agent.capture("b", None);
    assert!(wait_until(Duration::from_secs(2), || server.request_count() >= 1));
    let batch = batch_events(&server.requests()[0]);
    let names: Vec<&str> = batch.iter().filter_map(|e| e["event"].as_str()).collect();
    assert_eq!(names, vec!["$screen", "a", "b"]);
    assert_eq!(agent.queue_size(), 0);

    // The remainder below the threshold is drained by an explicit flush
    agent.capture("c", None);
    assert_eq!(agent.queue_size(), 1);
    agent.flush();
    let batch = batch_events(&server.requests()[1]);
    let names: Vec<&str> = batch.iter().filter_map(|e| e["event"].as_str()).collect();
    assert_eq!(names, vec!["c"]);
    assert_eq!(agent.queue_size(), 0);

    agent.close();
}

#[test]
fn retry_after_server_error() {
    let server = StubServer::start();
    server.queue_status(500);
    let tmp = TempDir::new().unwrap();

    let agent = Agent::setup(AgentConfig {
        api_key: "phc_test".to_string(),
        host: server.url(),
        flush_interval: 1,
        preload_feature_flags: false,
        data_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    agent.capture("x", None);
    assert_eq!(agent.queue_size(), 2);

    // First worker cycle gets a 500: nothing is removed
    assert!(wait_until(Duration::from_secs(5), || server.request_count() >= 1));
    assert_eq!(agent.queue_size(), 2);

    // Next cycle gets a 200: the queue drains
    assert!(wait_until(Duration::from_secs(5), || agent.queue_size() == 0));
    assert!(server.request_count() >= 2);

    agent.close();
}

#[test]
fn replay_batch_links_session() {
    let server = StubServer::start();
    let tmp = TempDir::new().unwrap();

    let agent = Agent::setup(AgentConfig {
        api_key: "phc_test".to_string(),
        host: server.url(),
        preload_feature_flags: false,
        session_replay: true,
        session_replay_config: SessionReplayConfig {
            batch_size: 1,
            ..Default::default()
        },
        data_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    assert!(agent.is_session_replay_active());

    agent.send_meta_event(800, 600, Some("home"));
    agent.send_full_snapshot(&png_1x1(), 1, 0, 0, 800, 600);

    // The replay worker evaluates its trigger every 100ms
    assert!(wait_until(Duration::from_secs(3), || server.request_count() >= 1));

    let batch = batch_events(&server.requests()[0]);
    assert_eq!(batch.len(), 2);

    let meta = &batch[0];
    let snapshot = &batch[1];

    assert_eq!(meta["event"], "$snapshot");
    assert_eq!(meta["properties"]["$snapshot_data"][0]["type"], 4);
    assert_eq!(meta["properties"]["$snapshot_data"][0]["data"]["href"], "home");

    assert_eq!(snapshot["event"], "$snapshot");
    let snapshot_data = &snapshot["properties"]["$snapshot_data"][0];
    assert_eq!(snapshot_data["type"], 2);
    let base64 = snapshot_data["data"]["wireframes"][0]["base64"]
        .as_str()
        .unwrap();
    assert!(!base64.is_empty());

    // The wireframe round-trips to the encoder's JPEG output
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64)
        .unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8], "expected JPEG SOI marker");

    let session_id = agent.session_id();
    assert_eq!(meta["properties"]["$session_id"], session_id.as_str());
    assert_eq!(snapshot["properties"]["$session_id"], session_id.as_str());

    agent.close();
}

#[test]
fn opt_out_suppresses_everything() {
    let server = StubServer::start();
    let tmp = TempDir::new().unwrap();

    let agent = Agent::setup(AgentConfig {
        api_key: "phc_test".to_string(),
        host: server.url(),
        flush_at: 1,
        flush_interval: 1,
        opt_out: true,
        data_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    agent.capture("x", None);
    assert_eq!(agent.queue_size(), 0);

    // Give the worker a chance to (incorrectly) fire
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(server.request_count(), 0);

    agent.close();
}

#[test]
fn shutdown_joins_workers_and_stops_traffic() {
    let server = StubServer::start();
    let tmp = TempDir::new().unwrap();

    let agent = Arc::new(
        Agent::setup(AgentConfig {
            api_key: "phc_test".to_string(),
            host: server.url(),
            flush_at: 10,
            preload_feature_flags: false,
            session_replay: true,
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap(),
    );

    let background = {
        let agent = Arc::clone(&agent);
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(500);
            let mut i = 0;
            while Instant::now() < deadline {
                agent.capture(&format!("bg_{}", i), None);
                i += 1;
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };

    std::thread::sleep(Duration::from_millis(250));
    agent.close();

    // No requests may start after close() has returned
    let count_at_close = server.request_count();
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(server.request_count(), count_at_close);

    background.join().unwrap();

    // The database is consistent and reopenable
    let store = Store::open(tmp.path()).unwrap();
    assert!(store.queue_size().unwrap() >= 0);
}
