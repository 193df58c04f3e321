//! Agent facade and lifecycle owner
//!
//! The agent owns the store, transport, flag cache and (optionally) the
//! replay pipeline, exposes the public method surface, and runs the
//! background flush worker. Host callbacks may arrive on any thread
//! concurrently with both workers.
//!
//! ## Shutdown
//!
//! `close` poisons the workers, stops the replay pipeline first (join, then
//! final flush), then joins the flush worker. The workers hold `Arc` handles
//! to the store and transport, so the resources they use outlive them by
//! construction; the ordering additionally guarantees that no request is in
//! flight once `close` returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::event::{now_ms, Event, LIB_NAME, LIB_VERSION};
use crate::flags::FlagCache;
use crate::replay::ReplayPipeline;
use crate::store::Store;
use crate::transport::Transport;

/// Granularity of the flush worker's interruptible sleep
const WORKER_TICK: Duration = Duration::from_millis(200);

/// Runtime-tunable agent state, guarded by one mutex.
///
/// Never held across store or transport I/O.
struct Tuning {
    flush_at: usize,
    max_batch_size: usize,
    flush_interval: Duration,
    opt_out: bool,
}

struct State {
    tuning: Mutex<Tuning>,
    /// Cleared at the start of shutdown; workers exit and public operations
    /// stop accepting new work.
    should_flush: AtomicBool,
    /// Caller-thread sends hold a read lock; `close` takes the write lock so
    /// it returns only after every in-flight inline flush has completed.
    flush_gate: RwLock<()>,
}

/// Public facade over the capture, flags and replay subsystems
pub struct Agent {
    state: Arc<State>,
    store: Arc<Store>,
    transport: Arc<Transport>,
    flags: FlagCache,
    replay: Mutex<Option<ReplayPipeline>>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Initialize the agent: storage, transport, flag cache, optional replay
    /// pipeline, identity, and the background flush worker.
    ///
    /// Fails with `Error::Config` on an empty API key and with the underlying
    /// storage error when the data directory or database cannot be opened. No
    /// agent state exists on failure.
    pub fn setup(config: AgentConfig) -> Result<Agent> {
        config.validate()?;

        let store = Arc::new(Store::open(&config.data_dir())?);
        let transport = Arc::new(Transport::new(&config.host, &config.api_key, config.debug)?);
        let flags = FlagCache::from_store(&store);

        if let Err(err) = store.set_opt_out(config.opt_out) {
            tracing::error!(error = %err, "failed to persist opt-out state");
        }

        let distinct_id = get_or_create_distinct_id(&store);

        // A session lives for one agent instance; never restored from disk.
        let session_id = Uuid::new_v4().to_string();
        store.set_session_id(&session_id)?;

        if config.preload_feature_flags && !config.opt_out {
            flags.reload(&transport, &store, &distinct_id, &json!({}));
        }

        let replay = if config.session_replay {
            tracing::debug!("initializing session replay");
            Some(ReplayPipeline::start(
                Arc::clone(&store),
                Arc::clone(&transport),
                &config.session_replay_config,
            )?)
        } else {
            None
        };

        let state = Arc::new(State {
            tuning: Mutex::new(Tuning {
                flush_at: config.flush_at.max(1),
                max_batch_size: config.max_batch_size.max(1),
                flush_interval: Duration::from_secs(config.flush_interval.max(1)),
                opt_out: config.opt_out,
            }),
            should_flush: AtomicBool::new(true),
            flush_gate: RwLock::new(()),
        });

        let agent = Agent {
            state: Arc::clone(&state),
            store: Arc::clone(&store),
            transport: Arc::clone(&transport),
            flags,
            replay: Mutex::new(replay),
            flush_worker: Mutex::new(None),
        };

        // Establish the session context server-side before any host events.
        if !config.opt_out {
            agent.enqueue_event(
                agent.build_event("$screen", Some(screen_props("App Started"))),
            );
        }

        let worker = std::thread::Builder::new()
            .name("posthog-flush".to_string())
            .spawn(move || flush_worker_loop(state, store, transport))?;
        *agent.flush_worker.lock().unwrap() = Some(worker);

        tracing::debug!(session_id = %session_id, "agent initialized");
        Ok(agent)
    }

    // ============================================
    // Capture surface
    // ============================================

    /// Record an application event with optional caller properties.
    pub fn capture(&self, event_name: &str, properties: Option<Map<String, Value>>) {
        if event_name.is_empty() {
            tracing::warn!("capture called with empty event name, ignoring");
            return;
        }
        if !self.accepting() || self.is_opt_out() {
            return;
        }

        let (flush_at, max_batch_size) = {
            let tuning = self.state.tuning.lock().unwrap();
            (tuning.flush_at, tuning.max_batch_size)
        };

        self.enqueue_event(self.build_event(event_name, properties));

        // Size-triggered inline flush, independent of the worker cadence.
        let queue_size = self.queue_size();
        if queue_size >= flush_at as i64 {
            let _gate = self.state.flush_gate.read().unwrap();
            if self.accepting() {
                flush_queue(&self.store, &self.transport, max_batch_size);
            }
        }
    }

    /// Record a screen view.
    pub fn screen(&self, screen_name: &str) {
        if screen_name.is_empty() {
            return;
        }
        self.capture("$screen", Some(screen_props(screen_name)));
    }

    /// Associate the current user with a stable id and record `$identify`.
    pub fn identify(&self, user_id: &str) {
        if user_id.is_empty() || !self.accepting() || self.is_opt_out() {
            return;
        }

        if let Err(err) = self.store.set_distinct_id(user_id) {
            tracing::error!(error = %err, "failed to persist distinct id");
        }

        let mut props = Map::new();
        props.insert("$session_id".to_string(), json!(self.session_id()));
        props.insert("$window_id".to_string(), json!("main"));
        self.enqueue_event(Event {
            event: "$identify".to_string(),
            distinct_id: user_id.to_string(),
            timestamp: now_ms(),
            properties: Value::Object(props),
        });
    }

    /// Record `$create_alias` linking the current id to a new one, then swap.
    pub fn alias(&self, alias: &str) {
        if alias.is_empty() || !self.accepting() || self.is_opt_out() {
            return;
        }

        let old_id = get_or_create_distinct_id(&self.store);
        let mut props = Map::new();
        props.insert("alias".to_string(), json!(old_id));
        self.enqueue_event(Event {
            event: "$create_alias".to_string(),
            distinct_id: alias.to_string(),
            timestamp: now_ms(),
            properties: Value::Object(props),
        });

        if let Err(err) = self.store.set_distinct_id(alias) {
            tracing::error!(error = %err, "failed to persist alias distinct id");
        }
    }

    /// Record a `$groupidentify` event.
    pub fn group(&self, group_type: &str, group_key: &str) {
        if group_type.is_empty() || !self.accepting() || self.is_opt_out() {
            return;
        }

        let mut props = Map::new();
        props.insert("$group_type".to_string(), json!(group_type));
        props.insert("$group_key".to_string(), json!(group_key));
        self.enqueue_event(Event {
            event: "$groupidentify".to_string(),
            distinct_id: get_or_create_distinct_id(&self.store),
            timestamp: now_ms(),
            properties: Value::Object(props),
        });
    }

    /// Record an `$exception` event with the caller-supplied properties.
    pub fn capture_exception(&self, properties: Option<Map<String, Value>>) {
        if !self.accepting() || self.is_opt_out() {
            return;
        }

        let mut props = properties.unwrap_or_default();
        props
            .entry("$session_id".to_string())
            .or_insert_with(|| json!(self.session_id()));
        props
            .entry("$window_id".to_string())
            .or_insert_with(|| json!("main"));
        self.enqueue_event(Event {
            event: "$exception".to_string(),
            distinct_id: get_or_create_distinct_id(&self.store),
            timestamp: now_ms(),
            properties: Value::Object(props),
        });
    }

    // ============================================
    // Identity and preferences
    // ============================================

    /// Current distinct id, creating one if none was ever assigned.
    pub fn distinct_id(&self) -> String {
        get_or_create_distinct_id(&self.store)
    }

    /// Rotate the distinct id and clear super properties.
    pub fn reset(&self) {
        let new_id = Uuid::new_v4().to_string();
        if let Err(err) = self.store.set_distinct_id(&new_id) {
            tracing::error!(error = %err, "failed to reset distinct id");
        }
        if let Err(err) = self.store.clear_super_properties() {
            tracing::error!(error = %err, "failed to clear super properties");
        }
    }

    /// Re-enable capture and network traffic.
    pub fn enable(&self) {
        self.set_opt_out(false);
    }

    /// Suppress all capture and network traffic.
    pub fn disable(&self) {
        self.set_opt_out(true);
    }

    pub fn is_opt_out(&self) -> bool {
        self.state.tuning.lock().unwrap().opt_out
    }

    fn set_opt_out(&self, opt_out: bool) {
        self.state.tuning.lock().unwrap().opt_out = opt_out;
        if let Err(err) = self.store.set_opt_out(opt_out) {
            tracing::error!(error = %err, "failed to persist opt-out state");
        }
    }

    /// Toggle verbose logging on the transport.
    pub fn set_debug(&self, debug: bool) {
        self.transport.set_debug(debug);
    }

    /// Register a super property merged into every subsequent event.
    pub fn register(&self, key: &str, value: Value) {
        if key.is_empty() {
            return;
        }
        let encoded = match serde_json::to_string(&value) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, key, "failed to encode super property");
                return;
            }
        };
        if let Err(err) = self.store.set_super_property(key, &encoded) {
            tracing::error!(error = %err, key, "failed to store super property");
        }
    }

    /// Remove a previously registered super property.
    pub fn unregister(&self, key: &str) {
        if let Err(err) = self.store.remove_super_property(key) {
            tracing::error!(error = %err, key, "failed to remove super property");
        }
    }

    // ============================================
    // Flushing
    // ============================================

    /// Force an immediate drain-and-post of the queue.
    pub fn flush(&self) {
        if !self.accepting() || self.is_opt_out() {
            return;
        }
        let max_batch_size = self.state.tuning.lock().unwrap().max_batch_size;
        let _gate = self.state.flush_gate.read().unwrap();
        if self.accepting() {
            flush_queue(&self.store, &self.transport, max_batch_size);
        }
    }

    /// Exact number of events waiting in the durable queue.
    pub fn queue_size(&self) -> i64 {
        self.store.queue_size().unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to read queue size");
            0
        })
    }

    // ============================================
    // Feature flags
    // ============================================

    /// Refresh the flag cache from the decide endpoint.
    pub fn reload_feature_flags(&self) {
        if !self.accepting() || self.is_opt_out() {
            return;
        }
        let distinct_id = get_or_create_distinct_id(&self.store);
        self.flags
            .reload(&self.transport, &self.store, &distinct_id, &json!({}));
    }

    pub fn is_feature_enabled(&self, key: &str) -> bool {
        self.flags.is_enabled(key)
    }

    pub fn feature_flag(&self, key: &str) -> String {
        self.flags.get(key)
    }

    pub fn feature_flag_payload(&self, key: &str) -> String {
        self.flags.payload(key)
    }

    // ============================================
    // Sessions
    // ============================================

    /// The session id linking this agent's event and replay streams.
    pub fn session_id(&self) -> String {
        match self.store.session_id() {
            Ok(Some(id)) if !id.is_empty() => id,
            _ => crate::event::UNKNOWN_SESSION.to_string(),
        }
    }

    /// Rotate the session id and record a `"Session Started"` screen event.
    pub fn create_new_session(&self) {
        if !self.accepting() {
            return;
        }

        let session_id = Uuid::new_v4().to_string();
        if let Err(err) = self.store.set_session_id(&session_id) {
            tracing::error!(error = %err, "failed to persist session id");
            return;
        }
        tracing::debug!(session_id = %session_id, "new session created");

        if !self.is_opt_out() {
            self.enqueue_event(
                self.build_event("$screen", Some(screen_props("Session Started"))),
            );
        }
    }

    // ============================================
    // Session replay
    // ============================================

    /// Hand one raw PNG frame to the replay pipeline.
    pub fn send_full_snapshot(&self, png: &[u8], id: i64, x: i64, y: i64, width: u32, height: u32) {
        if let Some(replay) = self.replay.lock().unwrap().as_ref() {
            replay.add_snapshot(png, id, x, y, width, height);
        }
    }

    /// Announce viewport dimensions (and optionally a screen name) to the
    /// replay pipeline.
    pub fn send_meta_event(&self, width: i64, height: i64, screen: Option<&str>) {
        if let Some(replay) = self.replay.lock().unwrap().as_ref() {
            replay.add_meta_event(width, height, screen.unwrap_or(""));
        }
    }

    pub fn is_session_replay_active(&self) -> bool {
        self.replay
            .lock()
            .unwrap()
            .as_ref()
            .map(ReplayPipeline::is_active)
            .unwrap_or(false)
    }

    // ============================================
    // Misc surface
    // ============================================

    /// Launch the operating system's URL handler, detached.
    pub fn open_url(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        if let Err(err) = std::process::Command::new("xdg-open").arg(url).spawn() {
            tracing::error!(error = %err, url, "failed to launch URL handler");
        }
    }

    /// Shut the agent down: stop accepting work, stop the replay pipeline
    /// (worker joined, then a final bounded flush), join the flush worker.
    ///
    /// Idempotent; also invoked from `Drop`.
    pub fn close(&self) {
        self.state.should_flush.store(false, Ordering::SeqCst);

        // Wait out any inline flush still running on a caller thread.
        drop(self.state.flush_gate.write().unwrap());

        // Replay first: its worker must be gone before the agent tears down.
        if let Some(replay) = self.replay.lock().unwrap().take() {
            replay.shutdown();
        }

        if let Some(worker) = self.flush_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    // ============================================
    // Internals
    // ============================================

    fn accepting(&self) -> bool {
        self.state.should_flush.load(Ordering::SeqCst)
    }

    /// Assemble an event with the standard property merge. Caller-supplied
    /// keys never overwrite library, session or super properties.
    fn build_event(&self, event_name: &str, caller: Option<Map<String, Value>>) -> Event {
        let mut props = Map::new();

        props.insert("$lib".to_string(), json!(LIB_NAME));
        props.insert("$lib_version".to_string(), json!(LIB_VERSION));
        props.insert("$device_type".to_string(), json!("Mobile"));
        props.insert("$os".to_string(), json!("Linux"));
        props.insert("$os_version".to_string(), json!("Unknown"));
        props.insert("$screen_width".to_string(), json!(1024));
        props.insert("$screen_height".to_string(), json!(600));
        props.insert("$session_id".to_string(), json!(self.session_id()));
        props.insert("$window_id".to_string(), json!("main"));

        match self.store.super_properties() {
            Ok(super_props) => {
                for (key, raw) in super_props {
                    // Stored values are encoded JSON; an unparseable value is
                    // carried as a raw string.
                    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                    props.entry(key).or_insert(value);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load super properties");
            }
        }

        if let Some(caller) = caller {
            for (key, value) in caller {
                props.entry(key).or_insert(value);
            }
        }

        Event {
            event: event_name.to_string(),
            distinct_id: get_or_create_distinct_id(&self.store),
            timestamp: now_ms(),
            properties: Value::Object(props),
        }
    }

    fn enqueue_event(&self, event: Event) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, event = %event.event, "failed to serialize event");
                return;
            }
        };
        // Enqueue failure is non-fatal: the event is lost, capture continues.
        if let Err(err) = self.store.enqueue(&json) {
            tracing::error!(error = %err, event = %event.event, "failed to enqueue event");
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

fn screen_props(screen_name: &str) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("$screen_name".to_string(), json!(screen_name));
    props
}

fn get_or_create_distinct_id(store: &Store) -> String {
    match store.distinct_id() {
        Ok(Some(id)) if !id.is_empty() => id,
        Ok(_) => {
            let id = Uuid::new_v4().to_string();
            if let Err(err) = store.set_distinct_id(&id) {
                tracing::error!(error = %err, "failed to persist distinct id");
            }
            id
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to read distinct id");
            crate::event::UNKNOWN_USER.to_string()
        }
    }
}

/// Drain up to `max_batch_size` events and post them; rows are removed only
/// after the server acknowledged the batch.
fn flush_queue(store: &Store, transport: &Transport, max_batch_size: usize) {
    let rows = match store.drain(max_batch_size) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(error = %err, "failed to drain event queue");
            return;
        }
    };
    if rows.is_empty() {
        return;
    }

    let (ids, jsons): (Vec<String>, Vec<String>) = rows.into_iter().unzip();
    let response = transport.post_capture(&jsons);
    if response.success {
        if let Err(err) = store.remove(&ids) {
            tracing::error!(error = %err, "failed to remove delivered events");
        }
    } else {
        tracing::error!(
            status = response.status,
            count = ids.len(),
            "failed to deliver event batch, will retry"
        );
    }
}

/// Background flush loop. Sleeps in short ticks so shutdown joins promptly,
/// flushes once per configured interval, and never exits on error.
fn flush_worker_loop(state: Arc<State>, store: Arc<Store>, transport: Arc<Transport>) {
    let mut slept = Duration::ZERO;

    loop {
        std::thread::sleep(WORKER_TICK);
        if !state.should_flush.load(Ordering::SeqCst) {
            break;
        }

        slept += WORKER_TICK;
        let (interval, opt_out, max_batch_size) = {
            let tuning = state.tuning.lock().unwrap();
            (tuning.flush_interval, tuning.opt_out, tuning.max_batch_size)
        };

        if slept < interval {
            continue;
        }
        slept = Duration::ZERO;

        if opt_out {
            continue;
        }

        flush_queue(&store, &transport, max_batch_size);
    }
}
