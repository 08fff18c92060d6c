//! Session: per-client event dispatch and transport lifecycle.
//!
//! A [`Session`] is the server-side counterpart of one logical client.
//! It owns the event-handler registry its sync units populate, the
//! current transport attachment (absent while the client is away), the
//! running-task table and the read loop that drives dispatch.
//!
//! One session survives any number of transport attachments: every
//! reattach re-emits the full state of each registered unit, in
//! registration order, before any other traffic.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::protocol::{error_event, Envelope, ErrorCode, ErrorReport, ProtocolError};
use crate::transport::{Frame, Transport, TransportError, TransportReader, TransportWriter};
use crate::{SyncError, SyncResult};

pub(crate) type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;
pub(crate) type InitEmit = Arc<dyn Fn() -> SyncResult<()> + Send + Sync>;
pub(crate) type BinarySink = Arc<dyn Fn(Bytes) -> SyncResult<()> + Send + Sync>;
pub(crate) type BinaryMetaFn = Arc<dyn Fn(Value) -> SyncResult<BinarySink> + Send + Sync>;

/// Bookkeeping for one live task execution.
#[derive(Clone)]
pub(crate) struct TaskEntry {
    pub(crate) abort: AbortHandle,
    /// Set once cancellation has been requested; the terminal outcome is
    /// classified as cancelled no matter how the body ends.
    pub(crate) cancelled: Arc<AtomicBool>,
}

struct Lane {
    tx: mpsc::UnboundedSender<Frame>,
}

struct SessionInner {
    handlers: RwLock<HashMap<String, EventHandler>>,
    /// Full-state emitters, one per unit, in registration order
    init_emits: RwLock<Vec<(String, InitEmit)>>,
    binary_metas: RwLock<HashMap<String, BinaryMetaFn>>,
    lane: Mutex<Option<Lane>>,
    reader: Mutex<Option<Box<dyn TransportReader>>>,
    tasks: Mutex<HashMap<(String, String), TaskEntry>>,
    /// Bumped on every attach so a superseded read loop can retire
    epoch: AtomicU64,
    closed: AtomicBool,
    wake: Notify,
}

/// One logical client session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

thread_local! {
    static AMBIENT: RefCell<Vec<Session>> = const { RefCell::new(Vec::new()) };
}

/// The innermost session entered via [`Session::scope`] on this thread.
pub fn current_session() -> Option<Session> {
    AMBIENT.with(|stack| stack.borrow().last().cloned())
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                handlers: RwLock::new(HashMap::new()),
                init_emits: RwLock::new(Vec::new()),
                binary_metas: RwLock::new(HashMap::new()),
                lane: Mutex::new(None),
                reader: Mutex::new(None),
                tasks: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// Run `f` with this session as the ambient session, so that synced
    /// objects constructed inside find it. Scopes nest and restore.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Guard;
        impl Drop for Guard {
            fn drop(&mut self) {
                AMBIENT.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }

        AMBIENT.with(|stack| stack.borrow_mut().push(self.clone()));
        let _guard = Guard;
        f()
    }

    /// Whether a transport is currently attached.
    pub fn is_attached(&self) -> bool {
        self.inner.lane.lock().is_some()
    }

    /// Adopt a transport. Any previous transport is released, and every
    /// registered unit re-emits its full state to the new peer.
    pub fn attach(&self, transport: Box<dyn Transport>) -> SyncResult<()> {
        let (reader, writer) = transport.split();
        self.attach_split(reader, writer)
    }

    pub(crate) fn attach_split(
        &self,
        reader: Box<dyn TransportReader>,
        mut writer: Box<dyn TransportWriter>,
    ) -> SyncResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
            writer.close().await;
        });

        *self.inner.reader.lock() = Some(reader);
        // dropping the previous sender lets the old writer drain and close
        let _previous = self.inner.lane.lock().replace(Lane { tx });
        self.inner.wake.notify_one();

        for (key, emit) in self.inner.init_emits.read().iter() {
            if let Err(e) = emit() {
                warn!(key = %key, error = %e, "initial state emission failed");
            }
        }
        Ok(())
    }

    /// The read loop: receive one frame, await its complete handling,
    /// read the next. Returns when the peer closes the transport, on a
    /// transport or framing error, when the session is closed, or when a
    /// newer attach supersedes this one.
    pub async fn run(&self) -> SyncResult<()> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let mut reader = self
            .inner
            .reader
            .lock()
            .take()
            .ok_or(SyncError::NotAttached)?;
        let mut awaiting: Option<BinarySink> = None;

        let result = loop {
            if self.inner.closed.load(Ordering::SeqCst)
                || self.inner.epoch.load(Ordering::SeqCst) != epoch
            {
                break Ok(());
            }

            let frame = tokio::select! {
                _ = self.inner.wake.notified() => continue,
                frame = reader.recv() => frame,
            };

            match frame {
                Ok(Frame::Text(text)) => {
                    if awaiting.is_some() {
                        warn!("text frame while awaiting a binary payload; releasing transport");
                        break Err(ProtocolError::InterleavedText(text).into());
                    }
                    match Envelope::decode(&text) {
                        Ok(env) => self.dispatch(env, &mut awaiting).await,
                        Err(e) => warn!(error = %e, "discarding malformed envelope"),
                    }
                }
                Ok(Frame::Binary(bytes)) => match awaiting.take() {
                    Some(sink) => {
                        if let Err(e) = sink(bytes) {
                            warn!(error = %e, "binary payload rejected");
                        }
                    }
                    None => {
                        warn!("unpaired binary frame; releasing transport");
                        break Err(ProtocolError::UnpairedBinary.into());
                    }
                },
                Err(TransportError::Closed) => break Ok(()),
                Err(e) => break Err(SyncError::Transport(e)),
            }
        };

        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            self.inner.lane.lock().take();
        }
        result
    }

    /// Attach and run in one call.
    pub async fn handle(&self, transport: Box<dyn Transport>) -> SyncResult<()> {
        self.attach(transport)?;
        self.run().await
    }

    async fn dispatch(&self, env: Envelope, awaiting: &mut Option<BinarySink>) {
        let handler = self.inner.handlers.read().get(&env.event).cloned();
        if let Some(handler) = handler {
            let event = env.event;
            match AssertUnwindSafe(handler(env.data)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %event, error = %e, "event handler failed"),
                Err(_) => {
                    warn!(event = %event, "event handler panicked");
                    if let Some(key) = event.split(':').next() {
                        let report = ErrorReport {
                            code: ErrorCode::Handler,
                            message: "handler panicked".into(),
                            path: None,
                        };
                        if let Ok(data) = serde_json::to_value(&report) {
                            let _ = self.send(&Envelope::new(error_event(key, None), data));
                        }
                    }
                }
            }
            return;
        }

        let meta = self.inner.binary_metas.read().get(&env.event).cloned();
        if let Some(meta) = meta {
            match meta(env.data) {
                Ok(sink) => *awaiting = Some(sink),
                Err(e) => warn!(event = %env.event, error = %e, "rejected binary metadata"),
            }
            return;
        }

        debug!(event = %env.event, "no handler registered; discarding");
    }

    /// Serialize an envelope onto the current transport. Silently dropped
    /// while no transport is attached; the next attach re-emits full
    /// state, so nothing is lost.
    pub(crate) fn send(&self, env: &Envelope) -> SyncResult<()> {
        let lane = self.inner.lane.lock();
        let Some(lane) = lane.as_ref() else {
            trace!(event = %env.event, "no transport attached; dropping event");
            return Ok(());
        };
        let _ = lane.tx.send(Frame::Text(env.encode()?));
        Ok(())
    }

    /// Send a metadata envelope immediately followed by its binary
    /// payload, with no other frame in between.
    pub(crate) fn send_with_binary(&self, env: &Envelope, payload: Bytes) -> SyncResult<()> {
        let lane = self.inner.lane.lock();
        let Some(lane) = lane.as_ref() else {
            trace!(event = %env.event, "no transport attached; dropping binary transfer");
            return Ok(());
        };
        let text = env.encode()?;
        let _ = lane.tx.send(Frame::Text(text));
        let _ = lane.tx.send(Frame::Binary(payload));
        Ok(())
    }

    /// End the session: abort running tasks, release the transport and
    /// drop all unit registrations. A closed session cannot be reattached.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.inner.tasks.lock();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.abort.abort();
        }
        self.inner.lane.lock().take();
        self.inner.reader.lock().take();
        self.inner.handlers.write().clear();
        self.inner.init_emits.write().clear();
        self.inner.binary_metas.write().clear();
        self.inner.wake.notify_one();
        debug!("session closed");
    }

    // ===== Unit registration =====

    pub(crate) fn register_event(&self, event: &str, handler: EventHandler) -> SyncResult<()> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(event) || self.inner.binary_metas.read().contains_key(event) {
            return Err(SyncError::DuplicateEvent(event.to_string()));
        }
        handlers.insert(event.to_string(), handler);
        Ok(())
    }

    pub(crate) fn deregister_event(&self, event: &str) {
        self.inner.handlers.write().remove(event);
    }

    pub(crate) fn register_binary(&self, event: &str, handler: BinaryMetaFn) -> SyncResult<()> {
        let mut metas = self.inner.binary_metas.write();
        if metas.contains_key(event) || self.inner.handlers.read().contains_key(event) {
            return Err(SyncError::DuplicateEvent(event.to_string()));
        }
        metas.insert(event.to_string(), handler);
        Ok(())
    }

    pub(crate) fn deregister_binary(&self, event: &str) {
        self.inner.binary_metas.write().remove(event);
    }

    pub(crate) fn register_init(&self, key: &str, emit: InitEmit) {
        self.inner.init_emits.write().push((key.to_string(), emit));
    }

    pub(crate) fn deregister_init(&self, key: &str) {
        self.inner.init_emits.write().retain(|(k, _)| k != key);
    }

    // ===== Running-task table =====

    pub(crate) fn task_running(&self, key: &str, name: &str) -> bool {
        self.inner
            .tasks
            .lock()
            .contains_key(&(key.to_string(), name.to_string()))
    }

    pub(crate) fn insert_task(&self, key: &str, name: &str, entry: TaskEntry) {
        self.inner
            .tasks
            .lock()
            .insert((key.to_string(), name.to_string()), entry);
    }

    pub(crate) fn get_task(&self, key: &str, name: &str) -> Option<TaskEntry> {
        self.inner
            .tasks
            .lock()
            .get(&(key.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn remove_task(&self, key: &str, name: &str) {
        self.inner
            .tasks
            .lock()
            .remove(&(key.to_string(), name.to_string()));
    }

    /// Names of the tasks currently running for one unit, sorted.
    pub(crate) fn running_for(&self, key: &str) -> Vec<String> {
        let tasks = self.inner.tasks.lock();
        let mut names: Vec<String> = tasks
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToastLevel;
    use crate::transport::{memory_pair, MemoryPeer};
    use crate::unit::{SyncUnit, UnitBuilder};
    use crate::validate::TypeSpec;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    #[derive(Debug, Serialize, Deserialize)]
    struct Notepad {
        title: String,
        notes: Vec<String>,
    }

    fn notepad() -> Notepad {
        Notepad {
            title: "N".into(),
            notes: vec![],
        }
    }

    fn notepad_unit(session: &Session) -> SyncUnit<Notepad> {
        session.scope(|| {
            UnitBuilder::new("NOTES")
                .typed("title", TypeSpec::String)
                .action(
                    "add",
                    &[("note", TypeSpec::String)],
                    |unit: SyncUnit<Notepad>, args| async move {
                        let note = args["note"].as_str().unwrap_or_default().to_string();
                        unit.lock().notes.push(note);
                        unit.sync().await?;
                        Ok(())
                    },
                )
                .action(
                    "rename",
                    &[("title", TypeSpec::String)],
                    |unit: SyncUnit<Notepad>, args| async move {
                        let title = args["title"].as_str().unwrap_or_default().to_string();
                        unit.lock().title = title;
                        unit.sync().await?;
                        Ok(())
                    },
                )
                .build(notepad())
                .unwrap()
        })
    }

    fn connect(session: &Session) -> (MemoryPeer, JoinHandle<SyncResult<()>>) {
        let (transport, peer) = memory_pair();
        session.attach(Box::new(transport)).unwrap();
        let run = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });
        (peer, run)
    }

    async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
        timeout(Duration::from_secs(2), peer.recv_envelope())
            .await
            .expect("timed out waiting for envelope")
            .expect("peer disconnected")
    }

    #[tokio::test]
    async fn test_attach_sends_full_state_then_patches() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);

        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
        assert_eq!(env.data, json!({"notes": [], "title": "N"}));

        peer.send_event("NOTES:ACTION:ADD", json!({"note": "hello"}));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:PATCH");
        let ops = env.data.as_array().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "add");
        assert!(ops[0]["path"].as_str().unwrap().starts_with("/notes/"));
        assert_eq!(ops[0]["value"], "hello");
        assert_eq!(unit.lock().notes, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_patch_fidelity() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);

        let mut doc = next_envelope(&mut peer).await.data;

        for title in ["alpha", "beta", "gamma"] {
            {
                let mut owner = unit.lock();
                owner.title = title.into();
                owner.notes.push(format!("note for {title}"));
            }
            unit.sync().await.unwrap();
            let env = next_envelope(&mut peer).await;
            assert_eq!(env.event, "NOTES:PATCH");
            let patch: json_patch::Patch = serde_json::from_value(env.data).unwrap();
            json_patch::patch(&mut doc, &patch).unwrap();
        }

        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
        assert_eq!(env.data, doc);
    }

    #[tokio::test]
    async fn test_reconnect_resends_full_state() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, run) = connect(&session);

        let _ = next_envelope(&mut peer).await;
        peer.send_event("NOTES:ACTION:ADD", json!({"note": "hello"}));
        let _ = next_envelope(&mut peer).await;

        peer.disconnect();
        run.await.unwrap().unwrap();
        assert!(!session.is_attached());

        unit.lock().title = "N2".into();
        unit.sync().await.unwrap(); // dropped while detached

        let (mut peer2, _run2) = connect(&session);
        let env = next_envelope(&mut peer2).await;
        assert_eq!(env.event, "NOTES:SET");
        assert_eq!(env.data, json!({"notes": ["hello"], "title": "N2"}));
    }

    #[tokio::test]
    async fn test_actions_execute_sequentially() {
        #[derive(Serialize, Deserialize)]
        struct State {
            title: String,
        }

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("ORD")
                .action(
                    "slow",
                    &[],
                    |unit: SyncUnit<State>, _| async move {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        unit.lock().title = "A".into();
                        unit.sync().await?;
                        Ok(())
                    },
                )
                .action(
                    "fast",
                    &[],
                    |unit: SyncUnit<State>, _| async move {
                        unit.lock().title = "B".into();
                        unit.sync().await?;
                        Ok(())
                    },
                )
                .build(State { title: "".into() })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("ORD:ACTION:SLOW", json!({}));
        peer.send_event("ORD:ACTION:FAST", json!({}));

        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "ORD:PATCH");
        assert_eq!(env.data[0]["value"], "A");
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "ORD:PATCH");
        assert_eq!(env.data[0]["value"], "B");
    }

    #[tokio::test]
    async fn test_task_cancel_stops_emissions() {
        #[derive(Serialize, Deserialize)]
        struct Counter {
            value: u64,
        }

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("CTR")
                .task(
                    "inc",
                    &[("by", TypeSpec::Int)],
                    |unit: SyncUnit<Counter>, args| async move {
                        let by = args["by"].as_u64().unwrap_or(1);
                        for _ in 0..by {
                            unit.lock().value += 1;
                            unit.sync().await?;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(())
                    },
                )
                .build(Counter { value: 0 })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("CTR:TASK_START:INC", json!({"by": 1_000_000}));
        for _ in 0..3 {
            let env = next_envelope(&mut peer).await;
            assert_eq!(env.event, "CTR:PATCH");
        }
        peer.send_event("CTR:TASK_CANCEL:INC", json!(null));

        let mut extra_patches = 0;
        loop {
            let env = next_envelope(&mut peer).await;
            if env.event == "CTR:TASK_DONE:INC" {
                assert_eq!(env.data["outcome"], "cancelled");
                break;
            }
            assert_eq!(env.event, "CTR:PATCH");
            extra_patches += 1;
            assert!(extra_patches < 50, "cancel did not stop the task");
        }
    }

    #[tokio::test]
    async fn test_task_with_cancel_handler_reports_cancelled() {
        #[derive(Serialize, Deserialize)]
        struct Job {
            progress: u64,
            #[serde(skip)]
            stop: bool,
        }

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("JOB")
                .task("work", &[], |unit: SyncUnit<Job>, _| async move {
                    for _ in 0..200 {
                        if unit.lock().stop {
                            break;
                        }
                        unit.lock().progress += 1;
                        unit.sync().await?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(())
                })
                .task_cancel("work", |unit: SyncUnit<Job>, _| async move {
                    unit.lock().stop = true;
                    Ok(())
                })
                .build(Job {
                    progress: 0,
                    stop: false,
                })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("JOB:TASK_START:WORK", json!(null));
        let _ = next_envelope(&mut peer).await; // first progress patch
        peer.send_event("JOB:TASK_CANCEL:WORK", json!(null));

        loop {
            let env = next_envelope(&mut peer).await;
            if env.event == "JOB:TASK_DONE:WORK" {
                assert_eq!(env.data["outcome"], "cancelled");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_task_failure_is_reported() {
        #[derive(Serialize, Deserialize)]
        struct Empty {}

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("FAIL")
                .task("boom", &[], |_unit: SyncUnit<Empty>, _| async move {
                    Err("boom".into())
                })
                .build(Empty {})
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("FAIL:TASK_START:BOOM", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "FAIL:TASK_DONE:BOOM");
        assert_eq!(env.data["outcome"], "failed");
        assert_eq!(env.data["error"], "boom");
    }

    #[tokio::test]
    async fn test_tasks_run_concurrently() {
        #[derive(Serialize, Deserialize)]
        struct Log {
            entries: Vec<String>,
        }

        fn logging_task(
            label: &'static str,
        ) -> impl Fn(SyncUnit<Log>, Value) -> BoxFuture<'static, crate::unit::HandlerResult>
        {
            move |unit, _| {
                async move {
                    unit.lock().entries.push(format!("{label}:start"));
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    unit.lock().entries.push(format!("{label}:end"));
                    Ok(())
                }
                .boxed()
            }
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("RUN")
                .task("t1", &[], logging_task("t1"))
                .task("t2", &[], logging_task("t2"))
                .build(Log { entries: vec![] })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("RUN:TASK_START:T1", json!(null));
        peer.send_event("RUN:TASK_START:T2", json!(null));

        let mut done = 0;
        while done < 2 {
            let env = next_envelope(&mut peer).await;
            if env.event.starts_with("RUN:TASK_DONE:") {
                done += 1;
            }
        }

        let entries = unit.lock().entries.clone();
        let pos = |needle: &str| entries.iter().position(|e| e == needle).unwrap();
        // both started before either finished
        assert!(pos("t2:start") < pos("t1:end"));
        assert!(pos("t1:start") < pos("t2:end"));
    }

    #[tokio::test]
    async fn test_duplicate_task_start_is_discarded() {
        #[derive(Serialize, Deserialize)]
        struct Slow {
            runs: u64,
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("DUP")
                .task("work", &[], |unit: SyncUnit<Slow>, _| async move {
                    unit.lock().runs += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .build(Slow { runs: 0 })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("DUP:TASK_START:WORK", json!(null));
        peer.send_event("DUP:TASK_START:WORK", json!(null));

        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "DUP:TASK_DONE:WORK");
        assert_eq!(unit.lock().runs, 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_ill_typed_action() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("NOTES:ACTION:RENAME", json!({"title": 123}));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:ERROR:RENAME");
        assert_eq!(env.data["code"], "validation");
        assert_eq!(env.data["path"], "/title");
        assert_eq!(unit.lock().title, "N");

        // no patch was emitted: the next event is the reply to GET
        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
        assert_eq!(env.data["title"], "N");
    }

    #[tokio::test]
    async fn test_camel_case_projection_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Person {
            first_name: String,
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("PERSON")
                .camel_case()
                .build(Person {
                    first_name: "Ada".into(),
                })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);

        let env = next_envelope(&mut peer).await;
        assert_eq!(env.data, json!({"firstName": "Ada"}));

        peer.send_event("PERSON:SET", json!({"firstName": "Grace"}));
        peer.send_event("PERSON:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.data, json!({"firstName": "Grace"}));
        assert_eq!(unit.lock().first_name, "Grace");
    }

    #[tokio::test]
    async fn test_empty_diff_emits_nothing() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        unit.sync().await.unwrap();
        unit.sync().await.unwrap();

        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
    }

    #[tokio::test]
    async fn test_inbound_set_then_get_roundtrip() {
        let session = Session::new();
        let _unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        let state = json!({"notes": ["a", "b"], "title": "T"});
        peer.send_event("NOTES:SET", state.clone());
        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
        assert_eq!(env.data, state);
    }

    #[tokio::test]
    async fn test_inbound_patch_updates_owner() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event(
            "NOTES:PATCH",
            json!([{"op": "replace", "path": "/title", "value": "patched"}]),
        );
        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.data["title"], "patched");
        assert_eq!(unit.lock().title, "patched");
    }

    #[tokio::test]
    async fn test_inbound_set_with_ill_typed_field_leaves_owner_untouched() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("NOTES:SET", json!({"notes": [], "title": 7}));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:ERROR");
        assert_eq!(env.data["code"], "validation");
        assert_eq!(unit.lock().title, "N");
    }

    #[tokio::test]
    async fn test_unknown_event_is_discarded() {
        let session = Session::new();
        let _unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_text("not json at all");
        peer.send_event("NOPE:SET", json!({}));

        peer.send_event("NOTES:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:SET");
    }

    #[tokio::test]
    async fn test_duplicate_registration_key_rejected() {
        let session = Session::new();
        let _unit = notepad_unit(&session);
        let second = session.scope(|| UnitBuilder::new("NOTES").build(notepad()));
        assert!(matches!(second, Err(SyncError::DuplicateEvent(_))));
    }

    #[tokio::test]
    async fn test_blocking_action_offload() {
        #[derive(Serialize, Deserialize)]
        struct State {
            value: u64,
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("BLK")
                .action_blocking("crunch", &[], |unit: SyncUnit<State>, _| {
                    std::thread::sleep(Duration::from_millis(20));
                    unit.lock().value = 42;
                    Ok(())
                })
                .build(State { value: 0 })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("BLK:ACTION:CRUNCH", json!(null));
        peer.send_event("BLK:GET", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.data["value"], 42);
        assert_eq!(unit.lock().value, 42);
    }

    #[tokio::test]
    async fn test_binary_inbound_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Profile {
            name: String,
            #[serde(skip)]
            avatar: Vec<u8>,
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("PROFILE")
                .binary(
                    "avatar",
                    Some("image/png"),
                    |p: &Profile| Bytes::from(p.avatar.clone()),
                    |p, bytes| p.avatar = bytes.to_vec(),
                )
                .build(Profile {
                    name: "Ada".into(),
                    avatar: vec![],
                })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let env = next_envelope(&mut peer).await;
        // binary fields stay out of the JSON projection
        assert_eq!(env.data, json!({"name": "Ada"}));

        peer.send_event("PROFILE:BIN_META:avatar", json!({"size": 3}));
        peer.send_binary(vec![1u8, 2, 3]);
        peer.send_event("PROFILE:GET", json!(null));
        let _ = next_envelope(&mut peer).await;
        assert_eq!(unit.lock().avatar, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_binary_outbound_pairs_meta_and_payload() {
        #[derive(Serialize, Deserialize)]
        struct Profile {
            name: String,
            #[serde(skip)]
            avatar: Vec<u8>,
        }

        let session = Session::new();
        let unit = session.scope(|| {
            UnitBuilder::new("PROFILE")
                .binary(
                    "avatar",
                    Some("image/png"),
                    |p: &Profile| Bytes::from(p.avatar.clone()),
                    |p, bytes| p.avatar = bytes.to_vec(),
                )
                .build(Profile {
                    name: "Ada".into(),
                    avatar: vec![],
                })
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        unit.lock().avatar = vec![9, 9];
        unit.send_binary("avatar").await.unwrap();

        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "PROFILE:BIN_META:avatar");
        assert_eq!(env.data, json!({"size": 2, "mime": "image/png"}));
        let frame = timeout(Duration::from_secs(2), peer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::Binary(Bytes::from(vec![9u8, 9])));
    }

    #[tokio::test]
    async fn test_unpaired_binary_drops_transport_not_session() {
        let session = Session::new();
        let _unit = notepad_unit(&session);
        let (mut peer, run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_binary(vec![1u8]);
        let result = run.await.unwrap();
        assert!(matches!(
            result,
            Err(SyncError::Protocol(ProtocolError::UnpairedBinary))
        ));

        // the session survives and accepts a new transport
        let (mut peer2, _run2) = connect(&session);
        let env = next_envelope(&mut peer2).await;
        assert_eq!(env.event, "NOTES:SET");
    }

    #[tokio::test]
    async fn test_expose_running_tasks() {
        #[derive(Serialize, Deserialize)]
        struct Empty {}

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("BG")
                .expose_running_tasks()
                .task("work", &[], |_unit: SyncUnit<Empty>, _| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .build(Empty {})
                .unwrap()
        });
        let (mut peer, _run) = connect(&session);
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.data, json!({"running_tasks": []}));

        peer.send_event("BG:TASK_START:WORK", json!(null));
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "BG:PATCH");
        assert_eq!(env.data[0]["value"], "WORK");

        let mut saw_done = false;
        let mut saw_removal = false;
        while !(saw_done && saw_removal) {
            let env = next_envelope(&mut peer).await;
            match env.event.as_str() {
                "BG:TASK_DONE:WORK" => saw_done = true,
                "BG:PATCH" => saw_removal = true,
                other => panic!("unexpected event {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_toast_and_server_action() {
        let session = Session::new();
        let unit = notepad_unit(&session);
        let (mut peer, _run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        unit.toast(ToastLevel::Success, "saved").await.unwrap();
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "_TOAST");
        assert_eq!(env.data, json!({"type": "success", "message": "saved"}));

        unit.send_action("highlight", json!({"index": 0}))
            .await
            .unwrap();
        let env = next_envelope(&mut peer).await;
        assert_eq!(env.event, "NOTES:ACTION:HIGHLIGHT");
        assert_eq!(env.data, json!({"index": 0}));
    }

    #[tokio::test]
    async fn test_close_cancels_tasks_and_rejects_reattach() {
        #[derive(Serialize, Deserialize)]
        struct Empty {}

        let session = Session::new();
        let _unit = session.scope(|| {
            UnitBuilder::new("BG")
                .task("forever", &[], |_unit: SyncUnit<Empty>, _| async move {
                    loop {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .build(Empty {})
                .unwrap()
        });
        let (mut peer, run) = connect(&session);
        let _ = next_envelope(&mut peer).await;

        peer.send_event("BG:TASK_START:FOREVER", json!(null));
        // give the dispatcher a beat to spawn the task
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.task_running("BG", "FOREVER"));

        session.close();
        run.await.unwrap().unwrap();
        assert!(!session.task_running("BG", "FOREVER"));

        let (transport, _peer2) = memory_pair();
        assert!(matches!(
            session.attach(Box::new(transport)),
            Err(SyncError::Closed)
        ));
    }

    #[test]
    fn test_session_scope_nesting() {
        let s1 = Session::new();
        let s2 = Session::new();

        let is = |s: &Session| {
            let current = current_session().unwrap();
            Arc::ptr_eq(&current.inner, &s.inner)
        };

        assert!(current_session().is_none());
        s1.scope(|| {
            assert!(is(&s1));
            s2.scope(|| {
                assert!(is(&s2));
                s1.scope(|| assert!(is(&s1)));
                assert!(is(&s2));
            });
            assert!(is(&s1));
        });
        assert!(current_session().is_none());
    }

    #[tokio::test]
    async fn test_task_table_bookkeeping() {
        let session = Session::new();
        let handle = tokio::spawn(async {});
        session.insert_task(
            "K",
            "T",
            TaskEntry {
                abort: handle.abort_handle(),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        assert!(session.task_running("K", "T"));
        assert_eq!(session.running_for("K"), vec!["T".to_string()]);
        session.remove_task("K", "T");
        assert!(!session.task_running("K", "T"));
    }
}
