//! Synced objects: projection, diffing and patch emission.
//!
//! A [`SyncUnit`] keeps one server-side object in agreement with the
//! client. The object serializes to a JSON projection; `sync()` diffs the
//! projection against the last snapshot the peer holds and ships the
//! delta as an RFC 6902 patch. Inbound `SET`/`PATCH` events flow the other
//! way, validated field-by-field before anything touches the object.
//!
//! Units are declared with [`UnitBuilder`]: which fields to expose (all,
//! or an explicit subset, renamed or camelCased), which actions and tasks
//! the client may invoke, and which fields carry out-of-band binary data.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use json_patch::Patch;
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::protocol::{
    action_event, bin_meta_event, error_event, get_event, patch_event, set_event,
    task_cancel_event, task_done_event, task_start_event, BinaryMeta, Envelope, ErrorCode,
    ErrorReport, ProtocolError, TaskDone, TaskOutcome, Toast, ToastLevel, MAX_BINARY_SIZE,
    TOAST_EVENT,
};
use crate::session::{current_session, BinarySink, Session, TaskEntry};
use crate::validate::{SchemaValidator, TypeSpec, Validator};
use crate::{SyncError, SyncResult};

/// Errors returned by user-provided handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Callback<O> = Arc<dyn Fn(SyncUnit<O>, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type ReadFn<O> = Arc<dyn Fn(&O) -> Bytes + Send + Sync>;
type WriteFn<O> = Arc<dyn Fn(&mut O, Bytes) + Send + Sync>;

enum Mode {
    /// Every serialized field, minus exclusions
    All,
    /// Only the enumerated fields
    Only(Vec<String>),
}

struct ActionDecl<O> {
    name: String,
    params: Vec<(String, TypeSpec)>,
    handler: Callback<O>,
}

struct TaskDecl<O> {
    name: String,
    params: Vec<(String, TypeSpec)>,
    factory: Callback<O>,
}

struct BinaryDecl<O> {
    attr: String,
    mime: Option<String>,
    read: ReadFn<O>,
    write: WriteFn<O>,
}

struct BinaryBinding<O> {
    exposed: String,
    mime: Option<String>,
    read: ReadFn<O>,
    write: WriteFn<O>,
    /// Occupied between a metadata envelope and its binary frame
    pending: Mutex<Option<BinaryMeta>>,
}

/// Declarative configuration of a sync unit.
pub struct UnitBuilder<O> {
    key: String,
    mode: Mode,
    renames: HashMap<String, String>,
    excludes: Vec<String>,
    types: HashMap<String, TypeSpec>,
    camel_case: bool,
    send_on_init: bool,
    expose_running: bool,
    validator: Option<Arc<dyn Validator>>,
    actions: Vec<ActionDecl<O>>,
    tasks: Vec<TaskDecl<O>>,
    cancels: Vec<(String, Callback<O>)>,
    binary: Vec<BinaryDecl<O>>,
}

impl<O> UnitBuilder<O>
where
    O: Serialize + DeserializeOwned + Send + 'static,
{
    /// Sync every field the object serializes to, under its own name.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: Mode::All,
            renames: HashMap::new(),
            excludes: Vec::new(),
            types: HashMap::new(),
            camel_case: false,
            send_on_init: true,
            expose_running: false,
            validator: None,
            actions: Vec::new(),
            tasks: Vec::new(),
            cancels: Vec::new(),
            binary: Vec::new(),
        }
    }

    /// Sync only the enumerated fields.
    pub fn only(key: impl Into<String>, attrs: &[&str]) -> Self {
        let mut builder = Self::new(key);
        builder.mode = Mode::Only(attrs.iter().map(|a| a.to_string()).collect());
        builder
    }

    /// Leave one field out of the projection (sync-all mode).
    pub fn exclude(mut self, attr: &str) -> Self {
        self.excludes.push(attr.to_string());
        self
    }

    /// Expose `attr` under a different name.
    pub fn rename(mut self, attr: &str, exposed: &str) -> Self {
        self.renames.insert(attr.to_string(), exposed.to_string());
        self
    }

    /// Expose snake_case field, action and task names as camelCase.
    pub fn camel_case(mut self) -> Self {
        self.camel_case = true;
        self
    }

    /// Whether to emit full state as soon as a transport attaches.
    /// Defaults to true.
    pub fn send_on_init(mut self, send: bool) -> Self {
        self.send_on_init = send;
        self
    }

    /// Add an engine-maintained projection field listing the names of the
    /// unit's running tasks.
    pub fn expose_running_tasks(mut self) -> Self {
        self.expose_running = true;
        self
    }

    /// Replace the default structural validator.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Declare a field's type; inbound values for it are validated.
    pub fn typed(mut self, attr: &str, spec: TypeSpec) -> Self {
        self.types.insert(attr.to_string(), spec);
        self
    }

    /// Declare an action. The name is exposed upper-snake-cased (or
    /// camelCased when the transform is on); declared parameters are
    /// validated before the handler runs.
    pub fn action<F, Fut>(mut self, name: &str, params: &[(&str, TypeSpec)], handler: F) -> Self
    where
        F: Fn(SyncUnit<O>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.actions.push(ActionDecl {
            name: name.to_string(),
            params: own_params(params),
            handler: Arc::new(move |unit, args| handler(unit, args).boxed()),
        });
        self
    }

    /// Declare an action whose handler blocks; it runs on the worker pool
    /// so the dispatcher stays responsive.
    pub fn action_blocking<F>(mut self, name: &str, params: &[(&str, TypeSpec)], handler: F) -> Self
    where
        F: Fn(SyncUnit<O>, Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.actions.push(ActionDecl {
            name: name.to_string(),
            params: own_params(params),
            handler: offload_blocking(handler),
        });
        self
    }

    /// Declare a task: a long-running, cancellable method spawned
    /// concurrently with event dispatch.
    pub fn task<F, Fut>(mut self, name: &str, params: &[(&str, TypeSpec)], factory: F) -> Self
    where
        F: Fn(SyncUnit<O>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.tasks.push(TaskDecl {
            name: name.to_string(),
            params: own_params(params),
            factory: Arc::new(move |unit, args| factory(unit, args).boxed()),
        });
        self
    }

    /// Blocking-body variant of [`task`](Self::task).
    pub fn task_blocking<F>(mut self, name: &str, params: &[(&str, TypeSpec)], factory: F) -> Self
    where
        F: Fn(SyncUnit<O>, Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.tasks.push(TaskDecl {
            name: name.to_string(),
            params: own_params(params),
            factory: offload_blocking(factory),
        });
        self
    }

    /// Declare the cancel handler for a task. It typically flips a flag
    /// the task body observes; without one, cancellation aborts the
    /// task's suspension instead.
    pub fn task_cancel<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(SyncUnit<O>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.cancels.push((
            name.to_string(),
            Arc::new(move |unit, args| handler(unit, args).boxed()),
        ));
        self
    }

    /// Declare a field carrying bulk binary data. It is excluded from the
    /// JSON projection and transferred as a metadata envelope paired with
    /// a binary frame.
    pub fn binary<R, W>(mut self, attr: &str, mime: Option<&str>, read: R, write: W) -> Self
    where
        R: Fn(&O) -> Bytes + Send + Sync + 'static,
        W: Fn(&mut O, Bytes) + Send + Sync + 'static,
    {
        self.binary.push(BinaryDecl {
            attr: attr.to_string(),
            mime: mime.map(|m| m.to_string()),
            read: Arc::new(read),
            write: Arc::new(write),
        });
        self
    }

    /// Register against the ambient session (see [`Session::scope`]).
    pub fn build(self, owner: O) -> SyncResult<SyncUnit<O>> {
        let session = current_session().ok_or(SyncError::NoAmbientSession)?;
        self.build_in(owner, &session)
    }

    /// Register against an explicit session.
    pub fn build_in(self, owner: O, session: &Session) -> SyncResult<SyncUnit<O>> {
        crate::protocol::validate_key(&self.key)?;

        let initial = serde_json::to_value(&owner)?;
        let Value::Object(initial_map) = initial else {
            return Err(SyncError::Config(
                "synced objects must serialize to a JSON object".into(),
            ));
        };

        let binary_attrs: Vec<String> = self.binary.iter().map(|b| b.attr.clone()).collect();
        let attrs: Vec<String> = match &self.mode {
            Mode::All => initial_map
                .keys()
                .filter(|attr| !self.excludes.iter().any(|e| e == *attr))
                .filter(|attr| !binary_attrs.iter().any(|b| b == *attr))
                .cloned()
                .collect(),
            Mode::Only(list) => {
                for attr in list {
                    if !initial_map.contains_key(attr) {
                        return Err(SyncError::Config(format!("no field {attr:?} to sync")));
                    }
                }
                list.clone()
            }
        };

        let mut key_map = Vec::with_capacity(attrs.len());
        let mut reverse = HashMap::with_capacity(attrs.len());
        for attr in &attrs {
            let exposed = match self.renames.get(attr) {
                Some(rename) => rename.clone(),
                None => expose_field(attr, self.camel_case),
            };
            if reverse.insert(exposed.clone(), attr.clone()).is_some() {
                return Err(SyncError::Config(format!(
                    "duplicate exposed field {exposed:?}"
                )));
            }
            key_map.push((attr.clone(), exposed));
        }

        let running_field = expose_field("running_tasks", self.camel_case);
        if self.expose_running && reverse.contains_key(&running_field) {
            return Err(SyncError::Config(format!(
                "field {running_field:?} collides with the running-task list"
            )));
        }

        // action and task names share a namespace once transformed
        let mut taken: Vec<String> = Vec::new();
        let mut actions = HashMap::new();
        for decl in self.actions {
            let exposed = expose_name(&decl.name, self.camel_case);
            if taken.contains(&exposed) {
                return Err(SyncError::Config(format!("duplicate action {exposed:?}")));
            }
            taken.push(exposed.clone());
            actions.insert(exposed, (decl.params, decl.handler));
        }
        let mut tasks = HashMap::new();
        for decl in self.tasks {
            let exposed = expose_name(&decl.name, self.camel_case);
            if taken.contains(&exposed) {
                return Err(SyncError::Config(format!(
                    "task {exposed:?} collides with another action or task"
                )));
            }
            taken.push(exposed.clone());
            tasks.insert(exposed, (decl.params, decl.factory, None::<Callback<O>>));
        }
        for (name, handler) in self.cancels {
            let exposed = expose_name(&name, self.camel_case);
            let Some(entry) = tasks.get_mut(&exposed) else {
                return Err(SyncError::Config(format!(
                    "cancel handler for unknown task {exposed:?}"
                )));
            };
            entry.2 = Some(handler);
        }

        let mut bindings = HashMap::with_capacity(self.binary.len());
        for decl in self.binary {
            let exposed = expose_field(&decl.attr, self.camel_case);
            bindings.insert(
                decl.attr.clone(),
                BinaryBinding {
                    exposed,
                    mime: decl.mime,
                    read: decl.read,
                    write: decl.write,
                    pending: Mutex::new(None),
                },
            );
        }

        let key = self.key;
        let mut events = vec![set_event(&key), get_event(&key), patch_event(&key)];
        events.extend(actions.keys().map(|name| action_event(&key, name)));
        for name in tasks.keys() {
            events.push(task_start_event(&key, name));
            events.push(task_cancel_event(&key, name));
        }
        let bin_events: Vec<String> = bindings
            .values()
            .map(|b| bin_meta_event(&key, &b.exposed))
            .collect();

        let unit = SyncUnit {
            inner: Arc::new(UnitInner {
                key,
                session: session.clone(),
                owner: Mutex::new(owner),
                key_map,
                reverse,
                types: self.types,
                validator: self
                    .validator
                    .unwrap_or_else(|| Arc::new(SchemaValidator)),
                snapshot: Mutex::new(None),
                binary: bindings,
                camel_case: self.camel_case,
                expose_running: self.expose_running,
                running_field,
                events,
                bin_events,
            }),
        };

        if let Err(e) = unit.register(session, actions, tasks, self.send_on_init) {
            unit.detach();
            return Err(e);
        }

        if self.send_on_init && session.is_attached() {
            let _ = unit.emit_full_state();
        }
        Ok(unit)
    }
}

fn own_params(params: &[(&str, TypeSpec)]) -> Vec<(String, TypeSpec)> {
    params
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect()
}

fn offload_blocking<O, F>(handler: F) -> Callback<O>
where
    O: Send + 'static,
    F: Fn(SyncUnit<O>, Value) -> HandlerResult + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |unit, args| {
        let handler = handler.clone();
        async move {
            match tokio::task::spawn_blocking(move || handler(unit, args)).await {
                Ok(result) => result,
                Err(join) => Err(Box::new(join) as HandlerError),
            }
        }
        .boxed()
    })
}

struct UnitInner<O> {
    key: String,
    session: Session,
    owner: Mutex<O>,
    /// (field, exposed name), declaration order
    key_map: Vec<(String, String)>,
    reverse: HashMap<String, String>,
    types: HashMap<String, TypeSpec>,
    validator: Arc<dyn Validator>,
    /// The projection the peer currently holds; absent until the first
    /// emission on the current transport
    snapshot: Mutex<Option<Value>>,
    binary: HashMap<String, BinaryBinding<O>>,
    camel_case: bool,
    expose_running: bool,
    running_field: String,
    events: Vec<String>,
    bin_events: Vec<String>,
}

/// Handle to a registered sync unit. Cheap to clone.
pub struct SyncUnit<O> {
    inner: Arc<UnitInner<O>>,
}

impl<O> Clone for SyncUnit<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O> SyncUnit<O> {
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Lock the owned object for reading or mutation. Do not hold the
    /// guard across an `await`.
    pub fn lock(&self) -> MutexGuard<'_, O> {
        self.inner.owner.lock()
    }

    /// Names of this unit's currently running tasks.
    pub fn running_tasks(&self) -> Vec<String> {
        self.inner.session.running_for(&self.inner.key)
    }

    /// Remove this unit from its session without ending the session.
    pub fn detach(&self) {
        for event in &self.inner.events {
            self.inner.session.deregister_event(event);
        }
        for event in &self.inner.bin_events {
            self.inner.session.deregister_binary(event);
        }
        self.inner.session.deregister_init(&self.inner.key);
    }
}

impl<O> SyncUnit<O>
where
    O: Serialize + DeserializeOwned + Send + 'static,
{
    /// Recompute the projection, diff against the last snapshot and send
    /// the delta. A no-op while no transport is attached, and silent when
    /// nothing changed.
    pub async fn sync(&self) -> SyncResult<()> {
        if !self.inner.session.is_attached() {
            return Ok(());
        }
        let mut snapshot = self.inner.snapshot.lock();
        let next = match self.project() {
            Ok(value) => value,
            Err(e) => {
                self.emit_error(
                    None,
                    ErrorReport {
                        code: ErrorCode::Projection,
                        message: e.to_string(),
                        path: None,
                    },
                );
                return Err(e);
            }
        };
        match snapshot.as_ref() {
            None => {
                self.inner
                    .session
                    .send(&Envelope::new(set_event(&self.inner.key), next.clone()))?;
            }
            Some(prev) => {
                let patch = json_patch::diff(prev, &next);
                if !patch.0.is_empty() {
                    self.inner.session.send(&Envelope::new(
                        patch_event(&self.inner.key),
                        serde_json::to_value(&patch)?,
                    ))?;
                }
            }
        }
        *snapshot = Some(next);
        Ok(())
    }

    /// Emit an unconditional full `SET`, refreshing the snapshot.
    pub async fn send_state(&self) -> SyncResult<()> {
        self.emit_full_state()
    }

    /// Transfer a binary field to the peer: its metadata envelope
    /// immediately followed by the payload frame.
    pub async fn send_binary(&self, attr: &str) -> SyncResult<()> {
        if !self.inner.session.is_attached() {
            return Ok(());
        }
        let binding = self
            .inner
            .binary
            .get(attr)
            .ok_or_else(|| SyncError::Config(format!("no binary field {attr:?}")))?;
        let payload = (binding.read)(&self.inner.owner.lock());
        let meta = BinaryMeta {
            size: payload.len() as u64,
            mime: binding.mime.clone(),
        };
        let env = Envelope::new(
            bin_meta_event(&self.inner.key, &binding.exposed),
            serde_json::to_value(&meta)?,
        );
        self.inner.session.send_with_binary(&env, payload)
    }

    /// Dispatch an action to the client.
    pub async fn send_action(&self, name: &str, data: Value) -> SyncResult<()> {
        let name = expose_name(name, self.inner.camel_case);
        self.inner
            .session
            .send(&Envelope::new(action_event(&self.inner.key, &name), data))
    }

    /// Show a transient notification on the client.
    pub async fn toast(&self, level: ToastLevel, message: impl Into<String>) -> SyncResult<()> {
        let toast = Toast {
            level,
            message: message.into(),
        };
        self.inner
            .session
            .send(&Envelope::new(TOAST_EVENT, serde_json::to_value(&toast)?))
    }

    // ===== Projection =====

    fn project(&self) -> SyncResult<Value> {
        let full = {
            let owner = self.inner.owner.lock();
            serde_json::to_value(&*owner).map_err(|e| SyncError::Projection(e.to_string()))?
        };
        let Value::Object(mut full) = full else {
            return Err(SyncError::Projection(
                "synced objects must serialize to a JSON object".into(),
            ));
        };
        let mut out = serde_json::Map::new();
        for (attr, exposed) in &self.inner.key_map {
            if let Some(value) = full.remove(attr) {
                let value = self
                    .inner
                    .validator
                    .project(value)
                    .map_err(|e| SyncError::Projection(e.to_string()))?;
                out.insert(exposed.clone(), value);
            }
        }
        if self.inner.expose_running {
            let names = self.inner.session.running_for(&self.inner.key);
            out.insert(self.inner.running_field.clone(), Value::from(names));
        }
        Ok(Value::Object(out))
    }

    fn emit_full_state(&self) -> SyncResult<()> {
        // a transfer interrupted by a transport drop must not wedge its slot
        for binding in self.inner.binary.values() {
            binding.pending.lock().take();
        }
        let mut snapshot = self.inner.snapshot.lock();
        let next = match self.project() {
            Ok(value) => value,
            Err(e) => {
                self.emit_error(
                    None,
                    ErrorReport {
                        code: ErrorCode::Projection,
                        message: e.to_string(),
                        path: None,
                    },
                );
                return Err(e);
            }
        };
        self.inner
            .session
            .send(&Envelope::new(set_event(&self.inner.key), next.clone()))?;
        *snapshot = Some(next);
        Ok(())
    }

    /// Validate an inbound projection and assign it onto the owner. The
    /// owner is untouched unless every field passes.
    fn assign_projection(&self, incoming: Value) -> Result<(), ErrorReport> {
        let Value::Object(incoming) = incoming else {
            return Err(ErrorReport {
                code: ErrorCode::Validation,
                message: "expected a state object".into(),
                path: None,
            });
        };

        let mut staged: Vec<(String, Value)> = Vec::with_capacity(incoming.len());
        for (exposed, value) in incoming {
            if self.inner.expose_running && exposed == self.inner.running_field {
                continue;
            }
            let Some(attr) = self.inner.reverse.get(&exposed) else {
                return Err(ErrorReport {
                    code: ErrorCode::Validation,
                    message: format!("unknown field {exposed:?}"),
                    path: Some(format!("/{exposed}")),
                });
            };
            let value = match self.inner.types.get(attr) {
                Some(spec) => self
                    .inner
                    .validator
                    .validate(spec, value)
                    .map_err(|e| ErrorReport {
                        code: ErrorCode::Validation,
                        message: format!("expected {}, got {}", e.expected, e.found),
                        path: Some(format!("/{exposed}{}", e.path)),
                    })?,
                None => value,
            };
            staged.push((attr.clone(), value));
        }

        let mut snapshot = self.inner.snapshot.lock();
        {
            let mut owner = self.inner.owner.lock();
            let mut full = serde_json::to_value(&*owner).map_err(|e| ErrorReport {
                code: ErrorCode::Projection,
                message: e.to_string(),
                path: None,
            })?;
            let Some(full_map) = full.as_object_mut() else {
                return Err(ErrorReport {
                    code: ErrorCode::Projection,
                    message: "synced objects must serialize to a JSON object".into(),
                    path: None,
                });
            };
            for (attr, value) in staged {
                full_map.insert(attr, value);
            }
            let next: O = serde_json::from_value(full).map_err(|e| ErrorReport {
                code: ErrorCode::Validation,
                message: e.to_string(),
                path: None,
            })?;
            *owner = next;
        }
        *snapshot = Some(self.project().map_err(|e| ErrorReport {
            code: ErrorCode::Projection,
            message: e.to_string(),
            path: None,
        })?);
        Ok(())
    }

    fn coerce_args(
        &self,
        params: &[(String, TypeSpec)],
        data: Value,
    ) -> Result<Value, ErrorReport> {
        let mut bag = match data {
            Value::Object(bag) => bag,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(ErrorReport {
                    code: ErrorCode::Validation,
                    message: "expected an argument object".into(),
                    path: None,
                })
            }
        };
        for (name, spec) in params {
            let value = match bag.remove(name) {
                Some(value) => value,
                None if matches!(spec, TypeSpec::Optional(_)) => Value::Null,
                None => {
                    return Err(ErrorReport {
                        code: ErrorCode::Validation,
                        message: format!("missing argument {name:?}"),
                        path: Some(format!("/{name}")),
                    })
                }
            };
            let value = self
                .inner
                .validator
                .validate(spec, value)
                .map_err(|e| ErrorReport {
                    code: ErrorCode::Validation,
                    message: format!("expected {}, got {}", e.expected, e.found),
                    path: Some(format!("/{name}{}", e.path)),
                })?;
            bag.insert(name.clone(), value);
        }
        Ok(Value::Object(bag))
    }

    fn emit_error(&self, name: Option<&str>, report: ErrorReport) {
        warn!(
            key = %self.inner.key,
            name = name.unwrap_or(""),
            error = %report.message,
            "reporting error to client"
        );
        match serde_json::to_value(&report) {
            Ok(data) => {
                let _ = self
                    .inner
                    .session
                    .send(&Envelope::new(error_event(&self.inner.key, name), data));
            }
            Err(e) => warn!(error = %e, "failed to encode error report"),
        }
    }

    // ===== Handler registration =====

    #[allow(clippy::type_complexity)]
    fn register(
        &self,
        session: &Session,
        actions: HashMap<String, (Vec<(String, TypeSpec)>, Callback<O>)>,
        tasks: HashMap<String, (Vec<(String, TypeSpec)>, Callback<O>, Option<Callback<O>>)>,
        send_on_init: bool,
    ) -> SyncResult<()> {
        let key = self.inner.key.clone();

        {
            let unit = self.clone();
            session.register_event(
                &set_event(&key),
                Arc::new(move |data| {
                    let unit = unit.clone();
                    async move {
                        if let Err(report) = unit.assign_projection(data) {
                            unit.emit_error(None, report);
                        }
                        Ok(())
                    }
                    .boxed()
                }),
            )?;
        }
        {
            let unit = self.clone();
            session.register_event(
                &get_event(&key),
                Arc::new(move |_| {
                    let unit = unit.clone();
                    async move {
                        let _ = unit.emit_full_state();
                        Ok(())
                    }
                    .boxed()
                }),
            )?;
        }
        {
            let unit = self.clone();
            session.register_event(
                &patch_event(&key),
                Arc::new(move |data| {
                    let unit = unit.clone();
                    async move {
                        unit.handle_inbound_patch(data);
                        Ok(())
                    }
                    .boxed()
                }),
            )?;
        }

        for (name, (params, handler)) in actions {
            let unit = self.clone();
            let params = Arc::new(params);
            let action_name = name.clone();
            session.register_event(
                &action_event(&key, &name),
                Arc::new(move |data| {
                    let unit = unit.clone();
                    let handler = handler.clone();
                    let params = params.clone();
                    let name = action_name.clone();
                    async move {
                        let args = match unit.coerce_args(&params, data) {
                            Ok(args) => args,
                            Err(report) => {
                                unit.emit_error(Some(&name), report);
                                return Ok(());
                            }
                        };
                        if let Err(e) = handler(unit.clone(), args).await {
                            unit.emit_error(
                                Some(&name),
                                ErrorReport {
                                    code: ErrorCode::Handler,
                                    message: e.to_string(),
                                    path: None,
                                },
                            );
                        }
                        Ok(())
                    }
                    .boxed()
                }),
            )?;
        }

        for (name, (params, factory, cancel)) in tasks {
            {
                let unit = self.clone();
                let params = Arc::new(params);
                let factory = factory.clone();
                let task_name = name.clone();
                session.register_event(
                    &task_start_event(&key, &name),
                    Arc::new(move |data| {
                        let unit = unit.clone();
                        let factory = factory.clone();
                        let params = params.clone();
                        let name = task_name.clone();
                        async move {
                            unit.handle_task_start(&name, &params, &factory, data).await;
                            Ok(())
                        }
                        .boxed()
                    }),
                )?;
            }
            {
                let unit = self.clone();
                let task_name = name.clone();
                session.register_event(
                    &task_cancel_event(&key, &name),
                    Arc::new(move |_| {
                        let unit = unit.clone();
                        let name = task_name.clone();
                        let cancel = cancel.clone();
                        async move {
                            unit.handle_task_cancel(&name, cancel).await;
                            Ok(())
                        }
                        .boxed()
                    }),
                )?;
            }
        }

        for (attr, binding) in self.inner.binary.iter() {
            let unit = self.clone();
            let attr = attr.clone();
            session.register_binary(
                &bin_meta_event(&key, &binding.exposed),
                Arc::new(move |meta| unit.handle_binary_meta(&attr, meta)),
            )?;
        }

        if send_on_init {
            let unit = self.clone();
            session.register_init(
                &key,
                Arc::new(move || unit.emit_full_state()),
            );
        }
        Ok(())
    }

    fn handle_inbound_patch(&self, data: Value) {
        let patch: Patch = match serde_json::from_value(data) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(key = %self.inner.key, error = %e, "discarding malformed patch");
                return;
            }
        };
        let held = {
            let snapshot = self.inner.snapshot.lock();
            snapshot.clone()
        };
        let mut doc = match held {
            Some(doc) => doc,
            None => match self.project() {
                Ok(doc) => doc,
                Err(e) => {
                    self.emit_error(
                        None,
                        ErrorReport {
                            code: ErrorCode::Projection,
                            message: e.to_string(),
                            path: None,
                        },
                    );
                    return;
                }
            },
        };
        if let Err(e) = json_patch::patch(&mut doc, &patch) {
            self.emit_error(
                None,
                ErrorReport {
                    code: ErrorCode::Protocol,
                    message: e.to_string(),
                    path: None,
                },
            );
            return;
        }
        if let Err(report) = self.assign_projection(doc) {
            self.emit_error(None, report);
        }
    }

    async fn handle_task_start(
        &self,
        name: &str,
        params: &[(String, TypeSpec)],
        factory: &Callback<O>,
        data: Value,
    ) {
        let args = match self.coerce_args(params, data) {
            Ok(args) => args,
            Err(report) => {
                self.emit_error(Some(name), report);
                return;
            }
        };
        let session = self.inner.session.clone();
        let key = self.inner.key.clone();
        if session.task_running(&key, name) {
            warn!(key = %key, task = %name, "task already running; discarding start");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let body = tokio::spawn(factory(self.clone(), args));
        session.insert_task(
            &key,
            name,
            TaskEntry {
                abort: body.abort_handle(),
                cancelled: cancelled.clone(),
            },
        );
        if self.inner.expose_running {
            let _ = self.sync().await;
        }

        let unit = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let joined = body.await;
            let flagged = cancelled.load(Ordering::SeqCst);
            let (outcome, error) = match joined {
                Ok(Ok(())) => (
                    if flagged {
                        TaskOutcome::Cancelled
                    } else {
                        TaskOutcome::Completed
                    },
                    None,
                ),
                Ok(Err(e)) => {
                    if flagged {
                        (TaskOutcome::Cancelled, None)
                    } else {
                        (TaskOutcome::Failed, Some(e.to_string()))
                    }
                }
                Err(join) if join.is_cancelled() => (TaskOutcome::Cancelled, None),
                Err(join) => (TaskOutcome::Failed, Some(join.to_string())),
            };
            let session = unit.inner.session.clone();
            session.remove_task(&unit.inner.key, &name);
            let done = TaskDone { outcome, error };
            if let Ok(data) = serde_json::to_value(&done) {
                let _ = session.send(&Envelope::new(
                    task_done_event(&unit.inner.key, &name),
                    data,
                ));
            }
            if unit.inner.expose_running {
                let _ = unit.sync().await;
            }
        });
    }

    async fn handle_task_cancel(&self, name: &str, cancel: Option<Callback<O>>) {
        let session = self.inner.session.clone();
        let Some(entry) = session.get_task(&self.inner.key, name) else {
            warn!(key = %self.inner.key, task = %name, "cancel for task that is not running");
            return;
        };
        entry.cancelled.store(true, Ordering::SeqCst);
        match cancel {
            Some(handler) => {
                if let Err(e) = handler(self.clone(), Value::Null).await {
                    self.emit_error(
                        Some(name),
                        ErrorReport {
                            code: ErrorCode::Handler,
                            message: e.to_string(),
                            path: None,
                        },
                    );
                }
            }
            None => entry.abort.abort(),
        }
    }

    fn handle_binary_meta(&self, attr: &str, meta: Value) -> SyncResult<BinarySink> {
        let meta: BinaryMeta = serde_json::from_value(meta).map_err(ProtocolError::from)?;
        if meta.size > MAX_BINARY_SIZE {
            return Err(ProtocolError::PayloadTooLarge(meta.size, MAX_BINARY_SIZE).into());
        }
        let binding = self
            .inner
            .binary
            .get(attr)
            .ok_or_else(|| SyncError::Config(format!("no binary field {attr:?}")))?;
        {
            let mut pending = binding.pending.lock();
            if pending.is_some() {
                return Err(ProtocolError::DuplicateBinaryMeta(attr.to_string()).into());
            }
            *pending = Some(meta);
        }

        let unit = self.clone();
        let attr = attr.to_string();
        Ok(Arc::new(move |bytes: Bytes| {
            let binding = unit
                .inner
                .binary
                .get(&attr)
                .ok_or_else(|| SyncError::Config(format!("no binary field {attr:?}")))?;
            let meta = binding
                .pending
                .lock()
                .take()
                .ok_or(ProtocolError::UnpairedBinary)?;
            if bytes.len() as u64 != meta.size {
                return Err(ProtocolError::SizeMismatch {
                    announced: meta.size,
                    received: bytes.len() as u64,
                }
                .into());
            }
            (binding.write)(&mut unit.inner.owner.lock(), bytes);
            Ok(())
        }))
    }
}

// ===== Name transforms =====

pub(crate) fn to_camel(name: &str) -> String {
    let mut parts = name.split('_').filter(|part| !part.is_empty());
    let mut out = String::with_capacity(name.len());
    if let Some(first) = parts.next() {
        out.push_str(&first.to_ascii_lowercase());
    }
    for part in parts {
        let lower = part.to_ascii_lowercase();
        let mut chars = lower.chars();
        if let Some(head) = chars.next() {
            out.push(head.to_ascii_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

fn expose_field(attr: &str, camel: bool) -> String {
    if camel {
        to_camel(attr)
    } else {
        attr.to_string()
    }
}

fn expose_name(name: &str, camel: bool) -> String {
    if camel {
        to_camel(name)
    } else {
        name.to_ascii_uppercase()
    }
}
