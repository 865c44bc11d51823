//! In-process stand-in for a hypervisor, for tests.
//!
//! [`MockHypervisor`] serves the Firecracker or Cloud-Hypervisor control API
//! on a real unix socket with hyper, records every request, and writes
//! snapshot files the way the real thing lays them out (diff memfiles are
//! sparse). [`MockLauncher`] plugs it in wherever a [`Launcher`] is expected.

use crate::config::VmmType;
use crate::error::{Result, VmError};
use crate::process::{LaunchSpec, Launcher, VmmProcess};
use async_trait::async_trait;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PAGE_SIZE: u64 = 4096;
const DIFF_DIRTY_PAGES: u64 = 16;
const FULL_WRITTEN_PAGES: u64 = 256;

/// A request as the mock saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

impl RecordedRequest {
    /// `"PUT /boot-source"` style label.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Default)]
struct VmModel {
    running: bool,
    paused: bool,
    mem_size_mib: u64,
    track_dirty_pages: bool,
}

#[derive(Debug)]
struct MockState {
    vmm_type: VmmType,
    requests: Mutex<Vec<RecordedRequest>>,
    failures: Mutex<HashMap<String, (u16, String)>>,
    drop_connections: AtomicU32,
    /// Per-path count of requests to answer by closing the connection.
    drop_requests: Mutex<HashMap<String, u32>>,
    vm: Mutex<VmModel>,
}

/// A fake hypervisor listening on a unix socket.
#[derive(Debug)]
pub struct MockHypervisor {
    state: Arc<MockState>,
    socket_path: PathBuf,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl MockHypervisor {
    /// Bind `socket_path` and start serving.
    pub async fn start(vmm_type: VmmType, socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let state = Arc::new(MockState {
            vmm_type,
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            drop_connections: AtomicU32::new(0),
            drop_requests: Mutex::new(HashMap::new()),
            vm: Mutex::new(VmModel {
                mem_size_mib: 128,
                ..Default::default()
            }),
        });
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&state), shutdown.clone()));

        tracing::debug!(socket = %socket_path.display(), %vmm_type, "Mock hypervisor listening");
        Ok(Self {
            state,
            socket_path,
            shutdown,
            server: Some(server),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Everything received so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.requests).clone()
    }

    /// Request labels such as `"PUT /drives/rootfs"`, in order.
    pub fn request_labels(&self) -> Vec<String> {
        self.requests().iter().map(RecordedRequest::label).collect()
    }

    /// Answer every request to `path` with `status` until cleared.
    pub fn fail_path(&self, path: &str, status: u16, message: &str) {
        lock(&self.state.failures).insert(path.to_string(), (status, message.to_string()));
    }

    pub fn clear_failures(&self) {
        lock(&self.state.failures).clear();
    }

    /// Read the next `n` requests and close the connection without answering.
    pub fn drop_next_connections(&self, n: u32) {
        self.state.drop_connections.store(n, Ordering::SeqCst);
    }

    /// Close the connection instead of answering the next `n` requests to
    /// `path`. Works on kept-alive connections too.
    pub fn drop_next_requests(&self, path: &str, n: u32) {
        lock(&self.state.drop_requests).insert(path.to_string(), n);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state.vm).running
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state.vm).paused
    }

    /// Stop serving and remove the socket file.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for MockHypervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve(listener: UnixListener, state: Arc<MockState>, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Mock hypervisor accept failed");
                    continue;
                }
            },
        };

        let should_drop = state
            .drop_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_drop {
            tokio::spawn(read_and_hang_up(stream));
            continue;
        }

        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(Arc::clone(&state), req));
            let conn = Http::new().http1_only(true).serve_connection(stream, service);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = conn => {}
            }
        });
    }
}

/// Consume one full request, then close so the client sees an incomplete
/// message rather than a reset.
async fn read_and_hang_up(mut stream: UnixStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= header_end + 4 + content_length {
            return;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serving error; hyper closes the connection without a response.
#[derive(Debug)]
struct HangUp;

impl std::fmt::Display for HangUp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("mock hung up")
    }
}

impl std::error::Error for HangUp {}

async fn handle(state: Arc<MockState>, req: Request<Body>) -> std::result::Result<Response<Body>, HangUp> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    lock(&state.requests).push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        body: body.clone(),
    });

    if let Some(remaining) = lock(&state.drop_requests).get_mut(&path) {
        if *remaining > 0 {
            *remaining -= 1;
            return Err(HangUp);
        }
    }

    if let Some((status, message)) = lock(&state.failures).get(&path).cloned() {
        return Ok(fault(status, &message));
    }

    let outcome = match state.vmm_type {
        VmmType::Firecracker => firecracker_route(&state, &method, &path, &body),
        VmmType::CloudHypervisor => cloud_hypervisor_route(&state, &method, &path, &body),
    };
    Ok(match outcome {
        Ok(Some(value)) => json_response(StatusCode::OK, &value),
        Ok(None) => empty_response(StatusCode::NO_CONTENT),
        Err((status, message)) => fault(status, &message),
    })
}

type RouteResult = std::result::Result<Option<Value>, (u16, String)>;

fn firecracker_route(state: &MockState, method: &Method, path: &str, body: &Value) -> RouteResult {
    match (method, path) {
        (&Method::GET, "/version") => Ok(Some(json!({ "firecracker_version": "1.7.0" }))),
        (&Method::PUT, "/boot-source")
        | (&Method::PUT, "/mmds/config")
        | (&Method::PUT, "/mmds") => Ok(None),
        (&Method::PUT, p) if p.starts_with("/drives/") || p.starts_with("/network-interfaces/") => {
            Ok(None)
        }
        (&Method::PUT, "/machine-config") => {
            let mut vm = lock(&state.vm);
            vm.mem_size_mib = body["mem_size_mib"].as_u64().unwrap_or(vm.mem_size_mib);
            vm.track_dirty_pages = body["track_dirty_pages"].as_bool().unwrap_or(false);
            Ok(None)
        }
        (&Method::PUT, "/actions") => {
            if body["action_type"] == "InstanceStart" {
                let mut vm = lock(&state.vm);
                vm.running = true;
                vm.paused = false;
            }
            Ok(None)
        }
        (&Method::PATCH, "/vm") => {
            let mut vm = lock(&state.vm);
            if !vm.running {
                return Err((400, "VM is not running".into()));
            }
            match body["state"].as_str() {
                Some("Paused") => vm.paused = true,
                Some("Resumed") => vm.paused = false,
                _ => return Err((400, "invalid state".into())),
            }
            Ok(None)
        }
        (&Method::PUT, "/snapshot/create") => {
            let vm = lock(&state.vm);
            if !vm.paused {
                return Err((400, "cannot snapshot a VM that is not paused".into()));
            }
            let diff = body["snapshot_type"] == "Diff";
            if diff && !vm.track_dirty_pages {
                return Err((400, "diff snapshots require dirty page tracking".into()));
            }
            let mem = path_field(body, "mem_file_path")?;
            let snap = path_field(body, "snapshot_path")?;
            write_memfile(&mem, vm.mem_size_mib, diff).map_err(internal)?;
            std::fs::write(&snap, json!({ "mem_size_mib": vm.mem_size_mib }).to_string())
                .map_err(internal)?;
            Ok(None)
        }
        (&Method::PUT, "/snapshot/load") => {
            let snap = path_field(body, "snapshot_path")?;
            let mem = PathBuf::from(body["mem_backend"]["backend_path"].as_str().unwrap_or(""));
            if !snap.is_file() || !mem.is_file() {
                return Err((400, "snapshot files not found".into()));
            }
            let mut vm = lock(&state.vm);
            vm.running = true;
            vm.paused = !body["resume_vm"].as_bool().unwrap_or(false);
            vm.track_dirty_pages = body["enable_diff_snapshots"].as_bool().unwrap_or(false);
            Ok(None)
        }
        _ => Err((404, format!("unknown endpoint {method} {path}"))),
    }
}

fn cloud_hypervisor_route(
    state: &MockState,
    method: &Method,
    path: &str,
    body: &Value,
) -> RouteResult {
    let Some(op) = path.strip_prefix("/api/v1/") else {
        return Err((404, format!("unknown endpoint {method} {path}")));
    };
    let mut vm = lock(&state.vm);
    match (method, op) {
        (&Method::GET, "vmm.ping") => Ok(Some(json!({ "version": "v38.0" }))),
        (&Method::PUT, "vm.create") => {
            let bytes = body["memory"]["size"].as_u64().unwrap_or(128 << 20);
            vm.mem_size_mib = bytes >> 20;
            Ok(None)
        }
        (&Method::PUT, "vm.boot") => {
            vm.running = true;
            Ok(None)
        }
        (&Method::PUT, "vm.pause") | (&Method::PUT, "vm.resume") if !vm.running => {
            Err((500, "VM is not booted".into()))
        }
        (&Method::PUT, "vm.pause") => {
            vm.paused = true;
            Ok(None)
        }
        (&Method::PUT, "vm.resume") => {
            vm.paused = false;
            Ok(None)
        }
        (&Method::PUT, "vm.snapshot") => {
            if !vm.paused {
                return Err((500, "VM is not paused".into()));
            }
            let dir = url_dir(body, "destination_url")?;
            write_memfile(&dir.join("memory-ranges"), vm.mem_size_mib, false).map_err(internal)?;
            std::fs::write(dir.join("state.json"), b"{}").map_err(internal)?;
            Ok(None)
        }
        (&Method::PUT, "vm.restore") => {
            let dir = url_dir(body, "source_url")?;
            if !dir.join("state.json").is_file() {
                return Err((500, "snapshot not found".into()));
            }
            vm.running = true;
            vm.paused = true;
            Ok(None)
        }
        _ => Err((404, format!("unknown endpoint {method} {path}"))),
    }
}

fn path_field(body: &Value, field: &str) -> std::result::Result<PathBuf, (u16, String)> {
    body[field]
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| (400, format!("missing {field}")))
}

fn url_dir(body: &Value, field: &str) -> std::result::Result<PathBuf, (u16, String)> {
    body[field]
        .as_str()
        .and_then(|url| url.strip_prefix("file://"))
        .map(PathBuf::from)
        .ok_or_else(|| (400, format!("invalid {field}")))
}

fn internal(e: std::io::Error) -> (u16, String) {
    (500, e.to_string())
}

/// Size the memfile to guest memory and touch only some pages.
fn write_memfile(path: &Path, mem_size_mib: u64, diff: bool) -> std::io::Result<()> {
    let len = mem_size_mib * 1024 * 1024;
    let mut file = std::fs::File::create(path)?;
    file.set_len(len)?;
    let pages = if diff { DIFF_DIRTY_PAGES } else { FULL_WRITTEN_PAGES };
    let stride = (len / PAGE_SIZE / pages).max(1) * PAGE_SIZE;
    let page = vec![0x5Au8; PAGE_SIZE as usize];
    for i in 0..pages {
        let offset = i * stride;
        if offset + PAGE_SIZE > len {
            break;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page)?;
    }
    file.sync_all()
}

fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("Content-Type", hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn fault(status: u16, message: &str) -> Response<Body> {
    json_response(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &json!({ "fault_message": message }),
    )
}

// ============================================================================
// Launcher
// ============================================================================

/// Launcher that starts a [`MockHypervisor`] instead of a process.
///
/// Clones share state, so a test can keep one handle and give another to
/// the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    inner: Arc<LauncherState>,
}

#[derive(Debug, Default)]
struct LauncherState {
    launched: Mutex<HashMap<String, Arc<MockInstance>>>,
    fail_launch: AtomicBool,
    next_pid: AtomicU32,
    kill_delay: Mutex<Duration>,
}

/// One launched mock, shared between the launcher and its process handle.
#[derive(Debug)]
pub struct MockInstance {
    pub sandbox_id: String,
    pub spec: LaunchSpec,
    hypervisor: tokio::sync::Mutex<Option<MockHypervisor>>,
    requests: Mutex<Vec<RecordedRequest>>,
    exited: AtomicBool,
}

impl MockInstance {
    /// Requests served so far, including after the mock was stopped.
    pub async fn request_labels(&self) -> Vec<String> {
        self.sync_requests().await;
        lock(&self.requests).iter().map(RecordedRequest::label).collect()
    }

    /// Run `f` against the live mock, if it has not been killed.
    pub async fn with_hypervisor<R>(&self, f: impl FnOnce(&MockHypervisor) -> R) -> Option<R> {
        self.hypervisor.lock().await.as_ref().map(f)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn sync_requests(&self) {
        if let Some(hv) = self.hypervisor.lock().await.as_ref() {
            *lock(&self.requests) = hv.requests();
        }
    }

    async fn stop(&self) {
        self.sync_requests().await;
        if let Some(mut hv) = self.hypervisor.lock().await.take() {
            hv.stop().await;
        }
        self.exited.store(true, Ordering::SeqCst);
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following launch fail.
    pub fn set_fail_launch(&self, fail: bool) {
        self.inner.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Make every following kill wait this long before stopping the mock.
    pub fn set_kill_delay(&self, delay: Duration) {
        *lock(&self.inner.kill_delay) = delay;
    }

    /// Most recent instance launched for `sandbox_id`.
    pub fn instance(&self, sandbox_id: &str) -> Option<Arc<MockInstance>> {
        lock(&self.inner.launched).get(sandbox_id).cloned()
    }

    pub fn launched_count(&self) -> usize {
        lock(&self.inner.launched).len()
    }

    /// Simulate the hypervisor dying on its own.
    pub async fn crash(&self, sandbox_id: &str) {
        if let Some(instance) = self.instance(sandbox_id) {
            instance.stop().await;
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>> {
        if self.inner.fail_launch.load(Ordering::SeqCst) {
            return Err(VmError::Process("mock launch failure".into()));
        }
        let hypervisor = MockHypervisor::start(spec.vmm_type, &spec.socket_path).await?;
        let instance = Arc::new(MockInstance {
            sandbox_id: spec.sandbox_id.clone(),
            spec: spec.clone(),
            hypervisor: tokio::sync::Mutex::new(Some(hypervisor)),
            requests: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
        });
        lock(&self.inner.launched).insert(spec.sandbox_id.clone(), Arc::clone(&instance));
        let pid = 100_000 + self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProcess {
            pid,
            instance,
            launcher: Arc::clone(&self.inner),
        }))
    }
}

#[derive(Debug)]
struct MockProcess {
    pid: u32,
    instance: Arc<MockInstance>,
    launcher: Arc<LauncherState>,
}

#[async_trait]
impl VmmProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.instance.has_exited()
    }

    async fn kill(&mut self) -> Result<()> {
        let delay = *lock(&self.launcher.kill_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.instance.stop().await;
        Ok(())
    }
}
