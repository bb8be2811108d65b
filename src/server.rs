use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error};

use crate::error::PipelineError;
use crate::observability::MetricsCollector;
use crate::orchestrator::ChangeNotifier;

pub const LIVE_RELOAD_PATH: &str = "/__livereload";
pub const METRICS_PATH: &str = "/__assetpipe/metrics.json";

const LIVE_RELOAD_CLIENT: &str = r#"<script>
(function () {
  if (!window.EventSource) return;
  var source = new EventSource("/__livereload");
  source.addEventListener("css", function () {
    var links = document.querySelectorAll('link[rel="stylesheet"]');
    for (var i = 0; i < links.length; i++) {
      var href = links[i].href.replace(/[?&]livereload=\d+/, "");
      links[i].href = href + (href.indexOf("?") < 0 ? "?" : "&") + "livereload=" + Date.now();
    }
  });
  source.addEventListener("reload", function () { window.location.reload(); });
})();
</script>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadEvent {
    /// `css` when every changed file is a stylesheet, `reload` otherwise.
    pub kind: &'static str,
    pub paths: Vec<String>,
}

/// Fan-out of change notifications to every connected browser.
#[derive(Clone)]
pub struct ReloadHub {
    sender: broadcast::Sender<ReloadEvent>,
    output_dir: PathBuf,
}

impl ReloadHub {
    pub fn new(output_dir: PathBuf) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender, output_dir }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.sender.subscribe()
    }

    pub fn event_for(&self, changed: &[PathBuf]) -> ReloadEvent {
        let paths: Vec<String> = changed
            .iter()
            .map(|path| {
                let relative = path.strip_prefix(&self.output_dir).unwrap_or(path);
                format!("/{}", relative.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        let css_only = !paths.is_empty()
            && paths
                .iter()
                .all(|path| path.ends_with(".css") || path.ends_with(".css.map"));
        ReloadEvent {
            kind: if css_only { "css" } else { "reload" },
            paths,
        }
    }

    /// Returns the number of clients the event reached.
    pub fn send(&self, changed: &[PathBuf]) -> usize {
        let event = self.event_for(changed);
        debug!(kind = event.kind, files = event.paths.len(), "Notifying browsers");
        self.sender.send(event).unwrap_or(0)
    }
}

impl ChangeNotifier for ReloadHub {
    fn notify(&self, changed: &[PathBuf]) {
        self.send(changed);
    }
}

struct ServerState {
    output_dir: PathBuf,
    live_reload: bool,
    hub: ReloadHub,
    metrics: MetricsCollector,
    closing: watch::Receiver<bool>,
}

/// Static file server for the output directory, running on its own thread
/// with a single-threaded runtime.
pub struct DevServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
    hub: ReloadHub,
}

impl DevServer {
    /// Binds `listen` and starts serving. A bind failure is returned as
    /// [`PipelineError::Bind`].
    pub fn start(
        listen: SocketAddr,
        output_dir: PathBuf,
        live_reload: bool,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build dev server runtime")?;
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, hyper::Error>>();
        let (closing_tx, closing_rx) = watch::channel(false);
        let hub = ReloadHub::new(output_dir.clone());
        let state = Arc::new(ServerState {
            output_dir,
            live_reload,
            hub: hub.clone(),
            metrics,
            closing: closing_rx,
        });

        let thread = std::thread::Builder::new()
            .name("assetpipe-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let make_svc = make_service_fn(move |_| {
                        let state = state.clone();
                        async move {
                            Ok::<_, hyper::Error>(service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            }))
                        }
                    });

                    let builder = match hyper::Server::try_bind(&listen) {
                        Ok(builder) => builder,
                        Err(err) => {
                            addr_tx.send(Err(err)).ok();
                            return;
                        }
                    };
                    addr_tx.send(Ok(builder.local_addr())).ok();
                    let server = builder.serve(make_svc);
                    let graceful = server.with_graceful_shutdown(async move {
                        let _ = rx.await;
                        let _ = closing_tx.send(true);
                    });

                    if let Err(err) = graceful.await {
                        error!(error = %err, "Dev server error");
                    }
                });
            })
            .context("Failed to spawn dev server thread")?;

        let address = match addr_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(source)) => {
                let _ = thread.join();
                return Err(PipelineError::Bind {
                    addr: listen,
                    source,
                }
                .into());
            }
            Err(_) => {
                let _ = thread.join();
                return Err(anyhow!("Dev server thread exited before binding {listen}"));
            }
        };

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
            hub,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn reload_hub(&self) -> ReloadHub {
        self.hub.clone()
    }

    pub fn notify(&self, changed: &[PathBuf]) -> usize {
        self.hub.send(changed)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    drop(req);

    let response = match (&method, path.as_str()) {
        (&Method::GET, LIVE_RELOAD_PATH) if state.live_reload => event_stream(&state),
        (&Method::GET, METRICS_PATH) => {
            let body = serde_json::to_vec(&state.metrics.snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            respond(StatusCode::OK, "application/json", Body::from(body))
        }
        (&Method::GET | &Method::HEAD, path) => serve_file(&state, path).await,
        _ => respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain; charset=utf-8",
            Body::from(Bytes::from_static(b"Method Not Allowed")),
        ),
    };
    if method == Method::HEAD {
        let (parts, _) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::empty()));
    }
    Ok(response)
}

fn event_stream(state: &ServerState) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    let mut events = state.hub.subscribe();
    let mut closing = state.closing.clone();
    tokio::spawn(async move {
        if sender
            .send_data(Bytes::from_static(b"retry: 1000\n\n"))
            .await
            .is_err()
        {
            return;
        }
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = closing.changed() => break,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let data = serde_json::to_string(&event.paths).unwrap_or_else(|_| "[]".to_string());
            let frame = format!("event: {}\ndata: {}\n\n", event.kind, data);
            if sender.send_data(Bytes::from(frame)).await.is_err() {
                break;
            }
        }
    });
    let mut response = respond(StatusCode::OK, "text/event-stream", body);
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn serve_file(state: &ServerState, request_path: &str) -> Response<Body> {
    let Some(mut path) = resolve_request_path(&state.output_dir, request_path) else {
        return not_found();
    };
    if path.is_dir() {
        path.push("index.html");
    }
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(_) => return not_found(),
    };
    let content_type = content_type_for(&path);
    let body = if state.live_reload && content_type.starts_with("text/html") {
        inject_live_reload(&String::from_utf8_lossy(&data)).into_bytes()
    } else {
        data
    };
    let mut response = respond(StatusCode::OK, content_type, Body::from(body));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Maps a URL path onto the output directory. Returns `None` for paths that
/// would leave it.
fn resolve_request_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let mut resolved = root.to_path_buf();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

fn inject_live_reload(html: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(index) => {
            let mut injected = String::with_capacity(html.len() + LIVE_RELOAD_CLIENT.len());
            injected.push_str(&html[..index]);
            injected.push_str(LIVE_RELOAD_CLIENT);
            injected.push_str(&html[index..]);
            injected
        }
        None => format!("{html}{LIVE_RELOAD_CLIENT}"),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn not_found() -> Response<Body> {
    respond(
        StatusCode::NOT_FOUND,
        "text/plain; charset=utf-8",
        Body::from(Bytes::from_static(b"Not Found")),
    )
}
