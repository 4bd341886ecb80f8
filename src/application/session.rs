//! Session actor: the single owner of all per-connection state.
//!
//! Many transport tasks feed one FIFO event queue; exactly one actor task
//! consumes it and is the sole mutator of the client registry, so no state is
//! ever touched by two flows of control. The queue is shared across all
//! producers, which makes the transport's ordering (open before any message,
//! close after the last one) hold structurally. Render work runs on blocking
//! tasks and reports back through an internal completion queue, so a slow
//! conversion never stalls registrations or other clients' messages.

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    application::render::{HtmlRenderer, RenderError},
    domain::messages::{Envelope, KIND_RENDER, STORAGE_URL_PREFIX},
    infra::storage::StorageArea,
};

const TARGET: &str = "cartiera::session";

/// Opaque handle for one live transport connection. Allocated by the
/// transport layer; the actor only uses it as a map key and send target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection reply channel, drained by the connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Envelope>;

#[derive(Debug)]
pub enum SessionEvent {
    Opened { conn: ConnId, outbox: Outbox },
    Closed { conn: ConnId },
    Inbound { conn: ConnId, payload: String },
}

struct RenderOutcome {
    conn: ConnId,
    result: Result<String, RenderError>,
}

struct ClientRecord {
    id: Uuid,
    is_closing: bool,
    files: Vec<String>,
    outbox: Outbox,
}

/// All per-connection state. Owned exclusively by the actor task; nothing
/// here is synchronised because nothing else may touch it.
struct Registry {
    clients: HashMap<ConnId, ClientRecord>,
    storage: Arc<StorageArea>,
}

impl Registry {
    fn new(storage: Arc<StorageArea>) -> Self {
        Self {
            clients: HashMap::new(),
            storage,
        }
    }

    fn register(&mut self, conn: ConnId, outbox: Outbox) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.insert(
            conn,
            ClientRecord {
                id,
                is_closing: false,
                files: Vec::new(),
                outbox,
            },
        );
        id
    }

    /// Idempotent: unregistering an unknown handle is a no-op, since close
    /// events can race shutdown. Cleanup is best-effort; one failed deletion
    /// never blocks the others.
    async fn unregister(&mut self, conn: ConnId) {
        let Some(record) = self.clients.get_mut(&conn) else {
            debug!(target: TARGET, %conn, "unregister for unknown connection");
            return;
        };
        record.is_closing = true;
        let client_id = record.id;
        let files = std::mem::take(&mut record.files);

        for file in &files {
            if let Err(err) = self.storage.delete(file).await {
                warn!(
                    target: TARGET,
                    %conn,
                    client_id = %client_id,
                    file = %file,
                    error = %err,
                    "failed to delete output file"
                );
            }
        }

        self.clients.remove(&conn);
        info!(
            target: TARGET,
            %conn,
            client_id = %client_id,
            outputs = files.len(),
            "client unregistered"
        );
    }

    fn record_output(&mut self, conn: ConnId, file: String) {
        if let Some(record) = self.clients.get_mut(&conn) {
            record.files.push(file);
        } else {
            // Client closed mid-render; the file is already orphaned.
            debug!(target: TARGET, %conn, file = %file, "output for departed client not recorded");
        }
    }

    /// Deliver a reply, or drop it quietly when the client is closing or
    /// already gone. Never blocks, never raises.
    fn send(&self, conn: ConnId, reply: Envelope) {
        let Some(record) = self.clients.get(&conn) else {
            debug!(target: TARGET, %conn, "reply dropped, client is gone");
            return;
        };
        if record.is_closing {
            debug!(target: TARGET, %conn, client_id = %record.id, "reply dropped, client is closing");
            return;
        }
        if record.outbox.send(reply).is_err() {
            debug!(target: TARGET, %conn, client_id = %record.id, "reply dropped, outbox closed");
        }
    }

    fn len(&self) -> usize {
        self.clients.len()
    }
}

/// Cloneable producer side of the session queue, handed to transport tasks.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn client_opened(&self, conn: ConnId, outbox: Outbox) {
        self.push(SessionEvent::Opened { conn, outbox });
    }

    pub fn client_closed(&self, conn: ConnId) {
        self.push(SessionEvent::Closed { conn });
    }

    pub fn inbound(&self, conn: ConnId, payload: String) {
        self.push(SessionEvent::Inbound { conn, payload });
    }

    fn push(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(target: TARGET, "session actor stopped, event dropped");
        }
    }
}

/// Spawn the session actor task. Returns the handle transport tasks use to
/// feed it and the join handle the process awaits during shutdown.
pub fn spawn(
    renderer: Arc<dyn HtmlRenderer>,
    storage: Arc<StorageArea>,
    viewer_path: String,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        registry: Registry::new(storage),
        renderer,
        viewer_path,
        events: events_rx,
        completions: completions_rx,
        completions_tx,
        renders: JoinSet::new(),
        cancel,
    };

    let handle = tokio::spawn(actor.run());
    (SessionHandle { events: events_tx }, handle)
}

struct SessionActor {
    registry: Registry,
    renderer: Arc<dyn HtmlRenderer>,
    viewer_path: String,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    completions: mpsc::UnboundedReceiver<RenderOutcome>,
    completions_tx: mpsc::UnboundedSender<RenderOutcome>,
    renders: JoinSet<()>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self) {
        info!(target: TARGET, "session actor running");
        while self.step().await {}
        self.drain().await;
    }

    /// One scheduling turn in the running state. Returns false on cancellation.
    async fn step(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            Some(event) = self.events.recv() => self.handle_event(event).await,
            Some(outcome) = self.completions.recv() => self.finish_render(outcome),
            // Reap finished render tasks as they complete, otherwise the set
            // keeps one entry per render for the life of the process.
            Some(joined) = self.renders.join_next(), if !self.renders.is_empty() => {
                if let Err(err) = joined {
                    warn!(target: TARGET, error = %err, "render task failed to join");
                }
            }
        }
        true
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened { conn, outbox } => {
                let id = self.registry.register(conn, outbox);
                info!(target: TARGET, %conn, client_id = %id, "client registered");
            }
            SessionEvent::Closed { conn } => self.registry.unregister(conn).await,
            SessionEvent::Inbound { conn, payload } => self.dispatch(conn, payload),
        }
    }

    fn dispatch(&mut self, conn: ConnId, payload: String) {
        let envelope: Envelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: TARGET, %conn, error = %err, "malformed inbound payload");
                self.registry
                    .send(conn, Envelope::error(format!("error during parse json: {err}")));
                return;
            }
        };

        match envelope.kind.as_str() {
            KIND_RENDER => self.spawn_render(conn, envelope.message),
            // Unrecognised types echo their content back as an error.
            _ => self.registry.send(conn, Envelope::error(envelope.message)),
        }
    }

    /// Render off the actor task; the outcome comes back as an internal
    /// completion event so registry bookkeeping stays serialized here.
    fn spawn_render(&mut self, conn: ConnId, html: String) {
        let renderer = Arc::clone(&self.renderer);
        let completions = self.completions_tx.clone();

        self.renders.spawn(async move {
            let result = match tokio::task::spawn_blocking(move || renderer.render(&html)).await {
                Ok(result) => result,
                Err(err) => Err(RenderError::Aborted(err.to_string())),
            };
            let _ = completions.send(RenderOutcome { conn, result });
        });
    }

    fn finish_render(&mut self, outcome: RenderOutcome) {
        match outcome.result {
            Ok(file) => {
                let url = format!(
                    "{}?file={}/{}",
                    self.viewer_path, STORAGE_URL_PREFIX, file
                );
                self.registry.record_output(outcome.conn, file);
                self.registry.send(outcome.conn, Envelope::rendered(url));
            }
            Err(err) => {
                warn!(target: TARGET, conn = %outcome.conn, error = %err, "render failed");
                self.registry.send(
                    outcome.conn,
                    Envelope::error(format!("error during render: {err}")),
                );
            }
        }
    }

    /// Draining: the external queue is no longer polled; in-flight renders
    /// finish and their bookkeeping is applied, then the actor stops. Whatever
    /// remains registered is abandoned.
    async fn drain(mut self) {
        self.events.close();

        let in_flight = self.renders.len();
        if in_flight > 0 {
            info!(target: TARGET, in_flight, "draining in-flight renders");
        }
        while let Some(joined) = self.renders.join_next().await {
            if let Err(err) = joined {
                warn!(target: TARGET, error = %err, "render task failed to join");
            }
        }
        while let Ok(outcome) = self.completions.try_recv() {
            self.finish_render(outcome);
        }

        info!(
            target: TARGET,
            abandoned_clients = self.registry.len(),
            "session actor stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::Path, time::Duration};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    struct FileRenderer {
        output_dir: std::path::PathBuf,
        delay: Option<Duration>,
    }

    impl HtmlRenderer for FileRenderer {
        fn render(&self, _html: &str) -> Result<String, RenderError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let name = format!("rendered-{}.pdf", Uuid::new_v4());
            std::fs::write(self.output_dir.join(&name), b"%PDF-1.4 fake")
                .map_err(RenderError::Staging)?;
            Ok(name)
        }
    }

    struct FailingRenderer;

    impl HtmlRenderer for FailingRenderer {
        fn render(&self, _html: &str) -> Result<String, RenderError> {
            Err(RenderError::Conversion {
                exit_code: Some(1),
                detail: "ContentNotFoundError".to_string(),
            })
        }
    }

    struct Harness {
        handle: SessionHandle,
        cancel: CancellationToken,
        actor: JoinHandle<()>,
        _dir: TempDir,
        storage_root: std::path::PathBuf,
    }

    fn start(renderer: Arc<dyn HtmlRenderer>) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let storage_root = dir.path().to_path_buf();
        let storage =
            Arc::new(StorageArea::new(storage_root.clone()).expect("storage area"));
        let cancel = CancellationToken::new();
        let (handle, actor) = spawn(
            renderer,
            storage,
            "pdfjs/web/viewer.html".to_string(),
            cancel.clone(),
        );
        Harness {
            handle,
            cancel,
            actor,
            _dir: dir,
            storage_root,
        }
    }

    fn start_with_files() -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let storage_root = dir.path().to_path_buf();
        let renderer = Arc::new(FileRenderer {
            output_dir: storage_root.clone(),
            delay: None,
        });
        let storage =
            Arc::new(StorageArea::new(storage_root.clone()).expect("storage area"));
        let cancel = CancellationToken::new();
        let (handle, actor) = spawn(
            renderer,
            storage,
            "pdfjs/web/viewer.html".to_string(),
            cancel.clone(),
        );
        Harness {
            handle,
            cancel,
            actor,
            _dir: dir,
            storage_root,
        }
    }

    fn open(harness: &Harness, conn: ConnId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        harness.handle.client_opened(conn, tx);
        rx
    }

    async fn expect_reply(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("reply channel closed")
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "unexpected extra reply"
        );
    }

    async fn wait_until_gone(path: &Path) {
        timeout(Duration::from_secs(5), async {
            while path.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("file was not deleted");
    }

    fn pdf_count(root: &Path) -> usize {
        std::fs::read_dir(root)
            .expect("read dir")
            .filter(|entry| {
                entry
                    .as_ref()
                    .expect("entry")
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".pdf")
            })
            .count()
    }

    #[tokio::test]
    async fn render_round_trip_and_cleanup_on_disconnect() {
        let harness = start_with_files();
        let conn = ConnId::new(1);
        let mut rx = open(&harness, conn);

        harness.handle.inbound(
            conn,
            r#"{"type":"render","message":"<html>hi</html>"}"#.to_string(),
        );

        let reply = expect_reply(&mut rx).await;
        assert_eq!(reply.kind, "rendered");
        assert!(
            reply
                .message
                .starts_with("pdfjs/web/viewer.html?file=/storage/rendered-"),
            "unexpected url: {}",
            reply.message
        );
        assert!(reply.message.ends_with(".pdf"));

        let file = reply
            .message
            .rsplit('/')
            .next()
            .expect("file name in url")
            .to_string();
        let path = harness.storage_root.join(&file);
        assert!(path.exists(), "output file missing");

        harness.handle.client_closed(conn);
        wait_until_gone(&path).await;

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn render_failure_sends_exactly_one_error_reply() {
        let harness = start(Arc::new(FailingRenderer));
        let conn = ConnId::new(1);
        let mut rx = open(&harness, conn);

        harness.handle.inbound(
            conn,
            r#"{"type":"render","message":"<html>hi</html>"}"#.to_string(),
        );

        let reply = expect_reply(&mut rx).await;
        assert_eq!(reply.kind, "error");
        assert!(
            reply.message.contains("ContentNotFoundError"),
            "diagnostics missing: {}",
            reply.message
        );
        expect_silence(&mut rx).await;
        assert_eq!(pdf_count(&harness.storage_root), 0);

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn malformed_payload_gets_error_reply_and_actor_survives() {
        let harness = start_with_files();
        let conn = ConnId::new(1);
        let mut rx = open(&harness, conn);

        harness.handle.inbound(conn, "not json".to_string());
        let reply = expect_reply(&mut rx).await;
        assert_eq!(reply.kind, "error");
        assert!(reply.message.contains("parse json"));

        // The actor still serves the same connection afterwards.
        harness.handle.inbound(
            conn,
            r#"{"type":"render","message":"<html>ok</html>"}"#.to_string(),
        );
        let reply = expect_reply(&mut rx).await;
        assert_eq!(reply.kind, "rendered");

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn unknown_type_echoes_content_as_error() {
        let harness = start_with_files();
        let conn = ConnId::new(1);
        let mut rx = open(&harness, conn);

        harness
            .handle
            .inbound(conn, r#"{"type":"ping","message":"hello"}"#.to_string());

        let reply = expect_reply(&mut rx).await;
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.message, "hello");

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn duplicate_close_is_harmless() {
        let harness = start_with_files();
        let conn = ConnId::new(1);
        let _rx = open(&harness, conn);

        harness.handle.client_closed(conn);
        harness.handle.client_closed(conn);

        // A later client on the same actor still works.
        let conn2 = ConnId::new(2);
        let mut rx2 = open(&harness, conn2);
        harness.handle.inbound(
            conn2,
            r#"{"type":"render","message":"<html>ok</html>"}"#.to_string(),
        );
        let reply = expect_reply(&mut rx2).await;
        assert_eq!(reply.kind, "rendered");

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn disconnect_leaves_other_clients_files_alone() {
        let harness = start_with_files();
        let conn_a = ConnId::new(1);
        let conn_b = ConnId::new(2);
        let mut rx_a = open(&harness, conn_a);
        let mut rx_b = open(&harness, conn_b);

        let request = r#"{"type":"render","message":"<html>x</html>"}"#;
        harness.handle.inbound(conn_a, request.to_string());
        harness.handle.inbound(conn_b, request.to_string());

        let file_a = expect_reply(&mut rx_a).await.message;
        let file_b = expect_reply(&mut rx_b).await.message;
        let file_a = file_a.rsplit('/').next().expect("name").to_string();
        let file_b = file_b.rsplit('/').next().expect("name").to_string();

        harness.handle.client_closed(conn_a);
        wait_until_gone(&harness.storage_root.join(&file_a)).await;
        assert!(
            harness.storage_root.join(&file_b).exists(),
            "other client's file was deleted"
        );

        harness.cancel.cancel();
        harness.actor.await.expect("actor join");
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_renders() {
        let dir = TempDir::new().expect("temp dir");
        let storage_root = dir.path().to_path_buf();
        let renderer = Arc::new(FileRenderer {
            output_dir: storage_root.clone(),
            delay: Some(Duration::from_millis(200)),
        });
        let storage = Arc::new(StorageArea::new(storage_root.clone()).expect("storage area"));
        let cancel = CancellationToken::new();
        let (handle, actor) = spawn(
            renderer,
            storage,
            "pdfjs/web/viewer.html".to_string(),
            cancel.clone(),
        );

        let conn = ConnId::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.client_opened(conn, tx);
        handle.inbound(
            conn,
            r#"{"type":"render","message":"<html>slow</html>"}"#.to_string(),
        );

        // Let the actor pick up the message, then cancel mid-render.
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        timeout(Duration::from_secs(5), actor)
            .await
            .expect("actor did not drain")
            .expect("actor join");

        let reply = rx.try_recv().expect("drained render reply");
        assert_eq!(reply.kind, "rendered");
        assert_eq!(pdf_count(&storage_root), 1);
    }

    #[tokio::test]
    async fn completed_render_tasks_are_reaped_while_running() {
        let dir = TempDir::new().expect("temp dir");
        let storage_root = dir.path().to_path_buf();
        let renderer: Arc<dyn HtmlRenderer> = Arc::new(FileRenderer {
            output_dir: storage_root.clone(),
            delay: None,
        });
        let storage = Arc::new(StorageArea::new(storage_root).expect("storage area"));
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let mut actor = SessionActor {
            registry: Registry::new(storage),
            renderer,
            viewer_path: "pdfjs/web/viewer.html".to_string(),
            events: events_rx,
            completions: completions_rx,
            completions_tx,
            renders: JoinSet::new(),
            cancel: CancellationToken::new(),
        };

        let conn = ConnId::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.registry.register(conn, tx);

        for _ in 0..50 {
            actor.spawn_render(conn, "<html>x</html>".to_string());
        }

        // Drive the running-state loop until every task is joined and every
        // completion applied; the set must not retain finished entries.
        while !actor.renders.is_empty() || !actor.completions.is_empty() {
            timeout(Duration::from_secs(5), actor.step())
                .await
                .expect("actor made no progress");
        }
        assert!(actor.renders.is_empty(), "completed renders should be reaped");

        let mut replies = 0;
        while rx.try_recv().is_ok() {
            replies += 1;
        }
        assert_eq!(replies, 50);
    }

    #[tokio::test]
    async fn reply_to_closing_or_absent_client_is_dropped() {
        let dir = TempDir::new().expect("temp dir");
        let storage =
            Arc::new(StorageArea::new(dir.path().to_path_buf()).expect("storage area"));
        let mut registry = Registry::new(storage);

        let conn = ConnId::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(conn, tx);

        registry
            .clients
            .get_mut(&conn)
            .expect("registered record")
            .is_closing = true;
        registry.send(conn, Envelope::rendered("late"));
        assert!(rx.try_recv().is_err(), "closing client received a reply");

        registry.send(ConnId::new(99), Envelope::rendered("ghost"));
    }

    #[tokio::test]
    async fn registry_tracks_registrations_exactly() {
        let dir = TempDir::new().expect("temp dir");
        let storage =
            Arc::new(StorageArea::new(dir.path().to_path_buf()).expect("storage area"));
        let mut registry = Registry::new(storage);

        for n in 1..=3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(ConnId::new(n), tx);
        }
        assert_eq!(registry.len(), 3);

        registry.unregister(ConnId::new(1)).await;
        registry.unregister(ConnId::new(1)).await;
        registry.unregister(ConnId::new(2)).await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn record_output_for_unknown_handle_is_a_noop() {
        let dir = TempDir::new().expect("temp dir");
        let storage =
            Arc::new(StorageArea::new(dir.path().to_path_buf()).expect("storage area"));
        let mut registry = Registry::new(storage);

        registry.record_output(ConnId::new(7), "rendered-ghost.pdf".to_string());
        assert_eq!(registry.len(), 0);
    }
}
