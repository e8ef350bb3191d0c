//! End-to-end tests for the download manager against a mock HTTP origin
//!
//! External tools are replaced by in-process fakes: the remuxer concatenates the
//! fragments a manifest still references, and the prober derives fingerprints from
//! fragment content. Everything else (scheduling, retry, fetch, ad filtering,
//! publishing) runs for real.
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test manager_integration
//! ```

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use media_dl::adblock::{Fingerprint, FingerprintTuple};
use media_dl::{
    AdBlacklist, Config, DirectResolver, DownloadManager, DownloadTask, EngineContext, ErrorLog,
    Event, FragmentProber, JsonBlacklist, Remuxer, Result, Severity, TaskCallbacks, TaskId,
    TaskRequest,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Remuxer that concatenates every fragment the manifest still references
struct ConcatRemuxer;

#[async_trait]
impl Remuxer for ConcatRemuxer {
    async fn remux(
        &self,
        manifest: &Path,
        output: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let text = tokio::fs::read_to_string(manifest).await?;
        let mut out = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
            out.extend(tokio::fs::read(line).await?);
        }
        tokio::fs::write(output, out).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concat"
    }
}

/// Prober reporting a narrow frame for fragments whose content starts with `AD`
struct ContentProber;

#[async_trait]
impl FragmentProber for ContentProber {
    async fn probe(&self, path: &Path) -> Result<Fingerprint> {
        let bytes = tokio::fs::read(path).await?;
        let width = if bytes.starts_with(b"AD") { 640 } else { 1920 };
        Ok(Fingerprint {
            hash: format!("{:x}", md5::compute(&bytes)),
            tuple: Some(FingerprintTuple {
                time_base: 90000,
                duration: 3003,
                width,
                height: 1080,
            }),
        })
    }
}

#[derive(Default)]
struct Recorder {
    finished: Mutex<Vec<TaskId>>,
    errors: Mutex<Vec<(TaskId, String)>>,
}

impl TaskCallbacks for Recorder {
    fn on_finished(&self, task: &DownloadTask) -> Result<()> {
        self.finished.lock().unwrap().push(task.id);
        Ok(())
    }

    fn on_error(&self, task: &DownloadTask, detail: &str) -> Result<()> {
        self.errors
            .lock()
            .unwrap()
            .push((task.id, detail.to_string()));
        Ok(())
    }
}

fn test_config(temp: &TempDir, concurrent: usize) -> Config {
    let mut config = Config::default();
    config.tools.search_path = false;
    config.download.concurrent = concurrent;
    config.download.tmp_dir = temp.path().join("scratch");
    config.download.retry_interval = Duration::from_millis(10);
    config.download.timeout = Duration::from_secs(20);
    config
}

fn create_manager(temp: &TempDir, concurrent: usize) -> (DownloadManager, Arc<ErrorLog>) {
    let log = Arc::new(ErrorLog::new(100));
    let ctx = EngineContext::new(test_config(temp, concurrent), Arc::new(DirectResolver))
        .unwrap()
        .with_remuxer(Arc::new(ConcatRemuxer))
        .with_error_sink(log.clone());
    (DownloadManager::with_context(ctx), log)
}

async fn serve(server: &MockServer, route: &str, body: impl Into<Vec<u8>>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.into()))
        .mount(server)
        .await;
}

/// Drain every event already buffered on `rx`
fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn single_file_task_is_published_and_reported() {
    let server = MockServer::start().await;
    let payload = vec![7u8; 64 * 1024];
    serve(&server, "/movies/a.mp4", payload.clone()).await;

    let temp = TempDir::new().unwrap();
    let (manager, log) = create_manager(&temp, 2);
    let recorder = Arc::new(Recorder::default());
    let mut events = manager.subscribe();
    let dst = temp.path().join("library/a.mp4");

    let id = manager
        .submit(
            TaskRequest::new("direct", format!("{}/movies/a.mp4", server.uri()), &dst)
                .with_callbacks(recorder.clone()),
        )
        .unwrap();
    manager.join().await;

    assert_eq!(std::fs::read(&dst).unwrap(), payload);
    assert!(!temp.path().join("library/a.mp4.tmp").exists());
    assert_eq!(*recorder.finished.lock().unwrap(), vec![id]);
    assert!(recorder.errors.lock().unwrap().is_empty());
    assert!(log.is_empty());

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&Event::Queued { id }));
    assert_eq!(events.last(), Some(&Event::Finished { id }));
}

#[tokio::test]
async fn manifest_task_drops_blacklisted_and_deviant_fragments() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/show/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nlow.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\nhigh.m3u8\n",
    )
    .await;
    let mut media = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..6 {
        media.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
    }
    media.push_str("#EXT-X-ENDLIST\n");
    serve(&server, "/show/high.m3u8", media).await;
    for (i, body) in ["p0", "p1", "AD-new", "p3", "known-ad", "p5"]
        .iter()
        .enumerate()
    {
        serve(&server, &format!("/show/seg{i}.ts"), body.as_bytes().to_vec()).await;
    }

    let temp = TempDir::new().unwrap();
    let blacklist_path = temp.path().join("blacklist.json");
    let known = format!("{:x}", md5::compute(b"known-ad"));
    std::fs::write(&blacklist_path, serde_json::to_vec(&vec![&known]).unwrap()).unwrap();
    let blacklist = Arc::new(JsonBlacklist::load(&blacklist_path).await.unwrap());

    let ctx = EngineContext::new(test_config(&temp, 1), Arc::new(DirectResolver))
        .unwrap()
        .with_remuxer(Arc::new(ConcatRemuxer))
        .with_prober(Arc::new(ContentProber))
        .with_blacklist(blacklist.clone());
    let manager = DownloadManager::with_context(ctx);
    let dst = temp.path().join("show.mp4");

    manager
        .submit(TaskRequest::new(
            "direct",
            format!("{}/show/master.m3u8", server.uri()),
            &dst,
        ))
        .unwrap();
    manager.join().await;

    assert_eq!(std::fs::read(&dst).unwrap(), b"p0p1p3p5");

    // join flushed the newly detected ad to disk
    assert!(!blacklist.is_dirty());
    let reloaded = JsonBlacklist::load(&blacklist_path).await.unwrap();
    assert!(reloaded.contains(&known));
    assert!(reloaded.contains(&format!("{:x}", md5::compute(b"AD-new"))));
    assert_eq!(reloaded.len(), 2);
}

#[tokio::test]
async fn permanent_failure_uses_whole_budget_then_calls_on_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let (manager, log) = create_manager(&temp, 1);
    let recorder = Arc::new(Recorder::default());
    let mut events = manager.subscribe();
    let dst = temp.path().join("gone.mp4");

    let mut request = TaskRequest::new("direct", format!("{}/gone.mp4", server.uri()), &dst)
        .with_callbacks(recorder.clone());
    request.retry = Some(3);
    let id = manager.submit(request).unwrap();
    manager.join().await;

    assert!(recorder.finished.lock().unwrap().is_empty());
    let errors = recorder.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, id);
    assert!(!dst.exists());

    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, Severity::Critical);

    let retries: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            Event::Retrying { retry_left, .. } => Some(retry_left),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![2, 1]);
}

#[tokio::test]
async fn running_tasks_never_exceed_the_concurrency_cap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow".to_vec())
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let (manager, _log) = create_manager(&temp, 2);
    for i in 0..5 {
        manager
            .submit(TaskRequest::new(
                "direct",
                format!("{}/{i}.mp4", server.uri()),
                temp.path().join(format!("{i}.mp4")),
            ))
            .unwrap();
    }

    let watcher = manager.clone();
    let observer = tokio::spawn(async move {
        let mut max_running = 0;
        for _ in 0..40 {
            let status = watcher.get_status();
            max_running = max_running.max(status.running.len());
            if status.running.is_empty() && status.pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        max_running
    });
    manager.join().await;

    let max_running = observer.await.unwrap();
    assert!(max_running >= 1);
    assert!(max_running <= 2, "saw {max_running} running tasks");
    for i in 0..5 {
        assert_eq!(
            std::fs::read(temp.path().join(format!("{i}.mp4"))).unwrap(),
            b"slow"
        );
    }
}

#[tokio::test]
async fn stop_cancels_running_and_drops_pending_tasks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/first.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"never".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    for name in ["/second.mp4", "/third.mp4"] {
        Mock::given(method("GET"))
            .and(path(name))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
    }

    let temp = TempDir::new().unwrap();
    let (manager, log) = create_manager(&temp, 1);
    let recorder = Arc::new(Recorder::default());
    let mut events = manager.subscribe();
    for name in ["first", "second", "third"] {
        manager
            .submit(
                TaskRequest::new(
                    "direct",
                    format!("{}/{name}.mp4", server.uri()),
                    temp.path().join(format!("{name}.mp4")),
                )
                .with_callbacks(recorder.clone()),
            )
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.get_status().running.len(), 1);

    let start = Instant::now();
    manager.stop().await;
    manager.join().await;
    assert!(start.elapsed() < Duration::from_secs(5));

    for name in ["first", "second", "third"] {
        assert!(!temp.path().join(format!("{name}.mp4")).exists());
    }
    assert!(recorder.finished.lock().unwrap().is_empty());
    assert!(recorder.errors.lock().unwrap().is_empty());
    assert!(log.is_empty());
    assert!(drain(&mut events).contains(&Event::Stopped));

    let status = manager.get_status();
    assert!(status.pending.is_empty());
    assert!(status.running.is_empty());
}
