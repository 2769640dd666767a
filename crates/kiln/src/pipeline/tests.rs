use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use kiln_protocol::TaskResult;
use serde_json::json;

use super::*;
use crate::error::SandboxResult;
use crate::executor::BootstrapHandle;
use crate::sandbox::ContainerInfo;

/// Replays scripted events per task kind and records what it was asked.
#[derive(Default)]
struct FakeBackend {
    spec_events: Mutex<Vec<StreamEvent>>,
    build_events: Mutex<Vec<StreamEvent>>,
    requests: Mutex<Vec<TaskRequest>>,
    cleanups: Mutex<Vec<String>>,
    streams: AtomicUsize,
}

impl FakeBackend {
    fn with_spec(self, events: Vec<StreamEvent>) -> Self {
        *self.spec_events.lock().unwrap() = events;
        self
    }

    fn with_build(self, events: Vec<StreamEvent>) -> Self {
        *self.build_events.lock().unwrap() = events;
        self
    }

    fn cleanups(&self) -> Vec<String> {
        self.cleanups.lock().unwrap().clone()
    }

    fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }
}

fn connected() -> StreamEvent {
    StreamEvent::connected(json!({"container": "kiln-sbx-x", "api_port": 8100, "code_port": 9100}))
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn execute_stream(
        &self,
        _session_id: &str,
        _workspace: &Path,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> EventStream {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let scripted = match request.kind {
            TaskKind::Build => self.build_events.lock().unwrap().clone(),
            _ => self.spec_events.lock().unwrap().clone(),
        };
        self.requests.lock().unwrap().push(request);

        Box::pin(stream! {
            if cancel.is_cancelled() {
                yield StreamEvent::interrupted();
                return;
            }
            yield connected();
            for event in scripted {
                yield event;
            }
        })
    }

    async fn execute(&self, _session_id: &str, _workspace: &Path, _request: TaskRequest) -> TaskResult {
        TaskResult::failed("not scripted")
    }

    async fn cancel(&self, _session_id: &str) -> bool {
        false
    }

    async fn cleanup(&self, session_id: &str) -> SandboxResult<bool> {
        self.cleanups.lock().unwrap().push(session_id.to_string());
        Ok(true)
    }

    async fn create_workspace(
        &self,
        _session_id: &str,
        _workspace: &Path,
    ) -> SandboxResult<(ContainerInfo, Option<BootstrapHandle>)> {
        unimplemented!("pipeline never creates workspaces directly")
    }

    async fn container_info(&self, _session_id: &str) -> SandboxResult<Option<ContainerInfo>> {
        Ok(None)
    }
}

struct FakeCommitter {
    fail: bool,
}

#[async_trait]
impl GitCommitter for FakeCommitter {
    async fn commit_all(&self, _workspace: &Path, _message: &str) -> anyhow::Result<String> {
        if self.fail {
            anyhow::bail!("nothing to commit");
        }
        Ok("0123456789abcdef0123456789abcdef01234567".to_string())
    }
}

struct Harness {
    pipeline: Pipeline,
    backend: Arc<FakeBackend>,
    _root: tempfile::TempDir,
}

async fn harness(backend: FakeBackend, ceiling: Option<u32>, commit_fails: bool) -> Harness {
    let db = Database::in_memory().await.unwrap();
    let backend = Arc::new(backend);
    let root = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(
        backend.clone(),
        &db,
        Arc::new(FakeCommitter { fail: commit_fails }),
        PipelineSettings {
            ceiling,
            workspace_root: root.path().to_path_buf(),
            preview_host: "localhost".to_string(),
        },
    );
    Harness {
        pipeline,
        backend,
        _root: root,
    }
}

fn spec_ok() -> Vec<StreamEvent> {
    vec![
        StreamEvent::new("text", "thinking"),
        StreamEvent::new("result", "# Todo spec"),
    ]
}

fn statuses(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.is(kinds::STATUS))
        .filter_map(|e| e.metadata.as_ref()?.get("status")?.as_str().map(String::from))
        .collect()
}

fn version_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .find(|e| e.is(kinds::STATUS))
        .and_then(|e| e.metadata.as_ref()?.get("version_id")?.as_str().map(String::from))
        .unwrap()
}

async fn run_spec(h: &Harness, module_id: &str) -> Vec<StreamEvent> {
    h.pipeline
        .generate_spec(module_id, "a todo app", CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
}

#[tokio::test]
async fn full_version_lifecycle() {
    let h = harness(
        FakeBackend::default()
            .with_spec(spec_ok())
            .with_build(vec![StreamEvent::new("text", "writing files")]),
        Some(4),
        false,
    )
    .await;
    let module = h.pipeline.modules().create("todo").await.unwrap();

    let events = run_spec(&h, &module.id).await;
    assert_eq!(statuses(&events), vec!["SPEC_GENERATING", "SPEC_GENERATED"]);
    let version_id = version_of(&events);

    let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::SpecGenerated);
    assert_eq!(version.spec_content.as_deref(), Some("# Todo spec"));
    assert_eq!(version.code, "v1");

    let stored = h.pipeline.modules().get(&module.id).await.unwrap().unwrap();
    assert_eq!(stored.container_id.as_deref(), Some("kiln-sbx-x"));
    assert_eq!(stored.preview_url.as_deref(), Some("http://localhost:9100"));
    assert!(h.backend.cleanups().is_empty());

    let events: Vec<StreamEvent> = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(statuses(&events), vec!["CODE_BUILDING", "BUILD_COMPLETED"]);

    let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::BuildCompleted);
    assert_eq!(
        version.commit.as_deref(),
        Some("0123456789abcdef0123456789abcdef01234567")
    );

    // container torn down as soon as the build completes
    assert_eq!(h.backend.cleanups(), vec![module.id.clone()]);
    let stored = h.pipeline.modules().get(&module.id).await.unwrap().unwrap();
    assert_eq!(stored.container_id, None);

    let requests = h.backend.requests.lock().unwrap().clone();
    assert_eq!(requests[1].kind, TaskKind::Build);
    assert_eq!(requests[1].spec.as_deref(), Some("# Todo spec"));
}

#[tokio::test]
async fn ceiling_rejects_before_anything_is_created() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), Some(1), false).await;
    let busy = h.pipeline.modules().create("busy").await.unwrap();
    h.pipeline.versions().create(&busy.id).await.unwrap();
    let other = h.pipeline.modules().create("other").await.unwrap();

    let err = h
        .pipeline
        .generate_spec(&other.id, "x", CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::AdmissionRejected { active: 1, limit: 1 }
    ));
    assert!(h.pipeline.versions().list_for_module(&other.id).await.unwrap().is_empty());
    assert_eq!(h.backend.streams(), 0);
}

#[tokio::test]
async fn count_below_ceiling_admits() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), Some(2), false).await;
    let busy = h.pipeline.modules().create("busy").await.unwrap();
    h.pipeline.versions().create(&busy.id).await.unwrap();
    let other = h.pipeline.modules().create("other").await.unwrap();

    let events = run_spec(&h, &other.id).await;
    assert_eq!(statuses(&events), vec!["SPEC_GENERATING", "SPEC_GENERATED"]);
}

#[tokio::test]
async fn generating_version_is_reused_without_admission() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), Some(1), false).await;
    let module = h.pipeline.modules().create("todo").await.unwrap();
    let existing = h.pipeline.versions().create(&module.id).await.unwrap();

    let events = run_spec(&h, &module.id).await;
    assert_eq!(version_of(&events), existing.id);
    assert_eq!(h.pipeline.versions().list_for_module(&module.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn spec_is_refused_while_the_module_builds() {
    let h = harness(
        FakeBackend::default()
            .with_spec(spec_ok())
            .with_build(vec![StreamEvent::new("text", "writing files")]),
        None,
        false,
    )
    .await;
    let (module, version_id) = spec_generated(&h).await;

    let mut build = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap();
    let first = build.next().await.unwrap();
    assert_eq!(statuses(&[first]), vec!["CODE_BUILDING"]);

    let err = h
        .pipeline
        .generate_spec(&module.id, "again", CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::ModuleBusy { ref version, .. } if version == "v1"));

    let versions = h.pipeline.versions().list_for_module(&module.id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, VersionStatus::CodeBuilding);
    assert!(h.backend.cleanups().is_empty());

    let rest: Vec<StreamEvent> = build.collect().await;
    assert_eq!(statuses(&rest), vec!["BUILD_COMPLETED"]);
}

#[tokio::test]
async fn spec_content_falls_back_to_text() {
    let h = harness(
        FakeBackend::default().with_spec(vec![
            StreamEvent::new("text", "# Part one\n"),
            StreamEvent::new("tool_use", "ls"),
            StreamEvent::new("text", "## Part two"),
        ]),
        None,
        false,
    )
    .await;
    let module = h.pipeline.modules().create("todo").await.unwrap();

    let events = run_spec(&h, &module.id).await;
    let version = h.pipeline.versions().get(&version_of(&events)).await.unwrap().unwrap();
    assert_eq!(version.spec_content.as_deref(), Some("# Part one\n## Part two"));
}

#[tokio::test]
async fn failed_spec_on_new_version_deletes_it() {
    let h = harness(
        FakeBackend::default().with_spec(vec![StreamEvent::error("model overloaded")]),
        None,
        false,
    )
    .await;
    let module = h.pipeline.modules().create("todo").await.unwrap();

    let events = run_spec(&h, &module.id).await;
    assert!(events.last().unwrap().is_error());
    assert!(h.pipeline.versions().list_for_module(&module.id).await.unwrap().is_empty());
    assert_eq!(h.backend.cleanups(), vec![module.id.clone()]);
}

#[tokio::test]
async fn failed_spec_on_reused_version_keeps_it() {
    let h = harness(
        FakeBackend::default().with_spec(vec![StreamEvent::error("model overloaded")]),
        None,
        false,
    )
    .await;
    let module = h.pipeline.modules().create("todo").await.unwrap();
    let existing = h.pipeline.versions().create(&module.id).await.unwrap();

    run_spec(&h, &module.id).await;
    let version = h.pipeline.versions().get(&existing.id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::SpecGenerating);
    assert_eq!(version.message.as_deref(), Some("model overloaded"));
}

#[tokio::test]
async fn empty_spec_is_a_failure() {
    let h = harness(FakeBackend::default(), None, false).await;
    let module = h.pipeline.modules().create("todo").await.unwrap();

    let events = run_spec(&h, &module.id).await;
    let last = events.last().unwrap();
    assert!(last.is_error());
    assert!(last.content_text().unwrap().contains("without producing a spec"));
    assert!(h.pipeline.versions().list_for_module(&module.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_spec_keeps_version_and_container() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), None, false).await;
    let module = h.pipeline.modules().create("todo").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events: Vec<StreamEvent> = h
        .pipeline
        .generate_spec(&module.id, "x", cancel)
        .await
        .unwrap()
        .collect()
        .await;
    assert!(events.last().unwrap().is_interrupted());

    let versions = h.pipeline.versions().list_for_module(&module.id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, VersionStatus::SpecGenerating);
    assert!(h.backend.cleanups().is_empty());
}

async fn spec_generated(h: &Harness) -> (Module, String) {
    let module = h.pipeline.modules().create("todo").await.unwrap();
    let events = run_spec(h, &module.id).await;
    (module, version_of(&events))
}

#[tokio::test]
async fn failed_build_rolls_back_to_spec_generated() {
    let h = harness(
        FakeBackend::default()
            .with_spec(spec_ok())
            .with_build(vec![StreamEvent::error("compile error")]),
        None,
        false,
    )
    .await;
    let (module, version_id) = spec_generated(&h).await;

    let events: Vec<StreamEvent> = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert!(events.last().unwrap().is_error());

    let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::SpecGenerated);
    assert_eq!(version.message.as_deref(), Some("compile error"));
    assert_eq!(version.commit, None);
    assert_eq!(h.backend.cleanups(), vec![module.id]);
}

#[tokio::test]
async fn commit_failure_rolls_back() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), None, true).await;
    let (_module, version_id) = spec_generated(&h).await;

    let events: Vec<StreamEvent> = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let last = events.last().unwrap();
    assert!(last.content_text().unwrap().starts_with("commit failed"));

    let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::SpecGenerated);
}

#[tokio::test]
async fn build_requires_spec_generated() {
    let h = harness(FakeBackend::default(), None, false).await;
    let module = h.pipeline.modules().create("todo").await.unwrap();
    let version = h.pipeline.versions().create(&module.id).await.unwrap();

    let err = h
        .pipeline
        .build_code(&version.id, CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::InvalidState {
            actual: VersionStatus::SpecGenerating,
            ..
        }
    ));
    assert!(matches!(
        h.pipeline.build_code("missing", CancellationToken::new()).await.err().unwrap(),
        PipelineError::VersionNotFound(_)
    ));
}

#[tokio::test]
async fn build_does_not_count_its_own_slot() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), Some(1), false).await;
    let (_module, version_id) = spec_generated(&h).await;

    let events: Vec<StreamEvent> = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(statuses(&events), vec!["CODE_BUILDING", "BUILD_COMPLETED"]);
}

#[tokio::test]
async fn delete_module_marks_versions_and_removes_container() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), None, false).await;
    let (module, version_id) = spec_generated(&h).await;
    h.pipeline.versions().create(&module.id).await.unwrap();

    assert_eq!(h.pipeline.delete_module(&module.id).await.unwrap(), 2);
    let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::Deleted);
    assert_eq!(h.backend.cleanups(), vec![module.id.clone()]);
    assert!(h.pipeline.modules().get(&module.id).await.unwrap().unwrap().deleted);

    assert!(matches!(
        h.pipeline
            .generate_spec(&module.id, "x", CancellationToken::new())
            .await
            .err()
            .unwrap(),
        PipelineError::ModuleNotFound(_)
    ));
}

async fn wait_for_status(h: &Harness, version_id: &str, want: VersionStatus) -> Version {
    for _ in 0..100 {
        let version = h.pipeline.versions().get(version_id).await.unwrap().unwrap();
        if version.status == want {
            return version;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("version {version_id} never reached {want}");
}

#[tokio::test]
async fn dropped_build_stream_rolls_back_and_frees_its_slot() {
    let h = harness(
        FakeBackend::default()
            .with_spec(spec_ok())
            .with_build(vec![StreamEvent::new("text", "writing files")]),
        Some(1),
        false,
    )
    .await;
    let (_module, version_id) = spec_generated(&h).await;

    let mut build = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap();
    build.next().await.unwrap();
    drop(build);

    let version = wait_for_status(&h, &version_id, VersionStatus::SpecGenerated).await;
    assert_eq!(version.message.as_deref(), Some("build interrupted"));

    let events: Vec<StreamEvent> = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(statuses(&events), vec!["CODE_BUILDING", "BUILD_COMPLETED"]);
}

#[tokio::test]
async fn unpolled_build_stream_rolls_back() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), None, false).await;
    let (_module, version_id) = spec_generated(&h).await;

    let build = h
        .pipeline
        .build_code(&version_id, CancellationToken::new())
        .await
        .unwrap();
    drop(build);

    wait_for_status(&h, &version_id, VersionStatus::SpecGenerated).await;
    assert_eq!(h.backend.streams(), 1);
}

#[tokio::test]
async fn dropped_spec_stream_notes_the_interruption() {
    let h = harness(FakeBackend::default().with_spec(spec_ok()), None, false).await;
    let module = h.pipeline.modules().create("todo").await.unwrap();

    let mut spec = h
        .pipeline
        .generate_spec(&module.id, "x", CancellationToken::new())
        .await
        .unwrap();
    let version_id = version_of(&[spec.next().await.unwrap()]);
    drop(spec);

    for _ in 0..100 {
        let version = h.pipeline.versions().get(&version_id).await.unwrap().unwrap();
        if version.message.is_some() {
            assert_eq!(version.status, VersionStatus::SpecGenerating);
            assert_eq!(version.message.as_deref(), Some("spec generation interrupted"));
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("interruption never recorded");
}
