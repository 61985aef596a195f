//! End-to-end sync cycles against an in-process control server

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use syncagent::pipeline::Pipeline;
use syncagent::status::outcome_label;
use syncagent::sync::candidate::candidate_path;
use syncagent::sync::error::{ErrorKind, SyncError};
use syncagent::sync::fingerprint::Fingerprint;
use syncagent::sync::install::BinaryInstaller;
use syncagent::sync::lock;
use syncagent::sync::restart::{RestartReason, Restarter};
use syncagent::sync::revision::Revision;
use syncagent::sync::{SyncOutcome, Synchronizer};
use tempfile::TempDir;

const BANNER: &str = "###############################################################################";

#[derive(Clone)]
enum Mode {
    NoChange,
    Config {
        content: String,
        revision: Option<String>,
    },
    Binary {
        body: Option<Vec<u8>>,
        revision: Option<String>,
    },
    Fail(u16),
}

struct ControlState {
    mode: Mode,
    polls: Vec<HashMap<String, String>>,
    bodies: Vec<Vec<u8>>,
}

/// Mock control server. In config mode it only offers the content while the
/// reported fingerprint differs from it, like the real server does.
#[derive(Clone)]
struct Control {
    state: Arc<Mutex<ControlState>>,
    url: String,
}

impl Control {
    async fn start(mode: Mode) -> Self {
        let state = Arc::new(Mutex::new(ControlState {
            mode,
            polls: Vec::new(),
            bodies: Vec::new(),
        }));

        let app = Router::new()
            .route("/telegraf", post(poll))
            .route("/telegrafUpdate", get(update))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            state,
            url: format!("http://{}/telegraf", addr),
        }
    }

    fn set_mode(&self, mode: Mode) {
        self.state.lock().unwrap().mode = mode;
    }

    fn polls(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().polls.clone()
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().bodies.clone()
    }
}

fn with_revision(mut response: Response, revision: &Option<String>) -> Response {
    if let Some(rev) = revision {
        response
            .headers_mut()
            .insert("x-revision", HeaderValue::from_str(rev).unwrap());
    }
    response
}

async fn poll(
    State(state): State<Arc<Mutex<ControlState>>>,
    Query(query): Query<HashMap<String, String>>,
    _headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    state.bodies.push(body.to_vec());
    let md5 = query.get("md5").cloned().unwrap_or_default();
    state.polls.push(query);

    match state.mode.clone() {
        Mode::NoChange => StatusCode::NO_CONTENT.into_response(),
        Mode::Config { content, revision } => {
            if Fingerprint::of_content(&content).as_str() == md5 {
                StatusCode::NO_CONTENT.into_response()
            } else {
                with_revision((StatusCode::OK, content).into_response(), &revision)
            }
        }
        Mode::Binary { .. } => StatusCode::ACCEPTED.into_response(),
        Mode::Fail(status) => StatusCode::from_u16(status).unwrap().into_response(),
    }
}

async fn update(State(state): State<Arc<Mutex<ControlState>>>) -> Response {
    let state = state.lock().unwrap();
    match &state.mode {
        Mode::Binary {
            body: Some(body),
            revision,
        } => with_revision((StatusCode::OK, body.clone()).into_response(), revision),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Default)]
struct RecordingRestarter {
    calls: Mutex<Vec<RestartReason>>,
}

impl RecordingRestarter {
    fn calls(&self) -> Vec<RestartReason> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Restarter for RecordingRestarter {
    async fn restart(&self, reason: &RestartReason) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(reason.clone());
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    config: PathBuf,
    restarter: Arc<RecordingRestarter>,
}

impl Fixture {
    fn new(url: &str) -> Self {
        Self::with_config(|_| initial_config(url))
    }

    /// Fixture whose configuration file is built from its temp dir
    fn with_config(contents: impl FnOnce(&Path) -> String) -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("syncagent.conf");
        fs::write(&config, contents(dir.path())).unwrap();
        Self {
            dir,
            config,
            restarter: Arc::new(RecordingRestarter::default()),
        }
    }

    fn exe(&self) -> PathBuf {
        self.dir.path().join("syncagent-bin")
    }

    /// A freshly started agent's synchronizer
    fn synchronizer(&self) -> Synchronizer {
        let mut pipeline = Pipeline::load(&self.config).unwrap();
        let settings = pipeline.sync_settings().unwrap();
        let client = pipeline.take_client().unwrap();
        Synchronizer::new(settings, client)
            .unwrap()
            .with_restarter(self.restarter.clone())
            .with_installer(BinaryInstaller::new(self.exe(), false))
    }

    fn contents(&self) -> String {
        fs::read_to_string(&self.config).unwrap()
    }
}

fn initial_config(url: &str) -> String {
    config_file(url, "", "\n[[inputs.cpu]]\n  percpu = false\n\n")
}

fn config_file(url: &str, http_extra: &str, section: &str) -> String {
    format!(
        "# Operator-owned settings\n\
         [agent]\n  interval = 10\n\n\
         [outputs.http]\n  url = \"{url}\"\n  verify_binary = false\n{http_extra}\n\
         {BANNER}\n\
         #                            INPUT PLUGINS                                    #\n\
         {BANNER}\n\
         {section}\
         {BANNER}\n\
         #                            SERVICE INPUT PLUGINS                            #\n\
         {BANNER}\n\
         \n\
         # [[inputs.socket_listener]]\n"
    )
}

fn prefix_of(contents: &str) -> &str {
    let start = contents.find("INPUT PLUGINS").unwrap();
    &contents[..start]
}

fn suffix_of(contents: &str) -> &str {
    let start = contents.find("SERVICE INPUT PLUGINS").unwrap();
    &contents[start..]
}

fn assert_no_candidate(path: &Path) {
    assert!(!candidate_path(path).exists(), "candidate left behind");
}

#[tokio::test]
async fn test_no_change_leaves_everything_alone() {
    let control = Control::start(Mode::NoChange).await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();

    let mut sync = fixture.synchronizer();
    let report = sync.run_cycle(b"cpu usage_idle=99 1\n").await;

    assert!(report.delivered);
    assert_eq!(report.outcome.unwrap(), SyncOutcome::NoChange);
    assert_eq!(fixture.contents(), before);
    assert!(fixture.restarter.calls().is_empty());

    let polls = control.polls();
    assert_eq!(polls.len(), 1);
    assert_eq!(polls[0]["md5"], Fingerprint::of_content("[[inputs.cpu]]\n  percpu = false").as_str());
    assert_eq!(polls[0]["revision"], "");
    assert!(!polls[0]["source"].is_empty());
    assert_eq!(control.bodies()[0], b"cpu usage_idle=99 1\n");
}

#[tokio::test]
async fn test_new_configuration_is_spliced_validated_and_committed() {
    let content = "[[inputs.mem]]\n  swap = true\n\n[[inputs.system]]\n";
    let control = Control::start(Mode::Config {
        content: content.to_string(),
        revision: Some("17".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();

    let mut sync = fixture.synchronizer();
    let report = sync.run_cycle(b"").await;

    assert!(report.delivered);
    let expected = RestartReason::ConfigApplied(Revision::new("17"));
    assert_eq!(
        report.outcome.unwrap(),
        SyncOutcome::Restarting(expected.clone())
    );
    assert_eq!(fixture.restarter.calls(), vec![expected]);

    let after = fixture.contents();
    assert_eq!(prefix_of(&after), prefix_of(&before));
    assert_eq!(suffix_of(&after), suffix_of(&before));
    assert!(after.contains("# Managed section revision: 17, updated: "));
    assert!(after.contains("[[inputs.mem]]\n  swap = true\n"));
    assert!(!after.contains("percpu = false"));
    assert_no_candidate(&fixture.config);

    // The committed section fingerprints to exactly what the server sent
    assert_eq!(sync.fingerprint().unwrap(), Fingerprint::of_content(content));

    // Restarting: nothing else runs in this process
    assert_eq!(sync.run_cycle(b"").await.outcome.unwrap(), SyncOutcome::Skipped);
    assert_eq!(control.polls().len(), 1);
}

#[tokio::test]
async fn test_apply_is_idempotent_across_restart() {
    let control = Control::start(Mode::Config {
        content: "[[inputs.mem]]\n".to_string(),
        revision: Some("2".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);

    let report = fixture.synchronizer().run_cycle(b"").await;
    assert!(report.is_restarting());
    let applied = fixture.contents();

    // The restarted agent reports the new fingerprint and gets nothing back
    let report = fixture.synchronizer().run_cycle(b"").await;
    assert_eq!(report.outcome.unwrap(), SyncOutcome::NoChange);
    assert_eq!(fixture.contents(), applied);
    assert_eq!(fixture.restarter.calls().len(), 1);
}

#[tokio::test]
async fn test_revision_falls_back_to_content_fingerprint() {
    let content = "[[inputs.system]]\n";
    let control = Control::start(Mode::Config {
        content: content.to_string(),
        revision: None,
    })
    .await;
    let fixture = Fixture::new(&control.url);

    let outcome = fixture.synchronizer().run_cycle(b"").await.outcome.unwrap();
    let expected = Revision::new(Fingerprint::of_content(content).as_str());
    assert_eq!(
        outcome,
        SyncOutcome::Restarting(RestartReason::ConfigApplied(expected.clone()))
    );
    assert!(fixture
        .contents()
        .contains(&format!("# Managed section revision: {},", expected)));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let control = Control::start(Mode::Config {
        content: "[[inputs.no_such_plugin]]\n".to_string(),
        revision: Some("3".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();
    let modified = fs::metadata(&fixture.config).unwrap().modified().unwrap();

    let mut sync = fixture.synchronizer();
    let report = sync.run_cycle(b"").await;

    // The batch was delivered even though the configuration was refused
    assert!(report.delivered);
    assert_eq!(outcome_label(&report.outcome), "rejected");
    let err = report.outcome.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Content);
    assert!(err.to_string().contains("no_such_plugin"));

    assert_eq!(fixture.contents(), before);
    assert_eq!(
        fs::metadata(&fixture.config).unwrap().modified().unwrap(),
        modified
    );
    assert_no_candidate(&fixture.config);
    assert!(fixture.restarter.calls().is_empty());

    // Not restarting, so the next flush polls again
    control.set_mode(Mode::NoChange);
    assert_eq!(sync.run_cycle(b"").await.outcome.unwrap(), SyncOutcome::NoChange);
}

#[tokio::test]
async fn test_unparseable_configuration_is_rejected() {
    let control = Control::start(Mode::Config {
        content: "[[inputs.cpu]\n  percpu = \n".to_string(),
        revision: None,
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();

    let outcome = fixture.synchronizer().run_cycle(b"").await.outcome;
    assert!(matches!(outcome, Err(SyncError::Rejected(_))));
    assert_eq!(fixture.contents(), before);
    assert_no_candidate(&fixture.config);
}

#[tokio::test]
async fn test_transport_error_changes_nothing() {
    let control = Control::start(Mode::Fail(500)).await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();

    let report = fixture.synchronizer().run_cycle(b"cpu x=1 1\n").await;
    assert!(!report.delivered);
    assert_eq!(report.outcome.unwrap_err().kind(), ErrorKind::Transport);
    assert_eq!(fixture.contents(), before);
    assert!(fixture.restarter.calls().is_empty());
}

#[tokio::test]
async fn test_busy_configuration_file_skips_cycle() {
    let control = Control::start(Mode::NoChange).await;
    let fixture = Fixture::new(&control.url);

    let _held = lock::try_acquire(&fixture.config).unwrap().unwrap();
    let report = fixture.synchronizer().run_cycle(b"").await;

    assert!(!report.delivered);
    assert_eq!(report.outcome.unwrap(), SyncOutcome::Skipped);
    assert!(control.polls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_binary_update_is_installed_and_revision_persisted() {
    let control = Control::start(Mode::Binary {
        body: Some(b"#!/bin/sh\necho syncagent 2.0\n".to_vec()),
        revision: Some("bin-2".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    fs::write(fixture.exe(), "old binary").unwrap();
    let before = fixture.contents();

    let mut sync = fixture.synchronizer();
    let report = sync.run_cycle(b"").await;

    let expected = RestartReason::BinaryInstalled(Revision::new("bin-2"));
    assert_eq!(report.outcome.unwrap(), SyncOutcome::Restarting(expected.clone()));
    assert_eq!(fixture.restarter.calls(), vec![expected]);
    assert_eq!(
        fs::read_to_string(fixture.exe()).unwrap(),
        "#!/bin/sh\necho syncagent 2.0\n"
    );
    assert_no_candidate(&fixture.exe());
    assert_eq!(fixture.contents(), before);
    assert_eq!(
        fs::read_to_string(fixture.dir.path().join("syncagent-revision")).unwrap(),
        "bin-2\n"
    );

    // After the restart the stored revision goes out with every poll
    control.set_mode(Mode::NoChange);
    let mut restarted = fixture.synchronizer();
    assert_eq!(restarted.revision(), Some(&Revision::new("bin-2")));
    restarted.run_cycle(b"").await.outcome.unwrap();
    assert_eq!(control.polls().last().unwrap()["revision"], "bin-2");
}

#[tokio::test]
async fn test_announced_binary_without_download_is_no_real_update() {
    let control = Control::start(Mode::Binary {
        body: None,
        revision: None,
    })
    .await;
    let fixture = Fixture::new(&control.url);
    fs::write(fixture.exe(), "old binary").unwrap();

    let report = fixture.synchronizer().run_cycle(b"").await;
    assert!(report.delivered);
    assert_eq!(report.outcome.unwrap(), SyncOutcome::NoRealUpdate);
    assert_eq!(fs::read_to_string(fixture.exe()).unwrap(), "old binary");
    assert!(!fixture.dir.path().join("syncagent-revision").exists());
    assert!(fixture.restarter.calls().is_empty());
}

#[tokio::test]
async fn test_missing_section_is_appended() {
    let control = Control::start(Mode::Config {
        content: "[[inputs.mem]]\n".to_string(),
        revision: Some("1".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let bare = format!(
        "[agent]\n  interval = 10\n\n[outputs.http]\n  url = \"{}\"\n",
        control.url
    );
    fs::write(&fixture.config, &bare).unwrap();

    let mut sync = fixture.synchronizer();
    assert_eq!(
        control.polls().len(),
        0,
        "synchronizer must not poll on construction"
    );
    assert!(sync.run_cycle(b"").await.is_restarting());
    assert_eq!(
        control.polls()[0]["md5"],
        Fingerprint::empty().as_str()
    );

    let after = fixture.contents();
    assert!(after.starts_with(&bare));
    assert!(after.contains("INPUT PLUGINS"));
    assert_eq!(sync.fingerprint().unwrap(), Fingerprint::of_content("[[inputs.mem]]"));
}

#[tokio::test]
async fn test_first_configuration_fills_empty_section() {
    let control = Control::start(Mode::Config {
        content: "[[inputs.cpu]]\n".to_string(),
        revision: Some("1".to_string()),
    })
    .await;
    let url = control.url.clone();
    let fixture = Fixture::with_config(|_| config_file(&url, "", "\n"));
    let before = fixture.contents();

    let mut sync = fixture.synchronizer();
    let report = sync.run_cycle(b"").await;

    assert_eq!(control.polls()[0]["md5"], Fingerprint::empty().as_str());
    assert_eq!(
        report.outcome.unwrap(),
        SyncOutcome::Restarting(RestartReason::ConfigApplied(Revision::new("1")))
    );

    let after = fixture.contents();
    assert_eq!(prefix_of(&after), prefix_of(&before));
    assert_eq!(suffix_of(&after), suffix_of(&before));
    assert!(after.contains("# Managed section revision: 1, updated: "));
    assert_eq!(
        sync.fingerprint().unwrap(),
        Fingerprint::of_content("[[inputs.cpu]]\n")
    );
    assert_no_candidate(&fixture.config);
}

#[tokio::test]
async fn test_content_with_sentinel_line_is_rejected() {
    let content = format!("[[inputs.mem]]\n{BANNER}\n# more\n[[inputs.system]]\n");
    let control = Control::start(Mode::Config {
        content,
        revision: Some("9".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let before = fixture.contents();

    // Every fresh agent gets the same offer and refuses it without a restart
    for _ in 0..3 {
        let report = fixture.synchronizer().run_cycle(b"").await;
        assert!(report.delivered);
        let err = report.outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Content);
        assert!(err.to_string().contains("sentinel"));
    }

    assert_eq!(fixture.contents(), before);
    assert_no_candidate(&fixture.config);
    assert!(fixture.restarter.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unwritable_revision_marker_keeps_running_binary() {
    let control = Control::start(Mode::Binary {
        body: Some(b"NEW".to_vec()),
        revision: Some("bin-2".to_string()),
    })
    .await;
    let url = control.url.clone();
    let fixture = Fixture::with_config(|dir| {
        let marker = dir.join("missing").join("rev");
        config_file(&url, &format!("  revision_file = \"{}\"\n", marker.display()), "\n")
    });
    fs::write(fixture.exe(), "OLD").unwrap();

    let mut sync = fixture.synchronizer();
    for _ in 0..2 {
        let report = sync.run_cycle(b"").await;
        assert_eq!(report.outcome.unwrap_err().kind(), ErrorKind::LocalIo);
        assert_eq!(fs::read_to_string(fixture.exe()).unwrap(), "OLD");
        assert_no_candidate(&fixture.exe());
    }

    assert!(fixture.restarter.calls().is_empty());
    assert_eq!(sync.revision(), None);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_binary_swap_restores_revision_marker() {
    let control = Control::start(Mode::Binary {
        body: Some(b"NEW".to_vec()),
        revision: Some("bin-3".to_string()),
    })
    .await;
    let fixture = Fixture::new(&control.url);
    let marker = fixture.dir.path().join("syncagent-revision");
    fs::write(&marker, "bin-2\n").unwrap();

    // A directory in place of the executable makes the final rename fail
    fs::create_dir(fixture.exe()).unwrap();
    fs::write(fixture.exe().join("keep"), "x").unwrap();

    let mut sync = fixture.synchronizer();
    assert_eq!(sync.revision(), Some(&Revision::new("bin-2")));

    let report = sync.run_cycle(b"").await;
    assert_eq!(report.outcome.unwrap_err().kind(), ErrorKind::FatalApply);
    assert_eq!(fs::read_to_string(&marker).unwrap(), "bin-2\n");
    assert_eq!(sync.revision(), Some(&Revision::new("bin-2")));
    assert_no_candidate(&fixture.exe());
    assert!(fixture.restarter.calls().is_empty());
}
