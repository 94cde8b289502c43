//! End-to-end projection scenarios driven through the reconciler.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::State,
    routing::{get, post},
    Router,
};
use configuration::Settings;
use engine::{DataValue, EventKind, Reconciler, ResourceKind, Snapshot};
use support::net::{NotificationTarget, Notifier, NotifierOptions};
use url::Url;

fn settings(folder: &Path, extra: &[(&str, String)]) -> Arc<Settings> {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("LABEL".to_string(), "app.kubernetes.io/managed".to_string()),
        ("LABEL_VALUE".to_string(), "true".to_string()),
        ("NAMESPACE".to_string(), "a".to_string()),
        ("FOLDER".to_string(), folder.to_str().unwrap().to_string()),
    ]);
    for (key, value) in extra {
        vars.insert(key.to_string(), value.clone());
    }
    Arc::new(Settings::from_lookup(move |name| vars.get(name).cloned()).unwrap())
}

fn plain_notifier() -> Arc<Notifier> {
    Arc::new(Notifier::new(NotifierOptions::default()).unwrap())
}

fn config_map(namespace: &str, name: &str, entries: &[(&str, DataValue)]) -> Snapshot {
    Snapshot {
        kind: ResourceKind::ConfigMap,
        namespace: namespace.into(),
        name: name.into(),
        resource_version: Some("1".into()),
        annotations: BTreeMap::new(),
        data: entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    }
}

/// Serves `GET /200` (body `200`) and counts `POST /hook` calls.
async fn spawn_fixture() -> (SocketAddr, Arc<AtomicUsize>) {
    let hooks = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/200", get(|| async { "200" }))
        .route(
            "/hook",
            post(|State(hooks): State<Arc<AtomicUsize>>| async move {
                hooks.fetch_add(1, Ordering::SeqCst);
                "ok"
            }),
        )
        .with_state(hooks.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, hooks)
}

#[tokio::test]
async fn text_and_binary_data_end_up_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), plain_notifier());

    reconciler
        .apply_event(
            EventKind::Added,
            config_map(
                "a",
                "cm1",
                &[
                    ("app.conf", DataValue::Text("k=v\n".into())),
                    ("logo.png", DataValue::Binary(vec![0x89, 0x50, 0x4e])),
                ],
            ),
        )
        .await;

    assert_eq!(std::fs::read(tmp.path().join("app.conf")).unwrap(), b"k=v\n");
    assert_eq!(std::fs::read(tmp.path().join("logo.png")).unwrap(), [0x89, 0x50, 0x4e]);
}

#[tokio::test]
async fn secret_data_is_projected_decoded() {
    let tmp = tempfile::tempdir().unwrap();
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), plain_notifier());

    let secret = Snapshot {
        kind: ResourceKind::Secret,
        namespace: "a".into(),
        name: "s1".into(),
        resource_version: Some("1".into()),
        annotations: BTreeMap::new(),
        data: [("token".to_string(), DataValue::Binary(b"hunter2".to_vec()))].into(),
    };
    reconciler.apply_event(EventKind::Added, secret).await;

    assert_eq!(std::fs::read(tmp.path().join("token")).unwrap(), b"hunter2");
}

#[tokio::test]
async fn url_keys_project_the_fetched_body() {
    let (addr, _) = spawn_fixture().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), plain_notifier());

    reconciler
        .apply_event(
            EventKind::Added,
            config_map(
                "a",
                "cm1",
                &[("index.html.url", DataValue::Text(format!("http://{addr}/200")))],
            ),
        )
        .await;

    assert_eq!(std::fs::read(tmp.path().join("index.html")).unwrap(), b"200");
}

#[tokio::test]
async fn annotated_resources_land_in_their_own_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), plain_notifier());

    let mut snapshot = config_map("a", "cm1", &[("app.conf", DataValue::Text("x".into()))]);
    snapshot.annotations.insert(
        "k8s-sidecar-target-directory".into(),
        out.path().to_str().unwrap().into(),
    );
    reconciler.apply_event(EventKind::Added, snapshot).await;

    assert!(out.path().join("app.conf").exists());
    assert!(!tmp.path().join("app.conf").exists());
}

#[tokio::test]
async fn unique_filenames_never_collide_across_namespaces() {
    let tmp = tempfile::tempdir().unwrap();
    let mut reconciler = Reconciler::new(
        settings(tmp.path(), &[("UNIQUE_FILENAMES", "true".to_string())]),
        plain_notifier(),
    );

    reconciler
        .apply_full_set(vec![
            config_map("a", "cmA", &[("shared.conf", DataValue::Text("a".into()))]),
            config_map("b", "cmB", &[("shared.conf", DataValue::Text("b".into()))]),
        ])
        .await;

    assert_eq!(
        std::fs::read(tmp.path().join("namespace_a.configmap_cmA.shared.conf")).unwrap(),
        b"a"
    );
    assert_eq!(
        std::fs::read(tmp.path().join("namespace_b.configmap_cmB.shared.conf")).unwrap(),
        b"b"
    );
}

#[tokio::test]
async fn deletion_removes_the_file_and_posts_exactly_once() {
    let (addr, hooks) = spawn_fixture().await;
    let tmp = tempfile::tempdir().unwrap();

    let notifier = Arc::new(
        Notifier::new(NotifierOptions {
            target: Some(NotificationTarget {
                url: Url::parse(&format!("http://{addr}/hook")).unwrap(),
                method: Some("POST".into()),
                payload: None,
            }),
            ..NotifierOptions::default()
        })
        .unwrap(),
    );
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), notifier);

    let snapshot = config_map("a", "cm1", &[("app.conf", DataValue::Text("k=v\n".into()))]);
    reconciler.apply_event(EventKind::Added, snapshot.clone()).await;
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    // replaying the unchanged object must not notify again
    reconciler.apply_event(EventKind::Modified, snapshot.clone()).await;
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    reconciler.apply_event(EventKind::Deleted, snapshot).await;
    assert!(!tmp.path().join("app.conf").exists());
    assert_eq!(hooks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn one_notification_per_full_set_pass() {
    let (addr, hooks) = spawn_fixture().await;
    let tmp = tempfile::tempdir().unwrap();

    let notifier = Arc::new(
        Notifier::new(NotifierOptions {
            target: Some(NotificationTarget {
                url: Url::parse(&format!("http://{addr}/hook")).unwrap(),
                method: Some("POST".into()),
                payload: None,
            }),
            ..NotifierOptions::default()
        })
        .unwrap(),
    );
    let mut reconciler = Reconciler::new(settings(tmp.path(), &[]), notifier);

    reconciler
        .apply_full_set(vec![
            config_map("a", "cm1", &[("one.conf", DataValue::Text("1".into()))]),
            config_map("a", "cm2", &[("two.conf", DataValue::Text("2".into()))]),
        ])
        .await;
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    // a convergent pass is silent
    reconciler
        .apply_full_set(vec![
            config_map("a", "cm1", &[("one.conf", DataValue::Text("1".into()))]),
            config_map("a", "cm2", &[("two.conf", DataValue::Text("2".into()))]),
        ])
        .await;
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}
