//! Concurrent first requests share one proxy build

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{get, Harness, PolicyReviewer, RecordingFactory};
use futures::future::join_all;
use tower::ServiceExt;

const SECRET: &str = "s3cr3t";

fn harness(build_delay: Duration) -> Harness {
    let h = Harness::with_factory(
        PolicyReviewer::allow_all(),
        RecordingFactory {
            build_delay,
            ..Default::default()
        },
    );
    h.add_user("u-1");
    h.add_token("token-1", SECRET, "u-1", None);
    h
}

async fn fire(h: &Harness, paths: Vec<String>) -> Vec<StatusCode> {
    let auth = format!("Bearer token-1:{SECRET}");
    let requests = paths.into_iter().map(|path| {
        let app = h.app.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            app.oneshot(get(&path, &[("authorization", auth.as_str())]))
                .await
                .unwrap()
                .status()
        })
    });
    join_all(requests)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

#[tokio::test]
async fn test_concurrent_first_requests_build_once() {
    let h = harness(Duration::from_millis(50));
    h.add_cluster("c-1");

    let paths = (0..24)
        .map(|i| format!("/k8s/clusters/c-1/api/v1/namespaces/ns-{i}/pods"))
        .collect();
    let statuses = fire(&h, paths).await;

    assert!(statuses.iter().all(|s| *s == StatusCode::OK));
    assert_eq!(h.factory.builds(), 1);
    assert_eq!(h.factory.served().len(), 24);
}

#[tokio::test]
async fn test_distinct_clusters_build_independently() {
    let h = harness(Duration::from_millis(20));
    h.add_cluster("c-1");
    h.add_cluster("c-2");

    let paths = (0..16)
        .map(|i| format!("/k8s/clusters/c-{}/version", i % 2 + 1))
        .collect();
    let statuses = fire(&h, paths).await;

    assert!(statuses.iter().all(|s| *s == StatusCode::OK));
    assert_eq!(h.factory.builds(), 2);
    assert_eq!(h.router.len(), 2);
}

#[tokio::test]
async fn test_deleted_cluster_is_rebuilt_after_invalidate() {
    let h = harness(Duration::ZERO);
    h.add_cluster("c-1");

    fire(&h, vec!["/k8s/clusters/c-1/version".to_string()]).await;
    h.store.remove_cluster("c-1");
    h.router.invalidate("c-1");

    let statuses = fire(&h, vec!["/k8s/clusters/c-1/version".to_string()]).await;
    assert_eq!(statuses, vec![StatusCode::NOT_FOUND]);
    assert!(h.router.is_empty());

    h.add_cluster("c-1");
    fire(&h, vec!["/k8s/clusters/c-1/version".to_string()]).await;
    assert_eq!(h.factory.builds(), 2);
}
