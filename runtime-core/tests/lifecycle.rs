//! Operation and request lifecycle: reference counting, trace
//! submission, and parent-child inheritance across spawned tasks.

use runtime_core::lifecycle::{self, RequestDesc, RequestOutcome};
use runtime_core::metrics::EndpointMetrics;
use runtime_core::trace::Tracer;
use runtime_core::tracker;
use std::sync::Arc;
use std::time::Duration;

fn desc(endpoint: &str, traced: bool) -> RequestDesc {
    RequestDesc {
        service: "svc".into(),
        endpoint: endpoint.into(),
        method: "GET".into(),
        path: format!("/{endpoint}"),
        traced,
        ..Default::default()
    }
}

fn finish(metrics: &EndpointMetrics) {
    lifecycle::finish_request(
        metrics,
        RequestOutcome {
            outputs: b"",
            err: None,
            http_status: 200,
            panic_stack: None,
        },
    );
}

#[tokio::test]
async fn operation_completes_when_all_requests_finish() {
    let (tracer, mut completed) = Tracer::capturing();
    let metrics = Arc::new(EndpointMetrics::new());

    tracker::scope(async {
        // The first request on an untagged task creates the operation.
        let r1 = lifecycle::begin_request(&tracer, desc("r1", true)).expect("begin r1");
        assert!(r1.traced);
        let op = tracker::current().expect("tagged").op;
        assert_eq!(op.refs(), 1);

        // A child task inherits the operation and starts its own request.
        let handle = tracker::spawn({
            let tracer = tracer.clone();
            let metrics = metrics.clone();
            async move {
                let r2 = lifecycle::begin_request(&tracer, desc("r2", true)).expect("begin r2");
                assert_eq!(r2.trace_id, tracker::current_request().unwrap().trace_id);
                finish(&metrics);
            }
        });
        handle.await.expect("child joins");

        // The child's matched begin/finish pair left the count unchanged.
        assert_eq!(op.refs(), 1);

        // Nothing has been submitted yet.
        assert!(completed.try_recv().is_err());

        finish(&metrics);
        assert_eq!(op.refs(), 0);
    })
    .await;

    // Exactly one trace was submitted.
    let trace = completed.try_recv().expect("one completed trace");
    assert!(!trace.data.is_empty());
    assert!(completed.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_children_complete_the_op_exactly_when_all_finish() {
    let (tracer, mut completed) = Tracer::capturing();
    let metrics = Arc::new(EndpointMetrics::new());
    const K: usize = 8;

    tracker::scope(async {
        lifecycle::begin_request(&tracer, desc("root", true)).expect("begin root");
        let op = tracker::current().expect("tagged").op;

        let mut handles = Vec::new();
        for i in 0..K {
            let tracer = tracer.clone();
            let metrics = metrics.clone();
            handles.push(tracker::spawn(async move {
                lifecycle::begin_request(&tracer, desc(&format!("child-{i}"), true))
                    .expect("begin child");
                tokio::time::sleep(Duration::from_millis(5)).await;
                finish(&metrics);
            }));
        }
        for handle in handles {
            handle.await.expect("child joins");
        }

        // All matched pairs completed: only the root's reference remains.
        assert_eq!(op.refs(), 1);
        assert!(completed.try_recv().is_err());

        finish(&metrics);
    })
    .await;

    assert!(completed.try_recv().is_ok());
    assert!(completed.try_recv().is_err());
}

#[tokio::test]
async fn children_inherit_uid_auth_and_trace_across_spawn() {
    let tracer = Tracer::noop();
    let metrics = EndpointMetrics::new();

    tracker::scope(async {
        let parent = lifecycle::begin_request(
            &tracer,
            RequestDesc {
                uid: Some("user-1".into()),
                auth_data: Some(serde_json::json!({"plan": "pro"})),
                ..desc("parent", false)
            },
        )
        .expect("begin parent");

        let parent_trace = parent.trace_id;
        let parent_span = parent.span_id;
        let parent_auth = parent.auth_data.clone();

        let handle = tracker::spawn({
            let tracer = tracer.clone();
            async move {
                let child =
                    lifecycle::begin_request(&tracer, desc("child", false)).expect("begin child");
                assert_eq!(child.trace_id, parent_trace);
                assert_eq!(child.parent_span, Some(parent_span));
                assert_eq!(child.uid.as_deref(), Some("user-1"));
                assert_eq!(child.auth_data, parent_auth);
                tracker::finish_request();
            }
        });
        handle.await.expect("child joins");

        finish(&metrics);
    })
    .await;
}
