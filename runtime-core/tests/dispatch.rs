//! End-to-end dispatch through the API server: routing, auth gating,
//! panic isolation, and CORS rejection.

use runtime_core::api::{
    typed_handler, Access, AuthHandlerDesc, Cors, Endpoint, Handler, InternalRoutes, Server,
};
use runtime_core::config::CorsConfig;
use runtime_core::metrics::EndpointMetrics;
use runtime_core::platform::RequestValidator;
use runtime_core::pubsub::PushRegistry;
use runtime_core::trace::Tracer;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

mod support;
use support::{request, response_json, test_server};

fn counting_endpoint(
    name: &str,
    path: &str,
    methods: &[&str],
    access: Access,
) -> (Arc<Endpoint>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let inner = calls.clone();
    let endpoint = Endpoint::new(
        "svc",
        name,
        path,
        methods,
        access,
        Handler::Typed(typed_handler(move |_params, _payload| {
            let inner = inner.clone();
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"ok": true}))
            }
        })),
    );
    (endpoint, calls)
}

#[tokio::test]
async fn registered_route_is_invoked_and_unknown_methods_404() {
    let mut server = test_server();
    let (endpoint, calls) = counting_endpoint("get_x", "/x", &["GET"], Access::Public);
    server.register(endpoint).unwrap();
    let server = Arc::new(server);

    let (status, body) = response_json(server.dispatch(request("GET", "/x", &[], b"")).await).await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same path, wrong method: the standard not-found JSON shape.
    let (status, body) = response_json(server.dispatch(request("POST", "/x", &[], b"")).await).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "unknown_endpoint");
    assert!(body["message"].is_string());
    assert!(body["details"].is_null());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_endpoints_reject_unauthenticated_requests() {
    let mut server = test_server();
    let (endpoint, calls) = counting_endpoint("whoami", "/whoami", &["GET"], Access::Auth);
    server.register(endpoint).unwrap();
    let server = Arc::new(server);

    let (status, body) =
        response_json(server.dispatch(request("GET", "/whoami", &[], b"")).await).await;
    assert_eq!(status, 401);
    assert_eq!(body["code"], "unauthenticated");
    // The handler never ran.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_handler_resolves_uid_for_protected_endpoints() {
    let mut server = test_server();
    let (endpoint, calls) = counting_endpoint("whoami", "/whoami", &["GET"], Access::Auth);
    server.register(endpoint).unwrap();
    server.set_auth_handler(AuthHandlerDesc {
        service: "svc".into(),
        name: "auth".into(),
        handler: typed_handler(|_params, payload| async move {
            let token = payload["authorization"].as_str().unwrap_or_default();
            if token == "Bearer good" {
                Ok(serde_json::json!({"uid": "user-1", "user_data": {"plan": "pro"}}))
            } else {
                Err(runtime_core::Error::unauthenticated("bad token"))
            }
        }),
    });
    let server = Arc::new(server);

    let (status, _) = response_json(
        server
            .dispatch(request("GET", "/whoami", &[("authorization", "Bearer good")], b""))
            .await,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (status, body) = response_json(
        server
            .dispatch(request("GET", "/whoami", &[("authorization", "Bearer bad")], b""))
            .await,
    )
    .await;
    assert_eq!(status, 401);
    assert_eq!(body["code"], "unauthenticated");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_panics_become_internal_errors() {
    let mut server = test_server();
    server
        .register(Endpoint::new(
            "svc",
            "explode",
            "/explode",
            &["GET"],
            Access::Public,
            Handler::Typed(typed_handler(|_params, _payload| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(serde_json::Value::Null)
            })),
        ))
        .unwrap();
    let (ok_endpoint, _) = counting_endpoint("fine", "/fine", &["GET"], Access::Public);
    server.register(ok_endpoint).unwrap();
    let server = Arc::new(server);

    let (status, body) =
        response_json(server.dispatch(request("GET", "/explode", &[], b"")).await).await;
    assert_eq!(status, 500);
    assert_eq!(body["code"], "internal");
    assert!(body["message"].as_str().unwrap().contains("boom"));

    // The process keeps serving.
    let (status, _) = response_json(server.dispatch(request("GET", "/fine", &[], b"")).await).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn disallowed_credentialed_origins_are_rejected() {
    let cors = Cors::from_config(Some(&CorsConfig {
        disable_credentials: false,
        allow_origins_with_credentials: vec!["https://app.example.com".into()],
        allow_origins_without_credentials: Some(vec!["*".into()]),
        raw_allowed_headers: vec![],
    }));
    let metrics = Arc::new(EndpointMetrics::new());
    let mut server = Server::new(
        cors,
        Arc::new(RequestValidator::new(Vec::new())),
        InternalRoutes::new(Arc::new(PushRegistry::new()), metrics.clone()),
        Tracer::noop(),
        metrics,
        false,
    );
    let (endpoint, calls) = counting_endpoint("get_x", "/x", &["GET"], Access::Public);
    server.register(endpoint).unwrap();
    let server = Arc::new(server);

    // Credentialed request (cookie) from an unlisted origin: rejected.
    let (status, _) = response_json(
        server
            .dispatch(request(
                "GET",
                "/x",
                &[("origin", "https://evil.example.com"), ("cookie", "s=1")],
                b"",
            ))
            .await,
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The same origin without credentials is fine under the `*` list.
    let (status, _) = response_json(
        server
            .dispatch(request("GET", "/x", &[("origin", "https://evil.example.com")], b""))
            .await,
    )
    .await;
    assert_eq!(status, 200);

    // The listed origin may send credentials.
    let (status, _) = response_json(
        server
            .dispatch(request(
                "GET",
                "/x",
                &[("origin", "https://app.example.com"), ("cookie", "s=1")],
                b"",
            ))
            .await,
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn internal_health_route_responds() {
    let server = Arc::new(test_server());
    let (status, body) =
        response_json(server.dispatch(request("GET", "/__encore/healthz", &[], b"")).await).await;
    assert_eq!(status, 200);
    assert_eq!(body["code"], "ok");
}

#[tokio::test]
async fn internal_metrics_route_reports_endpoint_series() {
    let mut server = test_server();
    let (endpoint, _) = counting_endpoint("get_x", "/x", &["GET"], Access::Public);
    server.register(endpoint).unwrap();
    let server = Arc::new(server);

    server.dispatch(request("GET", "/x", &[], b"")).await;
    server.dispatch(request("GET", "/x", &[], b"")).await;

    let (status, body) =
        response_json(server.dispatch(request("GET", "/__encore/metrics", &[], b"")).await).await;
    assert_eq!(status, 200);
    let series = body["endpoints"].as_array().expect("series array");
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["service"], "svc");
    assert_eq!(series[0]["endpoint"], "get_x");
    assert_eq!(series[0]["code"], "ok");
    assert_eq!(series[0]["count"], 2);
}
