pub mod auth;
pub mod error;
mod integrations;
mod stats;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Outcomes
        .route(
            "/organizations/:org/stats_v2/",
            get(stats::organization_stats_v2),
        )
        // GitHub installation
        .route(
            "/organizations/:org/integrations/github/",
            post(integrations::install_github),
        )
        .route("/integrations/github/install-url", get(integrations::install_url))
        // Installation-scoped lookups
        .route(
            "/organizations/:org/integrations/:id/repos",
            get(integrations::list_repositories),
        )
        .route(
            "/organizations/:org/integrations/:id/issues",
            get(integrations::search_issues),
        )
        .route(
            "/organizations/:org/integrations/:id/unmigratable-repos",
            get(integrations::unmigratable_repositories),
        )
        .route(
            "/organizations/:org/integrations/:id/stacktrace-link",
            get(integrations::stacktrace_link),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/0", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{self, Integration, NewIntegration, Organization, GITHUB_PROVIDER};
    use crate::github::testing::{issued_token, TEST_KEY};
    use crate::outcomes::{AggregationService, OutcomesError, QueryRequest, Row};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "test-admin-token";

    #[derive(Default)]
    struct RecordingOutcomes {
        requests: Mutex<Vec<QueryRequest>>,
    }

    #[async_trait]
    impl AggregationService for RecordingOutcomes {
        async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, OutcomesError> {
            self.requests.lock().unwrap().push(request.clone());
            let row = json!({"category": 1, "project_id": 3, "aggregate": 5});
            Ok(vec![row.as_object().unwrap().clone()])
        }
    }

    async fn test_state(api_url: &str) -> (Arc<AppState>, Arc<RecordingOutcomes>) {
        let mut config = Config::default();
        config.auth.admin_token = TOKEN.to_string();
        config.github.api_url = api_url.to_string();
        config.github.app_name = Some("Error Tracker".to_string());

        let outcomes = Arc::new(RecordingOutcomes::default());
        let pool = db::in_memory().await.unwrap();
        Organization::create(&pool, "acme", "Acme").await.unwrap();
        (
            Arc::new(AppState::new(config, pool, outcomes.clone())),
            outcomes,
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_integration(state: &AppState) -> String {
        seed_integration_with(state, "ghs_valid", "2999-01-01T00:00:00Z").await
    }

    async fn seed_integration_with(state: &AppState, token: &str, expires_at: &str) -> String {
        let org = Organization::find_by_slug(&state.db, "acme")
            .await
            .unwrap()
            .unwrap();
        let model = Integration::upsert(
            &state.db,
            &NewIntegration {
                provider: GITHUB_PROVIDER.into(),
                external_id: "42".into(),
                idp_external_id: Some("1337".into()),
                name: "acme".into(),
                metadata: json!({
                    "access_token": token,
                    "expires_at": expires_at,
                    "account_type": "Organization",
                    "installation_id": "42",
                    "installation": {"id": "1337", "name": "app", "private_key": TEST_KEY}
                }),
            },
        )
        .await
        .unwrap();
        Integration::link_organization(&state.db, org.id, &model.id)
            .await
            .unwrap();
        model.id
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_admin_token() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let router = create_router(state);

        let missing = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/0/organizations/acme/stats_v2/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = router
            .oneshot(
                Request::builder()
                    .uri("/api/0/organizations/acme/stats_v2/")
                    .header("X-API-Key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(wrong).await["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_stats_v2_queries_outcomes() {
        let (state, outcomes) = test_state("http://127.0.0.1:9").await;
        let response = create_router(state)
            .oneshot(get(
                "/api/0/organizations/acme/stats_v2/?start=1700000000&end=1700086400&rollup=1d",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await[0]["aggregate"], 5);

        let requests = outcomes.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].rollup, 86400);
        assert_eq!(requests[0].start.timestamp() % 86400, 0);
        assert_eq!(
            requests[0].group_by,
            vec!["category", "project_id", "timestamp"]
        );
    }

    #[tokio::test]
    async fn test_stats_v2_rejects_bad_params() {
        let (state, outcomes) = test_state("http://127.0.0.1:9").await;
        let router = create_router(state);

        let response = router
            .clone()
            .oneshot(get("/api/0/organizations/acme/stats_v2/?rollup=5m"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "validation_error");

        let response = router
            .oneshot(get("/api/0/organizations/missing/stats_v2/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(outcomes.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_v2_rejects_unrepresentable_period() {
        let (state, outcomes) = test_state("http://127.0.0.1:9").await;
        let response = create_router(state)
            .oneshot(get("/api/0/organizations/acme/stats_v2/?statsPeriod=1000000000d"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "validation_error");
        assert!(outcomes.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_url_redirects_to_app_page() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let response = create_router(state)
            .oneshot(get("/api/0/integrations/github/install-url"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://github.com/apps/error-tracker"
        );
    }

    #[tokio::test]
    async fn test_repos_lists_installation_repositories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 2,
                "repositories": [
                    {"id": 1, "name": "api", "full_name": "acme/api", "archived": false},
                    {"id": 2, "name": "old", "full_name": "acme/old", "archived": true}
                ]
            })))
            .mount(&server)
            .await;

        let (state, _) = test_state(&server.uri()).await;
        let id = seed_integration(&state).await;
        let response = create_router(state)
            .oneshot(get(&format!("/api/0/organizations/acme/integrations/{}/repos", id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!([{"name": "api", "identifier": "acme/api"}])
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_token_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(issued_token("ghs_new")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 1,
                "repositories": [
                    {"id": 1, "name": "api", "full_name": "acme/api", "archived": false}
                ]
            })))
            .mount(&server)
            .await;

        let (state, _) = test_state(&server.uri()).await;
        let id = seed_integration_with(&state, "ghs_stale", "2000-01-01T00:00:00Z").await;
        let router = create_router(state);
        let uri = format!("/api/0/organizations/acme/integrations/{}/repos", id);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let router = router.clone();
                let uri = uri.clone();
                tokio::spawn(async move { router.oneshot(get(&uri)).await.unwrap().status() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        let exchanges = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path().ends_with("/access_tokens"))
            .count();
        assert_eq!(exchanges, 1);
    }

    #[tokio::test]
    async fn test_github_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})))
            .mount(&server)
            .await;

        let (state, _) = test_state(&server.uri()).await;
        let id = seed_integration(&state).await;
        let response = create_router(state)
            .oneshot(get(&format!("/api/0/organizations/acme/integrations/{}/repos", id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "external_service_error");
        assert_eq!(
            body["error"]["message"],
            format!(
                "Error Communicating with GitHub (HTTP 401): {}",
                crate::github::integration::ERR_UNAUTHORIZED
            )
        );
    }

    #[tokio::test]
    async fn test_unknown_integration_is_not_found() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let response = create_router(state)
            .oneshot(get("/api/0/organizations/acme/integrations/nope/repos"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reinstall_moves_existing_integration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations/43"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 43,
                "app_id": 1337,
                "account": {
                    "login": "acme",
                    "id": 7,
                    "type": "Organization",
                    "avatar_url": "https://avatars.githubusercontent.com/u/7",
                    "html_url": "https://github.com/acme"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (state, _) = test_state(&server.uri()).await;
        let id = seed_integration(&state).await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/0/organizations/acme/integrations/github/")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "installation_id": "43",
                    "reinstall_id": id,
                    "installation": {"id": "1337", "name": "app", "private_key": TEST_KEY}
                })
                .to_string(),
            ))
            .unwrap();

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["integration"]["id"], id.as_str());
        assert_eq!(body["integration"]["external_id"], "43");

        let stored = Integration::find(&state.db, &id).await.unwrap().unwrap();
        assert_eq!(stored.idp_external_id.as_deref(), Some("1337"));
    }

    #[tokio::test]
    async fn test_reinstall_of_unknown_integration_is_not_found() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/0/organizations/acme/integrations/github/")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "installation_id": "43",
                    "reinstall_id": "missing",
                    "installation": {"id": "1337", "name": "app", "private_key": TEST_KEY}
                })
                .to_string(),
            ))
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_install_rejects_invalid_payload() {
        let (state, _) = test_state("http://127.0.0.1:9").await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/0/organizations/acme/integrations/github/")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "installation_id": "",
                    "installation": {"id": "1337", "name": "app", "private_key": "not a key"}
                })
                .to_string(),
            ))
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"]["details"]["installation_id"].is_array());
        assert!(body["error"]["details"]["installation.private_key"].is_array());
    }
}
