//! End-to-end proxy tests against a wiremock backend.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate_proxy::{InboundView, ProxyConfig, RewriteTarget};

use common::{TestProxy, counting_cache, make_jwt, set_cookies};

fn expired_body() -> serde_json::Value {
    json!({ "message": "Token expired" })
}

#[tokio::test]
async fn test_forwards_with_stored_access_token() -> Result<()> {
    let proxy = TestProxy::start().await?;
    let access = make_jwt("u1", 900);

    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(query_param("page", "1"))
        .and(header("authorization", format!("Bearer {}", access).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "projects": [] })))
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/projects?page=1", &access, "R1")
        .header("referer", "https://app.example/projects")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body, json!({ "projects": [] }));

    let received = proxy.backend.received_requests().await.unwrap_or_default();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("cookie").is_none());
    assert!(received[0].headers.get("referer").is_none());

    Ok(())
}

#[tokio::test]
async fn test_valid_credentials_never_refresh() -> Result<()> {
    let proxy = TestProxy::start().await?;
    let access = make_jwt("u1", 900);

    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.backend)
        .await;

    for _ in 0..3 {
        let resp = proxy.get_with_cookies("/api/me", &access, "R1").send().await?;
        assert_eq!(resp.status().as_u16(), 200);
        assert!(set_cookies(&resp).is_empty());
    }

    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_replayed() -> Result<()> {
    let proxy = TestProxy::start().await?;
    let old_access = make_jwt("old", 900);
    let new_access = make_jwt("new", 1800);

    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(header("authorization", format!("Bearer {}", old_access).as_str()))
        .respond_with(ResponseTemplate::new(401).set_body_json(expired_body()))
        .expect(1)
        .mount(&proxy.backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(header("authorization", format!("Bearer {}", new_access).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("authorization", format!("Bearer {}", old_access).as_str()))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": new_access,
            "refreshToken": "R2"
        })))
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/projects", &old_access, "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 200);
    let cookies = set_cookies(&resp);
    assert!(cookies.iter().any(|c| c.starts_with(&format!("access_token={}", new_access))));
    assert!(cookies.iter().any(|c| c.starts_with("refresh_token=R2")));
    assert!(cookies.iter().all(|c| c.contains("HttpOnly") && c.contains("Path=/")));

    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_expired_requests_share_one_refresh() -> Result<()> {
    let proxy = TestProxy::start().await?;
    let old_access = make_jwt("old", 900);
    let new_access = make_jwt("new", 1800);

    Mock::given(method("GET"))
        .and(header("authorization", format!("Bearer {}", old_access).as_str()))
        .respond_with(ResponseTemplate::new(401).set_body_json(expired_body()))
        .mount(&proxy.backend)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", format!("Bearer {}", new_access).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(6)
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": new_access, "refreshToken": "R2" }))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let requests = (0..6).map(|i| {
        proxy
            .get_with_cookies(&format!("/api/items/{}", i), &old_access, "R1")
            .send()
    });
    let responses = futures::future::join_all(requests).await;

    for resp in responses {
        let resp = resp?;
        assert_eq!(resp.status().as_u16(), 200);
        assert!(
            set_cookies(&resp)
                .iter()
                .any(|c| c.starts_with(&format!("access_token={}", new_access)))
        );
    }

    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_refresh_token_redirects_to_login() -> Result<()> {
    let proxy = TestProxy::start_with(|c| c.with_login_path("/login"), |s| s).await?;
    let access = make_jwt("u1", 900);

    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(401).set_body_json(expired_body()))
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get("/api/projects?page=2")
        .header("cookie", format!("access_token={}", access))
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 307);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "/login?login=true&redirect=%2Fapi%2Fprojects%3Fpage%3D2"
    );

    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_other_unauthorized_invalidates_cache() -> Result<()> {
    let cache = counting_cache();
    let installed = cache.clone();
    let proxy = TestProxy::start_with(|c| c, move |s| s.with_cache(installed)).await?;

    Mock::given(method("GET"))
        .and(path("/secret"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid signature" })),
        )
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/secret", &make_jwt("u1", 900), "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 401);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["message"], "Invalid signature");
    assert_eq!(cache.count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_refresh_rejection_is_surfaced() -> Result<()> {
    let cache = counting_cache();
    let installed = cache.clone();
    let proxy = TestProxy::start_with(|c| c, move |s| s.with_cache(installed)).await?;
    let access = make_jwt("u1", 900);

    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(401).set_body_json(expired_body()))
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({ "message": "Refresh token revoked" })),
        )
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/projects", &access, "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 403);
    assert!(set_cookies(&resp).is_empty());
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["message"], "Refresh token revoked");
    assert_eq!(cache.count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_refresh_timeout_is_gateway_timeout() -> Result<()> {
    let proxy =
        TestProxy::start_with(|c| c.with_timeout(Duration::from_millis(200)), |s| s).await?;

    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(401).set_body_json(expired_body()))
        .mount(&proxy.backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/projects", &make_jwt("u1", 900), "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 504);
    Ok(())
}

#[tokio::test]
async fn test_network_failure_is_internal_error() -> Result<()> {
    let backend = MockServer::start().await;
    let proxy = TestProxy::start_against(
        backend,
        |c| ProxyConfig::new("http://127.0.0.1:1").with_cookies(c.cookies.clone()),
        |s| s,
    )
    .await?;

    let resp = proxy
        .get_with_cookies("/api/projects", &make_jwt("u1", 900), "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["error"]["type"], "network_error");

    Ok(())
}

#[tokio::test]
async fn test_backend_set_cookie_is_stripped() -> Result<()> {
    let proxy = TestProxy::start().await?;

    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "backend_session=abc; Path=/")
                .insert_header("x-request-id", "r-1")
                .set_body_json(json!({ "id": 1 })),
        )
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/me", &make_jwt("u1", 900), "R1")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 200);
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "r-1");

    Ok(())
}

#[tokio::test]
async fn test_browser_authorization_is_replaced() -> Result<()> {
    let proxy = TestProxy::start().await?;

    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get("/api/me")
        .bearer_auth("forged")
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);

    let received = proxy.backend.received_requests().await.unwrap_or_default();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("authorization").is_none());

    Ok(())
}

#[tokio::test]
async fn test_trusted_forwarder_keeps_authorization() -> Result<()> {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let proxy =
        TestProxy::start_with(move |c| c.with_trusted_forwarders(vec![loopback]), |s| s).await?;

    Mock::given(method("GET"))
        .and(path("/internal"))
        .and(header("authorization", "Bearer service-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .get_with_cookies("/api/internal", &make_jwt("u1", 900), "R1")
        .bearer_auth("service-token")
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 200);
    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_json_body_is_forwarded() -> Result<()> {
    let proxy = TestProxy::start().await?;

    Mock::given(method("POST"))
        .and(path("/items"))
        .and(body_json(json!({ "name": "widget", "qty": 2 })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 9 })))
        .expect(1)
        .mount(&proxy.backend)
        .await;

    let resp = proxy
        .post("/api/items")
        .header("cookie", common::cookie_header(&make_jwt("u1", 900), "R1"))
        .json(&json!({ "name": "widget", "qty": 2 }))
        .send()
        .await?;

    assert_eq!(resp.status().as_u16(), 201);
    proxy.backend.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_rewrite_with_change_origin() -> Result<()> {
    let target = MockServer::start().await;
    let target_uri = target.uri();

    Mock::given(method("GET"))
        .and(path("/v2/users"))
        .and(query_param("id", "3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let rule = move |_: &InboundView<'_>| RewriteTarget::Rule {
        path: "https://unreachable.invalid/v2/users?id=3".to_string(),
        target: Some(target_uri.clone()),
        change_origin: true,
    };
    let proxy = TestProxy::start_with(|c| c, move |s| s.with_rewrite(Arc::new(rule))).await?;

    let resp = proxy.get("/api/anything").send().await?;
    assert_eq!(resp.status().as_u16(), 200);

    target.verify().await;
    Ok(())
}
