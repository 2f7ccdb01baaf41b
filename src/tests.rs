//! Integration tests for the content sync backend.
//!
//! Each fixture runs the full router on a random port, so central pushes travel
//! over real HTTP to the same process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::config::{Config, LogFormat};
use crate::db::{delete_content, enqueue_in_tx, init_database, Repository};
use crate::models::{CentralQueueEntry, NewCentralEntry, OutcomeStatus, SyncPayload};
use crate::notify::{Notifier, OutboxNotifier};
use crate::sync::{HttpTransport, MediaQueue, MediaWorker, SubsiteTransport};
use crate::{create_router, AppState};

const TEST_PSK: &str = "test-api-key";

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    site_keys: HashMap<i64, String>,
    author_id: i64,
    reviewer_id: i64,
    uploads_root: PathBuf,
    worker: MediaWorker,
    state: AppState,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");
        let uploads_root = temp_dir.path().join("uploads");

        let pool = init_database(&db_path).await.expect("Failed to init DB");
        let repo = Arc::new(Repository::new(pool));

        // Bind first so pushes can target our own address
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        let config = Arc::new(Config {
            api_psk: Some(TEST_PSK.to_string()),
            db_path,
            uploads_root: uploads_root.clone(),
            bind_addr: addr,
            base_url: base_url.clone(),
            central_site_id: 1,
            push_timeout: Duration::from_secs(5),
            bulk_batch_size: 2,
            media_poll_interval: Duration::from_millis(50),
            notify_emails: vec![],
            log_level: "warn".to_string(),
            log_format: LogFormat::Text,
        });

        let transport: Arc<dyn SubsiteTransport> =
            Arc::new(HttpTransport::new(repo.clone(), config.clone()).expect("transport"));
        let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(repo.clone()));

        // The worker is driven by hand so tests control when media lands
        let media = MediaQueue::new(repo.clone());
        let worker = media.worker(config.clone());

        let state = AppState::new(repo, config, transport, notifier, media);
        let app = create_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-api-key", TEST_PSK.parse().unwrap());
        let client = Client::builder().default_headers(headers).build().unwrap();

        let mut fixture = TestFixture {
            client,
            base_url,
            site_keys: HashMap::new(),
            author_id: 0,
            reviewer_id: 0,
            uploads_root,
            worker,
            state,
            _temp_dir: temp_dir,
        };
        fixture.seed_network().await;
        fixture
    }

    /// Main site 1 plus subsites 5 and 7, an author and a reviewer.
    async fn seed_network(&mut self) {
        for (id, name, admin) in [
            (1, "Main", "main-admin@example.com"),
            (5, "Five", "five-admin@example.com"),
            (7, "Seven", "seven-admin@example.com"),
        ] {
            let (status, body) = self
                .post(
                    "/api/sites",
                    json!({ "id": id, "name": name, "adminEmail": admin }),
                )
                .await;
            assert_eq!(status, 200, "register site {}: {}", id, body);
            let key = body["data"]["apiKey"].as_str().unwrap().to_string();
            self.site_keys.insert(id, key);
        }

        let (_, author) = self
            .post(
                "/api/users",
                json!({
                    "login": "alice",
                    "email": "alice@example.com",
                    "displayName": "Alice",
                    "sites": [1]
                }),
            )
            .await;
        self.author_id = author["data"]["id"].as_i64().unwrap();

        let (_, reviewer) = self
            .post(
                "/api/users",
                json!({
                    "login": "bob",
                    "email": "bob@example.com",
                    "displayName": "Bob",
                    "sites": [5, 7]
                }),
            )
            .await;
        self.reviewer_id = reviewer["data"]["id"].as_i64().unwrap();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read(resp: reqwest::Response) -> (u16, Value) {
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        Self::read(self.client.get(self.url(path)).send().await.unwrap()).await
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        Self::read(
            self.client
                .post(self.url(path))
                .json(&body)
                .send()
                .await
                .unwrap(),
        )
        .await
    }

    async fn put(&self, path: &str, body: Value) -> (u16, Value) {
        Self::read(
            self.client
                .put(self.url(path))
                .json(&body)
                .send()
                .await
                .unwrap(),
        )
        .await
    }

    async fn delete(&self, path: &str) -> (u16, Value) {
        Self::read(self.client.delete(self.url(path)).send().await.unwrap()).await
    }

    /// Call a replication endpoint with a site's key instead of the admin key.
    async fn ingress(&self, site_id: i64, key_site: i64, endpoint: &str, body: Value) -> (u16, Value) {
        let resp = Client::new()
            .post(self.url(&format!("/sites/{}/ccm/v1/{}", site_id, endpoint)))
            .header("x-api-key", &self.site_keys[&key_site])
            .json(&body)
            .send()
            .await
            .unwrap();
        Self::read(resp).await
    }

    async fn set_policy(&self, site_id: i64, policy: Value) {
        let (status, body) = self
            .put(&format!("/api/sites/{}/policy", site_id), policy)
            .await;
        assert_eq!(status, 200, "policy update failed: {}", body);
    }

    /// Create central content and return the `data` of the save result.
    async fn create_content(&self, mut body: Value) -> Value {
        body["authorId"] = json!(self.author_id);
        let (status, resp) = self.post("/api/content", body).await;
        assert_eq!(status, 200, "create failed: {}", resp);
        resp["data"].clone()
    }

    async fn site_content(&self, site_id: i64) -> Vec<Value> {
        let (status, body) = self.get(&format!("/api/sites/{}/content", site_id)).await;
        assert_eq!(status, 200);
        body["data"].as_array().cloned().unwrap_or_default()
    }

    async fn content_detail(&self, site_id: i64, id: i64) -> (u16, Value) {
        self.get(&format!("/api/sites/{}/content/{}", site_id, id))
            .await
    }

    async fn queue_rows(&self, site_id: i64, status: &str) -> Vec<Value> {
        let (code, body) = self
            .get(&format!("/api/sites/{}/queue?status={}", site_id, status))
            .await;
        assert_eq!(code, 200, "queue list failed: {}", body);
        body["data"].as_array().cloned().unwrap_or_default()
    }

    async fn synced(&self, content_id: i64) -> Vec<Value> {
        let (_, body) = self.get(&format!("/api/content/{}/synced", content_id)).await;
        body["data"].as_array().cloned().unwrap_or_default()
    }

    async fn logs(&self, content_id: i64) -> Vec<Value> {
        let (_, body) = self.get(&format!("/api/logs?contentId={}", content_id)).await;
        body["data"].as_array().cloned().unwrap_or_default()
    }

    /// The push central would send for a queued entry.
    fn queued_payload(&self, entry: &CentralQueueEntry) -> SyncPayload {
        SyncPayload {
            central_entry_id: Some(entry.id),
            central_content_id: entry.content_id,
            content_type: entry.content_type.clone(),
            sync_kind: entry.sync_kind,
            disable_sync: false,
            source_site_id: 1,
            source_url: self.state.config.site_url(1),
            snapshot: entry.snapshot.clone(),
        }
    }

    async fn live_entry(&self, content_id: i64) -> CentralQueueEntry {
        self.state
            .repo
            .latest_live_entry(content_id)
            .await
            .unwrap()
            .expect("live central entry")
    }
}

fn outcome_for(report: &Value, site_id: i64) -> Value {
    report["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["siteId"] == site_id)
        .cloned()
        .unwrap_or(Value::Null)
}

fn meta_value(detail: &Value, key: &str) -> Value {
    detail["meta"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["key"] == key)
        .map(|m| m["value"].clone())
        .unwrap_or(Value::Null)
}

// ==================== HEALTH & AUTH ====================

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_admin_api_requires_psk() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/api/sites"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let resp = Client::new()
        .get(fixture.url("/api/sites"))
        .header("x-api-key", "wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let (status, body) = fixture.get("/api/sites").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_ingress_checks_site_key_before_body() {
    let fixture = TestFixture::new().await;

    // Another site's key is refused even with a malformed body
    let resp = Client::new()
        .post(fixture.url("/sites/5/ccm/v1/sync-post"))
        .header("x-api-key", &fixture.site_keys[&7])
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // The admin key does not open replication endpoints
    let resp = fixture
        .client
        .post(fixture.url("/sites/5/ccm/v1/trash-post"))
        .json(&json!({ "subsitePostId": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Unknown site
    let (status, _) = fixture
        .ingress(99, 5, "trash-post", json!({ "subsitePostId": 1 }))
        .await;
    assert_eq!(status, 401);

    // Bearer form is accepted
    let resp = Client::new()
        .post(fixture.url("/sites/5/ccm/v1/trash-post"))
        .bearer_auth(&fixture.site_keys[&5])
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["success"], false);
    assert_eq!(body["data"]["message"], "Post ID is missing.");
}

#[tokio::test]
async fn test_register_site_rejects_duplicate_id() {
    let fixture = TestFixture::new().await;

    let (status, body) = fixture
        .post("/api/sites", json!({ "id": 5, "name": "Again" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

// ==================== REPLICATION ====================

#[tokio::test]
async fn test_save_replicates_to_selected_sites() {
    let fixture = TestFixture::new().await;

    let data = fixture
        .create_content(json!({
            "title": "Hello",
            "body": "<p>First paragraph</p>",
            "terms": { "category": [{ "name": "News" }] },
            "meta": { "subtitle": "Greeting" },
            "targetSites": [5, 7]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let report = &data["sync"];
    assert!(report["entryId"].is_i64());

    for site in [5, 7] {
        let outcome = outcome_for(report, site);
        assert_eq!(outcome["success"], true, "site {}: {}", site, outcome);
        assert_eq!(outcome["status"], "synced");
        assert_eq!(outcome["message"], "Post successfully created on the subsite.");

        let local_id = outcome["localContentId"].as_i64().unwrap();
        let (status, detail) = fixture.content_detail(site, local_id).await;
        assert_eq!(status, 200);
        let detail = &detail["data"];
        assert_eq!(detail["content"]["title"], "Hello");
        assert_eq!(detail["content"]["status"], "publish");
        assert_eq!(meta_value(detail, "_central_post_id"), json!(central_id));
        assert_eq!(meta_value(detail, "subtitle"), json!("Greeting"));
        assert_eq!(detail["terms"]["category"][0]["name"], "News");
    }

    let logs = fixture.logs(central_id).await;
    assert_eq!(logs.len(), 1);
    let lines = logs[0]["siteOutcomes"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|l| l["status"] == "Synced"));

    let synced = fixture.synced(central_id).await;
    assert_eq!(synced.len(), 2);
    assert_eq!(synced[0]["siteId"], 5);
    assert_eq!(synced[1]["siteId"], 7);

    // Rows for each subsite record the applied state
    assert_eq!(fixture.queue_rows(5, "synced").await.len(), 1);
}

#[tokio::test]
async fn test_update_reuses_local_object() {
    let fixture = TestFixture::new().await;

    let data = fixture
        .create_content(json!({
            "title": "Hello",
            "terms": { "category": [{ "name": "News" }] },
            "targetSites": [5]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    let (status, updated) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({
                "title": "Hello again",
                "terms": { "category": [{ "name": "Updates" }] },
                "targetSites": [5]
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", updated);
    let outcome = outcome_for(&updated["data"]["sync"], 5);
    assert_eq!(outcome["message"], "Post successfully updated on the subsite.");
    assert_eq!(outcome["localContentId"], local_id);

    assert_eq!(fixture.site_content(5).await.len(), 1);
    let (_, detail) = fixture.content_detail(5, local_id).await;
    assert_eq!(detail["data"]["content"]["title"], "Hello again");
    let categories = detail["data"]["terms"]["category"].as_array().unwrap();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0]["name"], "Updates");
}

#[tokio::test]
async fn test_primary_category_maps_to_local_term() {
    let fixture = TestFixture::new().await;

    let terms = json!({ "category": [{ "name": "News" }, { "name": "Sports" }] });
    let data = fixture
        .create_content(json!({ "title": "Match report", "terms": terms, "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    let term_id = |detail: &Value, slug: &str| {
        detail["data"]["terms"]["category"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["slug"] == slug)
            .map(|t| t["id"].as_i64().unwrap())
            .unwrap()
    };
    let (_, central) = fixture.content_detail(1, central_id).await;
    let central_sports = term_id(&central, "sports");

    let (status, body) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({
                "title": "Match report",
                "terms": terms,
                "meta": { "_yoast_wpseo_primary_category": central_sports.to_string() },
                "targetSites": [5]
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);

    let (_, local) = fixture.content_detail(5, local_id).await;
    let local_sports = term_id(&local, "sports");
    assert_ne!(local_sports, central_sports);
    assert_eq!(
        meta_value(&local["data"], "_yoast_wpseo_primary_category"),
        json!(local_sports)
    );
    assert_eq!(
        meta_value(&local["data"], "_yoast_wpseo_primary_category_slug"),
        Value::Null
    );
}

#[tokio::test]
async fn test_disabled_sync_skips_every_site() {
    let fixture = TestFixture::new().await;

    let data = fixture
        .create_content(json!({
            "title": "Private notes",
            "disableSync": true,
            "targetSites": [5, 7]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();

    for site in [5, 7] {
        let outcome = outcome_for(&data["sync"], site);
        assert_eq!(outcome["status"], "skipped");
        assert_eq!(
            outcome["message"],
            "The sync setting for this post is disabled, so it will not be synchronized."
        );
        assert!(fixture.site_content(site).await.is_empty());
    }

    let (_, queue) = fixture
        .get(&format!("/api/queue?contentId={}", central_id))
        .await;
    assert!(queue["data"].as_array().unwrap().is_empty());

    let logs = fixture.logs(central_id).await;
    assert!(logs[0]["siteOutcomes"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["status"] == "Skipped"));
}

#[tokio::test]
async fn test_unsyncable_status_does_not_replicate() {
    let fixture = TestFixture::new().await;

    let data = fixture
        .create_content(json!({
            "title": "Work in progress",
            "status": "pending",
            "targetSites": [5]
        }))
        .await;
    assert!(data.get("sync").is_none());
    assert!(fixture.site_content(5).await.is_empty());
}

#[tokio::test]
async fn test_direct_mode_pushes_without_queue() {
    let fixture = TestFixture::new().await;
    fixture
        .set_policy(1, json!({ "contentQueueEnabled": false }))
        .await;

    let data = fixture
        .create_content(json!({ "title": "Direct", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();

    assert!(data["sync"]["entryId"].is_null());
    assert_eq!(outcome_for(&data["sync"], 5)["status"], "synced");

    let (_, queue) = fixture
        .get(&format!("/api/queue?contentId={}", central_id))
        .await;
    assert!(queue["data"].as_array().unwrap().is_empty());
    assert!(fixture.queue_rows(5, "all").await.is_empty());
    assert_eq!(fixture.site_content(5).await.len(), 1);
}

#[tokio::test]
async fn test_targets_must_be_registered_subsites() {
    let fixture = TestFixture::new().await;

    let (status, body) = fixture
        .post(
            "/api/content",
            json!({ "title": "Nowhere", "targetSites": [42] }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = fixture
        .post("/api/content", json!({ "title": "Self", "targetSites": [1] }))
        .await;
    assert_eq!(status, 400);
}

// ==================== APPROVAL ====================

#[tokio::test]
async fn test_newer_save_supersedes_pending_row() {
    let fixture = TestFixture::new().await;
    fixture
        .set_policy(5, json!({ "approvalRequired": true }))
        .await;

    let data = fixture
        .create_content(json!({ "title": "Draft one", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let outcome = outcome_for(&data["sync"], 5);
    assert_eq!(outcome["status"], "queued-for-approval");
    assert_eq!(outcome["success"], true);
    assert!(fixture.site_content(5).await.is_empty());

    let first_row = fixture.queue_rows(5, "pending").await[0]["id"]
        .as_i64()
        .unwrap();

    let (status, _) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({ "title": "Draft two", "targetSites": [5] }),
        )
        .await;
    assert_eq!(status, 200);

    let pending = fixture.queue_rows(5, "pending").await;
    assert_eq!(pending.len(), 1);
    let second_row = pending[0]["id"].as_i64().unwrap();
    assert_ne!(first_row, second_row);
    let expired = fixture.queue_rows(5, "expired").await;
    assert_eq!(expired[0]["id"], first_row);

    // The superseded row can no longer be applied
    let (status, body) = fixture
        .post(
            &format!("/api/sites/5/queue/{}/approve", first_row),
            json!({ "reviewerId": fixture.reviewer_id }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "INVALID_STATE");
    assert_eq!(body["error"]["details"]["currentStatus"], "expired");

    let (status, body) = fixture
        .post(
            &format!("/api/sites/5/queue/{}/approve", second_row),
            json!({ "reviewerId": fixture.reviewer_id }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["row"]["status"], "approved-applied");
    assert_eq!(body["data"]["row"]["approvedBy"], fixture.reviewer_id);
    assert_eq!(body["data"]["message"], "Post successfully created on the subsite.");

    let local = fixture.site_content(5).await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0]["title"], "Draft two");

    // Approval is reported back to central
    let synced = fixture.synced(central_id).await;
    assert_eq!(synced[0]["status"], "approved");
    assert_eq!(synced[0]["localContentId"], local[0]["id"]);

    let (status, body) = fixture
        .post(
            &format!("/api/sites/5/queue/{}/approve", second_row),
            json!({ "reviewerId": fixture.reviewer_id }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["details"]["currentStatus"], "approved-applied");

    let logs = fixture.logs(central_id).await;
    assert!(logs
        .iter()
        .any(|l| l["siteOutcomes"][0]["status"] == "Approved"));
}

#[tokio::test]
async fn test_older_push_stalled_on_write_lock_is_discarded() {
    let fixture = TestFixture::new().await;

    let data = fixture
        .create_content(json!({ "title": "First", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    // Queue an "Old" change on site 5 without applying it
    fixture
        .set_policy(5, json!({ "approvalRequired": true }))
        .await;
    let (status, _) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({ "title": "Old", "targetSites": [5] }),
        )
        .await;
    assert_eq!(status, 200);
    fixture
        .set_policy(5, json!({ "approvalRequired": false }))
        .await;
    let old_entry = fixture.live_entry(central_id).await;
    let old_payload = fixture.queued_payload(&old_entry);

    // The old push passes its checks, then waits on the held writer lock
    let repo = fixture.state.repo.clone();
    let mut conn = repo.begin_immediate().await.unwrap();
    let apply = fixture.state.apply.clone();
    let stalled = tokio::spawn(async move { apply.receive(5, &old_payload).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut newer = NewCentralEntry {
        content_id: central_id,
        content_type: old_entry.content_type.clone(),
        target_sites: vec![5],
        sync_kind: old_entry.sync_kind,
        snapshot: old_entry.snapshot.clone(),
        compare_snapshot: old_entry.compare_snapshot.clone(),
        author_id: old_entry.author_id,
    };
    newer.snapshot.title = "New".to_string();
    let result = enqueue_in_tx(&mut conn, &newer).await;
    let enqueued = Repository::finish(&mut conn, result).await.unwrap();
    drop(conn);

    let outcome = stalled.await.unwrap().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Superseded);
    let (_, detail) = fixture.content_detail(5, local_id).await;
    assert_eq!(detail["data"]["content"]["title"], "First");

    // The newer entry still lands
    let newest = fixture.live_entry(central_id).await;
    assert_eq!(newest.id, enqueued.entry_id);
    let (status, body) = fixture
        .ingress(5, 5, "sync-post", serde_json::to_value(fixture.queued_payload(&newest)).unwrap())
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["status"], "synced");

    let (_, detail) = fixture.content_detail(5, local_id).await;
    assert_eq!(detail["data"]["content"]["title"], "New");
    assert_eq!(fixture.queue_rows(5, "synced").await.len(), 2);
    assert_eq!(fixture.queue_rows(5, "pending").await.len(), 0);
    assert_eq!(fixture.queue_rows(5, "expired").await.len(), 1);
}

#[tokio::test]
async fn test_delete_row_for_missing_replica_fails_row() {
    let fixture = TestFixture::new().await;
    fixture.set_policy(1, json!({ "deleteOnSubsite": true })).await;
    fixture.set_policy(5, json!({ "deleteOnSubsite": true })).await;

    let data = fixture
        .create_content(json!({ "title": "Short lived", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    // Hold the delete row for review, then drop the replica behind its back
    fixture
        .set_policy(5, json!({ "approvalRequired": true }))
        .await;
    let (status, body) = fixture
        .post(&format!("/api/content/{}/trash", central_id), json!({}))
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(outcome_for(&body["data"], 5)["status"], "queued-for-approval");
    let row_id = fixture.queue_rows(5, "pending").await[0]["id"]
        .as_i64()
        .unwrap();

    let mut conn = fixture.state.repo.pool().acquire().await.unwrap();
    assert!(delete_content(&mut conn, local_id).await.unwrap());
    drop(conn);

    fixture
        .set_policy(5, json!({ "approvalRequired": false }))
        .await;
    let entry = fixture.live_entry(central_id).await;
    let (status, body) = fixture
        .ingress(5, 5, "sync-post", serde_json::to_value(fixture.queued_payload(&entry)).unwrap())
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["success"], false);
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["message"], "Error applying content on subsite.");

    let failed = fixture.queue_rows(5, "failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["id"], row_id);
}

#[tokio::test]
async fn test_reject_requires_reason_and_notifies() {
    let fixture = TestFixture::new().await;
    fixture
        .set_policy(5, json!({ "approvalRequired": true }))
        .await;

    let data = fixture
        .create_content(json!({ "title": "Needs review", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let row = fixture.queue_rows(5, "pending").await[0]["id"]
        .as_i64()
        .unwrap();
    let reject_path = format!("/api/sites/5/queue/{}/reject", row);

    let (status, _) = fixture
        .post(
            &reject_path,
            json!({ "reviewerId": fixture.reviewer_id, "reason": "  " }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = fixture
        .post(
            &reject_path,
            json!({ "reviewerId": fixture.reviewer_id, "reason": "Needs sources" }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["row"]["status"], "rejected");
    assert_eq!(body["data"]["row"]["rejectReason"], "Needs sources");
    assert!(fixture.site_content(5).await.is_empty());

    let (_, notifications) = fixture.get("/api/notifications").await;
    let notifications = notifications["data"].as_array().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["subject"], "Five - CCM - Change Rejected");
    let recipients = notifications[0]["recipients"].as_array().unwrap();
    assert!(recipients.contains(&json!("alice@example.com")));
    assert!(recipients.contains(&json!("five-admin@example.com")));

    let logs = fixture.logs(central_id).await;
    let rejection = logs
        .iter()
        .find(|l| l["siteOutcomes"][0]["status"] == "Rejected")
        .expect("rejection logged");
    assert!(rejection["siteOutcomes"][0]["note"]
        .as_str()
        .unwrap()
        .contains("rejected at subsite by Bob with message: Needs sources"));

    assert_eq!(fixture.synced(central_id).await[0]["status"], "rejected");

    let (status, body) = fixture
        .post(
            &reject_path,
            json!({ "reviewerId": fixture.reviewer_id, "reason": "Again" }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["details"]["currentStatus"], "rejected");
}

#[tokio::test]
async fn test_preview_shows_changed_fields() {
    let fixture = TestFixture::new().await;
    fixture
        .set_policy(5, json!({ "approvalRequired": true }))
        .await;

    let data = fixture
        .create_content(json!({
            "title": "Hello",
            "body": "<p>Unchanged body</p>",
            "targetSites": [5]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();

    // Nothing exists locally yet, so every field is new
    let first_row = fixture.queue_rows(5, "pending").await[0]["id"]
        .as_i64()
        .unwrap();
    let (status, preview) = fixture
        .get(&format!("/api/sites/5/queue/{}/preview", first_row))
        .await;
    assert_eq!(status, 200, "{}", preview);
    let blocks = preview["data"]["blocks"].as_array().unwrap();
    let title = blocks.iter().find(|b| b["field"] == "title").unwrap();
    assert!(title["lines"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["tag"] == "insert"));

    let (status, _) = fixture
        .post(
            &format!("/api/sites/5/queue/{}/approve", first_row),
            json!({ "reviewerId": fixture.reviewer_id }),
        )
        .await;
    assert_eq!(status, 200);

    fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({
                "title": "Hello again",
                "body": "<p>Unchanged body</p>",
                "targetSites": [5]
            }),
        )
        .await;
    let second_row = fixture.queue_rows(5, "pending").await[0]["id"]
        .as_i64()
        .unwrap();

    let (_, preview) = fixture
        .get(&format!("/api/sites/5/queue/{}/preview", second_row))
        .await;
    let blocks = preview["data"]["blocks"].as_array().unwrap();
    assert!(blocks.iter().all(|b| b["field"] != "content"));
    let title = blocks.iter().find(|b| b["field"] == "title").unwrap();
    let lines = title["lines"].as_array().unwrap();
    assert!(lines
        .iter()
        .any(|l| l["tag"] == "delete" && l["text"] == "Hello"));
    assert!(lines
        .iter()
        .any(|l| l["tag"] == "insert" && l["text"] == "Hello again"));
}

// ==================== TRASH & DELETE ====================

#[tokio::test]
async fn test_trash_follows_each_subsite_policy() {
    let fixture = TestFixture::new().await;
    fixture.set_policy(1, json!({ "deleteOnSubsite": true })).await;
    fixture.set_policy(5, json!({ "deleteOnSubsite": true })).await;

    let data = fixture
        .create_content(json!({ "title": "Short lived", "targetSites": [5, 7] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_5 = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();
    let local_7 = outcome_for(&data["sync"], 7)["localContentId"]
        .as_i64()
        .unwrap();

    let (status, body) = fixture
        .post(&format!("/api/content/{}/trash", central_id), json!({}))
        .await;
    assert_eq!(status, 200, "{}", body);

    let five = outcome_for(&body["data"], 5);
    assert_eq!(five["status"], "deleted");
    assert_eq!(five["success"], true);
    let seven = outcome_for(&body["data"], 7);
    assert_eq!(seven["status"], "policy-denied");
    assert_eq!(seven["message"], "Delete action is not allowed on this subsite.");

    let (_, detail) = fixture.content_detail(5, local_5).await;
    assert_eq!(detail["data"]["content"]["status"], "trash");
    let (_, detail) = fixture.content_detail(7, local_7).await;
    assert_eq!(detail["data"]["content"]["status"], "publish");
}

#[tokio::test]
async fn test_trash_skips_sites_without_replica() {
    let fixture = TestFixture::new().await;
    fixture.set_policy(1, json!({ "deleteOnSubsite": true })).await;
    fixture.set_policy(5, json!({ "deleteOnSubsite": true })).await;

    let data = fixture
        .create_content(json!({ "title": "Only five", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();

    // Widen the selection without replicating
    let (status, updated) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({ "title": "Only five", "status": "pending", "targetSites": [5, 7] }),
        )
        .await;
    assert_eq!(status, 200);
    assert!(updated["data"].get("sync").is_none());

    let (status, body) = fixture
        .post(&format!("/api/content/{}/trash", central_id), json!({}))
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["skippedSites"], json!([7]));
    let outcomes = body["data"]["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["status"], "deleted");
    assert!(fixture.queue_rows(7, "all").await.is_empty());
}

#[tokio::test]
async fn test_untrash_and_delete_propagate() {
    let fixture = TestFixture::new().await;
    fixture.set_policy(1, json!({ "deleteOnSubsite": true })).await;
    fixture.set_policy(5, json!({ "deleteOnSubsite": true })).await;

    let data = fixture
        .create_content(json!({ "title": "Round trip", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    // Untrash only applies to trashed content
    let (status, _) = fixture
        .post(&format!("/api/content/{}/untrash", central_id), json!({}))
        .await;
    assert_eq!(status, 409);

    fixture
        .post(&format!("/api/content/{}/trash", central_id), json!({}))
        .await;

    let (status, body) = fixture
        .post(&format!("/api/content/{}/untrash", central_id), json!({}))
        .await;
    assert_eq!(status, 200, "{}", body);
    let outcome = outcome_for(&body["data"], 5);
    assert_eq!(outcome["status"], "untrashed");
    assert_eq!(outcome["message"], "Post successfully restored on subsite.");

    let (_, detail) = fixture.content_detail(5, local_id).await;
    assert_eq!(detail["data"]["content"]["status"], "publish");
    let (_, central) = fixture.content_detail(1, central_id).await;
    assert_eq!(central["data"]["content"]["status"], "publish");

    let (status, body) = fixture
        .delete(&format!("/api/content/{}", central_id))
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(outcome_for(&body["data"], 5)["status"], "deleted");

    let (status, _) = fixture.content_detail(5, local_id).await;
    assert_eq!(status, 404);
    let (status, _) = fixture.content_detail(1, central_id).await;
    assert_eq!(status, 404);
}

// ==================== BULK ====================

#[tokio::test]
async fn test_bulk_sync_runs_in_batches() {
    let fixture = TestFixture::new().await;

    let mut selection = Vec::new();
    for title in ["One", "Two", "Three"] {
        let data = fixture.create_content(json!({ "title": title })).await;
        assert!(data.get("sync").is_none());
        selection.push(data["content"]["id"].as_i64().unwrap());
    }

    let (status, body) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": selection, "targetSites": [5, 7], "batchIndex": 0 }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    let report = &body["data"];
    assert_eq!(report["currentBatch"], 1);
    assert_eq!(report["totalBatches"], 2);
    assert_eq!(report["postsProcessed"], 2);
    assert_eq!(report["totalPosts"], 3);
    assert_eq!(report["done"], false);
    let lines = report["logs"].as_array().unwrap();
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|l| l["status"] == "Bulk Synced"));

    let (_, body) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": selection, "targetSites": [5, 7], "batchIndex": 1 }),
        )
        .await;
    assert_eq!(body["data"]["postsProcessed"], 3);
    assert_eq!(body["data"]["done"], true);
    assert_eq!(body["data"]["logs"].as_array().unwrap().len(), 2);

    assert_eq!(fixture.site_content(5).await.len(), 3);
    assert_eq!(fixture.site_content(7).await.len(), 3);

    let (status, _) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": selection, "targetSites": [5, 7], "batchIndex": 2 }),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_bulk_sync_validates_selection() {
    let fixture = TestFixture::new().await;
    let data = fixture
        .create_content(json!({ "title": "Hidden", "disableSync": true }))
        .await;
    let id = data["content"]["id"].as_i64().unwrap();

    let (status, body) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": [id], "targetSites": [], "batchIndex": 0 }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(
        body["error"]["message"],
        "Please select at least one site to sync."
    );

    let (status, _) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": [], "targetSites": [5], "batchIndex": 0 }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = fixture
        .post(
            "/api/bulk-sync",
            json!({ "selection": [id, 9999], "targetSites": [5], "batchIndex": 0 }),
        )
        .await;
    assert_eq!(status, 200);
    let lines = body["data"]["logs"].as_array().unwrap();
    assert_eq!(lines[0]["status"], "Skipped");
    assert_eq!(lines[1]["status"], "Failed");
    assert_eq!(lines[1]["message"], "Post not found!");
    assert!(fixture.site_content(5).await.is_empty());
}

// ==================== OUTCOME REPORTS ====================

#[tokio::test]
async fn test_report_outcome_is_idempotent() {
    let fixture = TestFixture::new().await;
    let data = fixture
        .create_content(json!({ "title": "Reported", "targetSites": [5] }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();

    let report = json!({
        "centralContentId": central_id,
        "subsiteId": 5,
        "outcome": {
            "siteId": 5,
            "success": true,
            "status": "approved",
            "message": "Approved by reviewer",
            "localContentId": 42,
            "syncedAt": "2026-01-01T00:00:00Z"
        }
    });

    for _ in 0..2 {
        let (status, body) = fixture
            .ingress(1, 1, "update-synced-data", report.clone())
            .await;
        assert_eq!(status, 200, "{}", body);
    }
    let synced = fixture.synced(central_id).await;
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0]["status"], "approved");
    assert_eq!(synced[0]["localContentId"], 42);

    // Only central accepts reports
    let (status, _) = fixture
        .ingress(5, 5, "update-synced-data", report.clone())
        .await;
    assert_eq!(status, 404);

    let mut mismatched = report.clone();
    mismatched["subsiteId"] = json!(7);
    let (status, _) = fixture.ingress(1, 1, "update-synced-data", mismatched).await;
    assert_eq!(status, 400);

    let mut unknown = report;
    unknown["centralContentId"] = json!(9999);
    let (status, _) = fixture.ingress(1, 1, "update-synced-data", unknown).await;
    assert_eq!(status, 404);
}

// ==================== MEDIA ====================

async fn register_photo(fixture: &TestFixture) -> (i64, String) {
    let dir = fixture.uploads_root.join("2024/05");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("photo.jpg"), b"jpeg-bytes")
        .await
        .unwrap();

    let (status, body) = fixture
        .post(
            "/api/sites/1/attachments",
            json!({ "filePath": "2024/05/photo.jpg" }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    (
        body["data"]["id"].as_i64().unwrap(),
        body["data"]["url"].as_str().unwrap().to_string(),
    )
}

fn image_block(id: i64, url: &str) -> String {
    format!(
        r#"<!-- wp:image {{"id":{id},"sizeSlug":"large"}} --><figure class="wp-block-image size-large"><img src="{url}?ver=1" alt="Photo" class="wp-image-{id}"/></figure><!-- /wp:image -->"#,
        id = id,
        url = url
    )
}

async fn attachments(fixture: &TestFixture, site_id: i64) -> Vec<Value> {
    let (_, body) = fixture
        .get(&format!("/api/sites/{}/attachments", site_id))
        .await;
    body["data"].as_array().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_media_is_reconciled_after_apply() {
    let fixture = TestFixture::new().await;
    let (central_att, central_url) = register_photo(&fixture).await;
    assert_eq!(central_url, format!("{}/uploads/2024/05/photo.jpg", fixture.base_url));

    let data = fixture
        .create_content(json!({
            "title": "With photo",
            "body": image_block(central_att, &central_url),
            "featuredImageId": central_att,
            "targetSites": [5]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    let (_, jobs) = fixture.get("/api/sites/5/media-jobs").await;
    assert_eq!(jobs["data"][0]["status"], "pending");

    assert_eq!(fixture.worker.drain().await.unwrap(), 1);

    let local_atts = attachments(&fixture, 5).await;
    assert_eq!(local_atts.len(), 1);
    assert_eq!(local_atts[0]["centralAttachmentId"], central_att);
    let local_att = local_atts[0]["id"].as_i64().unwrap();
    let local_url = format!("{}/uploads/sites/5/2024/05/photo.jpg", fixture.base_url);
    assert_eq!(local_atts[0]["url"], local_url);
    assert!(fixture
        .uploads_root
        .join("sites/5/2024/05/photo.jpg")
        .exists());

    let (_, detail) = fixture.content_detail(5, local_id).await;
    let detail = &detail["data"];
    let body = detail["content"]["body"].as_str().unwrap();
    assert!(body.contains(&format!("{}?ver=1", local_url)), "{}", body);
    assert!(body.contains(&format!("wp-image-{}", local_att)));
    assert!(!body.contains(&central_url));
    assert_eq!(detail["featuredImage"]["id"], local_att);

    let (_, jobs) = fixture.get("/api/sites/5/media-jobs").await;
    assert_eq!(jobs["data"][0]["status"], "done");

    // A second sync reuses the cross-referenced attachment
    let (status, _) = fixture
        .post(
            &format!("/api/content/{}/sync", central_id),
            json!({ "targetSites": [5] }),
        )
        .await;
    assert_eq!(status, 200);
    fixture.worker.drain().await.unwrap();
    assert_eq!(attachments(&fixture, 5).await.len(), 1);
}

#[tokio::test]
async fn test_relational_fields_map_to_subsite_ids() {
    let fixture = TestFixture::new().await;
    let (central_att, _) = register_photo(&fixture).await;

    let linked = fixture
        .create_content(json!({ "title": "Linked", "targetSites": [5] }))
        .await;
    let linked_central = linked["content"]["id"].as_i64().unwrap();
    let linked_local = outcome_for(&linked["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();

    // The photo reaches site 5 through the featured image first
    let data = fixture
        .create_content(json!({
            "title": "Hero",
            "featuredImageId": central_att,
            "targetSites": [5]
        }))
        .await;
    let central_id = data["content"]["id"].as_i64().unwrap();
    let local_id = outcome_for(&data["sync"], 5)["localContentId"]
        .as_i64()
        .unwrap();
    fixture.worker.drain().await.unwrap();
    let local_att = attachments(&fixture, 5).await[0]["id"].as_i64().unwrap();
    assert_ne!(local_att, central_att);

    let (status, body) = fixture
        .put(
            &format!("/api/content/{}", central_id),
            json!({
                "title": "Hero",
                "featuredImageId": central_att,
                "targetSites": [5],
                "relational": {
                    "owner": { "kind": "user", "value": fixture.reviewer_id },
                    "related": { "kind": "post_object", "value": linked_central },
                    "hero": { "kind": "image", "value": central_att },
                    "orphan": { "kind": "post_object", "value": 99999 }
                }
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(outcome_for(&body["data"]["sync"], 5)["status"], "synced");

    let (_, detail) = fixture.content_detail(5, local_id).await;
    let detail = &detail["data"];
    assert_eq!(meta_value(detail, "owner"), json!(fixture.reviewer_id));
    assert_eq!(meta_value(detail, "related"), json!(linked_local));
    assert_eq!(meta_value(detail, "hero"), json!(local_att));
    assert_eq!(meta_value(detail, "orphan"), Value::Null);
}

#[tokio::test]
async fn test_concurrent_media_jobs_share_one_attachment() {
    let fixture = TestFixture::new().await;
    let (central_att, central_url) = register_photo(&fixture).await;

    let mut local_ids = Vec::new();
    for title in ["Left", "Right"] {
        let data = fixture
            .create_content(json!({
                "title": title,
                "body": image_block(central_att, &central_url),
                "targetSites": [5]
            }))
            .await;
        local_ids.push(
            outcome_for(&data["sync"], 5)["localContentId"]
                .as_i64()
                .unwrap(),
        );
    }

    let (left, right) = tokio::join!(fixture.worker.run_once(), fixture.worker.run_once());
    assert!(left.unwrap());
    assert!(right.unwrap());

    let local_atts = attachments(&fixture, 5).await;
    assert_eq!(local_atts.len(), 1);
    let marker = format!("wp-image-{}", local_atts[0]["id"]);
    for local_id in local_ids {
        let (_, detail) = fixture.content_detail(5, local_id).await;
        let body = detail["data"]["content"]["body"].as_str().unwrap();
        assert!(body.contains(&marker), "{}", body);
    }
}
