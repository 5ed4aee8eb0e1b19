use crate::api::events::{MessageSnapshot, Subscription};
use crate::api::models::{ConversationStatus, ConversationSummary, Message, SummaryUpdate};
use crate::error::{ReadError, ResolutionError, SubscriptionError, WriteError};
use crate::store::{ChatStore, RoleDirectory};
use crate::utils::normalize_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use url::Url;

const DEFAULT_ENDPOINT: &str = "firestore.googleapis.com";
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Consecutive failed polls before the feed reports an interruption.
const FAILURES_BEFORE_REPORT: u32 = 3;

/// Firestore REST client. Constructed once and shared by the chat store and
/// the role directory.
#[derive(Clone)]
pub struct FirestoreClient {
    http: HttpClient,
    base: Url,
    project_id: String,
    api_key: Option<String>,
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default, rename = "commitTime")]
    commit_time: Option<String>,
}

impl FirestoreClient {
    pub fn new(endpoint: Option<&str>, project_id: &str, api_key: Option<&str>) -> Result<Self, url::ParseError> {
        let base = Url::parse(&normalize_url(endpoint.unwrap_or(DEFAULT_ENDPOINT)))?;
        Ok(Self {
            http: HttpClient::new(),
            base,
            project_id: project_id.to_string(),
            api_key: api_key.map(str::to_string),
            id_token: None,
        })
    }

    /// Bearer token issued by the identity provider for the signed-in user.
    pub fn with_id_token(mut self, token: Option<String>) -> Self {
        self.id_token = token;
        self
    }

    fn database(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }

    /// Resource name of a document path such as `support_chats/uid`.
    fn document_name(&self, path: &str) -> String {
        format!("{}/documents/{}", self.database(), path.trim_matches('/'))
    }

    fn endpoint(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.base.as_str().trim_end_matches('/'), resource)
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.id_token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        if let Some(key) = &self.api_key {
            req = req.query(&[("key", key)]);
        }
        req
    }

    /// Applies a batch of writes atomically. Returns the server commit time.
    pub async fn commit(&self, writes: Vec<Value>) -> Result<Option<String>, WriteError> {
        let endpoint = self.endpoint(&format!("{}/documents:commit", self.database()));
        let req = self.with_auth(self.http.post(&endpoint)).json(&json!({ "writes": writes }));
        let resp = req
            .send()
            .await
            .map_err(|e| WriteError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(WriteError::Rejected(format!("HTTP {}: {}", status, body.trim())));
        }
        let body: WriteResponse = resp
            .json()
            .await
            .map_err(|e| WriteError::Rejected(e.to_string()))?;
        Ok(body.commit_time)
    }

    /// Runs a structured query under `parent` (empty for the database root).
    async fn run_query(&self, parent: &str, query: Value) -> Result<Vec<Document>, ReadError> {
        let resource = if parent.is_empty() {
            format!("{}/documents:runQuery", self.database())
        } else {
            format!("{}:runQuery", self.document_name(parent))
        };
        let req = self
            .with_auth(self.http.post(self.endpoint(&resource)))
            .json(&json!({ "structuredQuery": query }));
        let resp = req
            .send()
            .await
            .map_err(|e| ReadError::Unreachable(e.to_string()))?;
        check_read_status(resp.status())?;
        let rows: Vec<QueryRow> = resp
            .json()
            .await
            .map_err(|e| ReadError::Malformed(e.to_string()))?;
        Ok(rows.into_iter().filter_map(|r| r.document).collect())
    }

    /// `Ok(None)` when the document does not exist.
    async fn get_document(&self, path: &str) -> Result<Option<Document>, ReadError> {
        let req = self.with_auth(self.http.get(self.endpoint(&self.document_name(path))));
        let resp = req
            .send()
            .await
            .map_err(|e| ReadError::Unreachable(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_read_status(resp.status())?;
        let doc = resp
            .json()
            .await
            .map_err(|e| ReadError::Malformed(e.to_string()))?;
        Ok(Some(doc))
    }
}

fn check_read_status(status: StatusCode) -> Result<(), ReadError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ReadError::Rejected(format!("HTTP {}", status)))
    }
}

fn string_value(s: &str) -> Value {
    json!({ "stringValue": s })
}

fn field_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key)?.get("stringValue")?.as_str()
}

fn field_bool(fields: &Map<String, Value>, key: &str) -> Option<bool> {
    fields.get(key)?.get("booleanValue")?.as_bool()
}

fn field_timestamp(fields: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let raw = fields.get(key)?.get("timestampValue")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn decode_message(doc: &Document) -> Result<Message, ReadError> {
    let id = document_id(&doc.name).to_string();
    let missing = |field: &str| ReadError::Malformed(format!("message {id} has no {field}"));
    Ok(Message {
        text: field_str(&doc.fields, "text").ok_or_else(|| missing("text"))?.to_string(),
        sender_id: field_str(&doc.fields, "senderId")
            .ok_or_else(|| missing("senderId"))?
            .to_string(),
        timestamp: field_timestamp(&doc.fields, "timestamp").ok_or_else(|| missing("timestamp"))?,
        id,
    })
}

fn decode_summary(doc: &Document) -> ConversationSummary {
    let fields = &doc.fields;
    ConversationSummary {
        id: document_id(&doc.name).to_string(),
        user_email: field_str(fields, "userEmail").map(str::to_string),
        last_message: field_str(fields, "lastMessage").unwrap_or_default().to_string(),
        last_updated_at: field_timestamp(fields, "lastUpdatedAt"),
        status: field_str(fields, "status")
            .and_then(ConversationStatus::parse)
            .unwrap_or_default(),
        unread_by_admin: field_bool(fields, "unreadByAdmin").unwrap_or(false),
    }
}

/// Chat store over Firestore documents `{collection}/{uid}` and
/// `{collection}/{uid}/messages/{id}`.
#[derive(Clone)]
pub struct FirestoreStore {
    client: FirestoreClient,
    collection: String,
    poll_interval: Duration,
}

impl FirestoreStore {
    pub fn new(client: FirestoreClient, collection: &str, poll_interval: Duration) -> Self {
        Self {
            client,
            collection: collection.to_string(),
            poll_interval,
        }
    }

    fn conversation_path(&self, conversation_id: &str) -> String {
        format!("{}/{}", self.collection, conversation_id)
    }

    fn message_write(&self, conversation_id: &str, message_id: &str, text: &str, sender_id: &str) -> Value {
        let name = self.client.document_name(&format!(
            "{}/messages/{}",
            self.conversation_path(conversation_id),
            message_id
        ));
        json!({
            "update": {
                "name": name,
                "fields": {
                    "text": string_value(text),
                    "senderId": string_value(sender_id),
                }
            },
            "updateTransforms": [
                { "fieldPath": "timestamp", "setToServerValue": "REQUEST_TIME" }
            ],
            "currentDocument": { "exists": false }
        })
    }

    fn summary_write(&self, conversation_id: &str, update: &SummaryUpdate) -> Value {
        let mut fields = Map::new();
        if let Some(email) = &update.user_email {
            fields.insert("userEmail".into(), string_value(email));
        }
        if let Some(text) = &update.last_message {
            fields.insert("lastMessage".into(), string_value(text));
        }
        if let Some(status) = update.status {
            fields.insert("status".into(), string_value(status.as_str()));
        }
        if let Some(unread) = update.unread_by_admin {
            fields.insert("unreadByAdmin".into(), json!({ "booleanValue": unread }));
        }
        let mask: Vec<String> = fields.keys().cloned().collect();
        json!({
            "update": {
                "name": self.client.document_name(&self.conversation_path(conversation_id)),
                "fields": fields,
            },
            "updateMask": { "fieldPaths": mask },
            "updateTransforms": [
                { "fieldPath": "lastUpdatedAt", "setToServerValue": "REQUEST_TIME" }
            ]
        })
    }

    async fn fetch_messages(
        client: &FirestoreClient,
        conversation_path: &str,
    ) -> Result<Vec<Message>, ReadError> {
        let query = json!({
            "from": [{ "collectionId": "messages" }],
            "orderBy": [
                { "field": { "fieldPath": "timestamp" }, "direction": "ASCENDING" },
                { "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }
            ]
        });
        let docs = client.run_query(conversation_path, query).await?;
        docs.iter().map(decode_message).collect()
    }
}

#[async_trait]
impl ChatStore for FirestoreStore {
    // The REST surface has no push channel, so the feed polls and only
    // emits when the id list changes. Messages are immutable, so ids suffice.
    fn subscribe(&self, conversation_id: &str) -> Subscription {
        let client = self.client.clone();
        let path = self.conversation_path(conversation_id);
        let interval = self.poll_interval;
        let id = conversation_id.to_string();
        Subscription::spawn(conversation_id, move |sink| async move {
            let mut last_ids: Option<Vec<String>> = None;
            let mut failures = 0u32;
            let mut delay = interval;
            loop {
                match Self::fetch_messages(&client, &path).await {
                    Ok(messages) => {
                        failures = 0;
                        delay = interval;
                        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
                        if last_ids.as_ref() != Some(&ids) {
                            last_ids = Some(ids);
                            let snapshot = MessageSnapshot {
                                conversation_id: id.clone(),
                                messages,
                            };
                            if !sink.deliver(Ok(snapshot)).await {
                                return;
                            }
                        }
                    }
                    Err(source) => {
                        failures += 1;
                        log::warn!("poll of {path} failed ({failures}): {source}");
                        if failures == FAILURES_BEFORE_REPORT {
                            // The next good poll must emit even if nothing
                            // changed, so the consumer sees the recovery.
                            last_ids = None;
                            let err = SubscriptionError::Interrupted {
                                attempts: failures,
                                source,
                            };
                            if !sink.deliver(Err(err)).await {
                                return;
                            }
                        }
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                }
                if sink.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        })
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        text: &str,
        sender_id: &str,
    ) -> Result<String, WriteError> {
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let write = self.message_write(conversation_id, &message_id, text, sender_id);
        let commit_time = self.client.commit(vec![write]).await?;
        log::debug!(
            "message {message_id} committed to {} at {}",
            self.conversation_path(conversation_id),
            commit_time.as_deref().unwrap_or("?")
        );
        Ok(message_id)
    }

    async fn upsert_conversation_summary(
        &self,
        conversation_id: &str,
        update: &SummaryUpdate,
    ) -> Result<(), WriteError> {
        let write = self.summary_write(conversation_id, update);
        self.client.commit(vec![write]).await?;
        Ok(())
    }

    async fn conversation_summary(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, ReadError> {
        let doc = self
            .client
            .get_document(&self.conversation_path(conversation_id))
            .await?;
        Ok(doc.as_ref().map(decode_summary))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ReadError> {
        let collection = &self.collection;
        let query = json!({
            "from": [{ "collectionId": collection }],
            "orderBy": [
                { "field": { "fieldPath": "lastUpdatedAt" }, "direction": "DESCENDING" }
            ]
        });
        let docs = self.client.run_query("", query).await?;
        Ok(docs.iter().map(decode_summary).collect())
    }
}

#[async_trait]
impl RoleDirectory for FirestoreStore {
    async fn role_of(&self, uid: &str) -> Result<Option<String>, ResolutionError> {
        let doc = self.client.get_document(&format!("users/{}", uid)).await?;
        Ok(doc.and_then(|d| field_str(&d.fields, "role").map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::Identity;
    use crate::conversation::ConversationMachine;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DB: &str = "/v1/projects/p1/databases/(default)/documents";

    fn store() -> FirestoreStore {
        let client = FirestoreClient::new(None, "apna-adda1", Some("key")).unwrap();
        FirestoreStore::new(client, "support_chats", Duration::from_secs(2))
    }

    fn doc(value: Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn endpoints_follow_the_rest_layout() {
        let client = FirestoreClient::new(Some("localhost:8080"), "p1", None).unwrap();
        assert_eq!(
            client.endpoint(&client.document_name("users/u1")),
            "https://localhost:8080/v1/projects/p1/databases/(default)/documents/users/u1"
        );
        let emulator = FirestoreClient::new(Some("http://127.0.0.1:8080/"), "p1", None).unwrap();
        assert!(emulator.endpoint("x").starts_with("http://127.0.0.1:8080/v1/"));
    }

    #[test]
    fn message_write_uses_server_time_and_refuses_overwrite() {
        let write = store().message_write("u1", "m1", "hi", "u1");
        assert_eq!(
            write["update"]["name"],
            "projects/apna-adda1/databases/(default)/documents/support_chats/u1/messages/m1"
        );
        assert_eq!(write["update"]["fields"]["text"]["stringValue"], "hi");
        assert_eq!(write["update"]["fields"]["senderId"]["stringValue"], "u1");
        assert_eq!(write["updateTransforms"][0]["fieldPath"], "timestamp");
        assert_eq!(write["currentDocument"]["exists"], false);
    }

    #[test]
    fn summary_write_masks_only_present_fields() {
        let update = SummaryUpdate {
            unread_by_admin: Some(false),
            ..SummaryUpdate::default()
        };
        let write = store().summary_write("u1", &update);
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["unreadByAdmin"]));
        assert_eq!(write["updateTransforms"][0]["fieldPath"], "lastUpdatedAt");

        let full = store().summary_write("u1", &SummaryUpdate::user_sent("hey", Some("a@b.c")));
        let mut paths: Vec<String> =
            serde_json::from_value(full["updateMask"]["fieldPaths"].clone()).unwrap();
        paths.sort();
        assert_eq!(paths, ["lastMessage", "status", "unreadByAdmin", "userEmail"]);
        assert_eq!(full["update"]["fields"]["status"]["stringValue"], "open");
    }

    #[test]
    fn decodes_message_documents() {
        let message = decode_message(&doc(json!({
            "name": "projects/p/databases/(default)/documents/support_chats/u1/messages/abc",
            "fields": {
                "text": { "stringValue": "hello" },
                "senderId": { "stringValue": "admin" },
                "timestamp": { "timestampValue": "2024-05-01T10:00:00.123456Z" }
            }
        })))
        .unwrap();
        assert_eq!(message.id, "abc");
        assert_eq!(message.sender_id, "admin");
        assert_eq!(message.timestamp.to_rfc3339(), "2024-05-01T10:00:00.123456+00:00");

        let broken = decode_message(&doc(json!({
            "name": "x/messages/def",
            "fields": { "text": { "stringValue": "no sender" } }
        })));
        assert!(matches!(broken, Err(ReadError::Malformed(_))));
    }

    #[test]
    fn decodes_summaries_with_defaults() {
        let summary = decode_summary(&doc(json!({
            "name": "projects/p/databases/(default)/documents/support_chats/u9",
            "fields": {
                "userEmail": { "stringValue": "s@x.io" },
                "status": { "stringValue": "resolved" },
                "unreadByAdmin": { "booleanValue": true }
            }
        })));
        assert_eq!(summary.id, "u9");
        assert_eq!(summary.status, ConversationStatus::Resolved);
        assert!(summary.unread_by_admin);
        assert_eq!(summary.last_message, "");
        assert!(summary.last_updated_at.is_none());
    }

    #[test]
    fn query_rows_without_documents_are_skipped() {
        let rows: Vec<QueryRow> = serde_json::from_value(json!([
            { "readTime": "2024-05-01T10:00:00Z" },
            { "document": { "name": "a/b" }, "readTime": "2024-05-01T10:00:00Z" }
        ]))
        .unwrap();
        let docs: Vec<Document> = rows.into_iter().filter_map(|r| r.document).collect();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].fields.is_empty());
    }

    fn served_store(server: &MockServer) -> FirestoreStore {
        let client = FirestoreClient::new(Some(&server.uri()), "p1", Some("test-key"))
            .unwrap()
            .with_id_token(Some("tok".into()));
        FirestoreStore::new(client, "support_chats", Duration::from_millis(10))
    }

    fn empty_rows() -> Value {
        json!([{ "readTime": "2024-05-01T10:00:00Z" }])
    }

    fn message_rows(ids: &[&str]) -> Value {
        let rows: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "document": {
                        "name": format!("projects/p1/databases/(default)/documents/support_chats/u1/messages/{id}"),
                        "fields": {
                            "text": { "stringValue": format!("text {id}") },
                            "senderId": { "stringValue": "u1" },
                            "timestamp": { "timestampValue": "2024-05-01T10:00:00Z" }
                        }
                    },
                    "readTime": "2024-05-01T10:00:01Z"
                })
            })
            .collect();
        Value::Array(rows)
    }

    async fn next_item(sub: &mut Subscription) -> crate::api::events::SnapshotResult {
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("feed item in time")
            .expect("feed open")
    }

    async fn settle(machine: &mut ConversationMachine) {
        tokio::time::timeout(Duration::from_secs(5), machine.next_update())
            .await
            .expect("feed item in time")
            .expect("feed open");
    }

    #[tokio::test]
    async fn append_commits_one_guarded_write_with_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DB}:commit")))
            .and(header("Authorization", "Bearer tok"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(json!({
                "writes": [{ "currentDocument": { "exists": false } }]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "commitTime": "2024-05-01T10:00:00Z" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = served_store(&server).append_message("u1", "hi", "u1").await.unwrap();
        assert_eq!(id.len(), 32);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let name = body["writes"][0]["update"]["name"].as_str().unwrap();
        assert!(name.ends_with(&format!("support_chats/u1/messages/{id}")));
    }

    #[tokio::test]
    async fn refused_commit_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DB}:commit")))
            .respond_with(ResponseTemplate::new(403).set_body_string("PERMISSION_DENIED"))
            .mount(&server)
            .await;

        let err = served_store(&server)
            .upsert_conversation_summary("u1", &SummaryUpdate::user_sent("hi", None))
            .await
            .unwrap_err();
        match err {
            WriteError::Rejected(msg) => {
                assert!(msg.contains("403"));
                assert!(msg.contains("PERMISSION_DENIED"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_reported_as_such() {
        // Nothing listens on port 1.
        let client = FirestoreClient::new(Some("http://127.0.0.1:1"), "p1", None).unwrap();
        let store = FirestoreStore::new(client, "support_chats", Duration::from_millis(10));

        let write = store.append_message("u1", "hi", "u1").await;
        assert!(matches!(write, Err(WriteError::Unreachable(_))));
        let read = store.list_conversations().await;
        assert!(matches!(read, Err(ReadError::Unreachable(_))));
        let role = store.role_of("u1").await;
        assert!(matches!(role, Err(ResolutionError::Lookup(ReadError::Unreachable(_)))));
    }

    #[tokio::test]
    async fn role_lookup_reads_the_user_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{DB}/users/staff")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/p1/databases/(default)/documents/users/staff",
                "fields": { "role": { "stringValue": "admin" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DB}/users/ghost")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DB}/users/broken")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = served_store(&server);
        assert_eq!(store.role_of("staff").await.unwrap().as_deref(), Some("admin"));
        assert_eq!(store.role_of("ghost").await.unwrap(), None);
        assert!(matches!(
            store.role_of("broken").await,
            Err(ResolutionError::Lookup(ReadError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn conversation_summary_reads_the_conversation_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{DB}/support_chats/u1")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/p1/databases/(default)/documents/support_chats/u1",
                "fields": {
                    "lastMessage": { "stringValue": "thanks" },
                    "status": { "stringValue": "resolved" }
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DB}/support_chats/u2")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = served_store(&server);
        let summary = store.conversation_summary("u1").await.unwrap().unwrap();
        assert_eq!(summary.status, ConversationStatus::Resolved);
        assert_eq!(summary.last_message, "thanks");
        assert!(store.conversation_summary("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversations_are_queried_newest_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DB}:runQuery")))
            .and(body_partial_json(json!({
                "structuredQuery": { "from": [{ "collectionId": "support_chats" }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "document": { "name": "x/support_chats/newer", "fields": {} } },
                { "document": { "name": "x/support_chats/older", "fields": {} } }
            ])))
            .mount(&server)
            .await;

        let ids: Vec<String> = served_store(&server)
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["newer", "older"]);
    }

    #[tokio::test]
    async fn garbled_query_response_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DB}:runQuery")))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = served_store(&server).list_conversations().await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[tokio::test]
    async fn feed_emits_only_when_the_message_set_changes() {
        let server = MockServer::start().await;
        let messages = format!("{DB}/support_chats/u1:runQuery");
        Mock::given(method("POST"))
            .and(path(messages.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_rows()))
            .up_to_n_times(3)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(messages))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_rows(&["m1"])))
            .with_priority(2)
            .mount(&server)
            .await;

        let mut sub = served_store(&server).subscribe("u1");
        assert!(next_item(&mut sub).await.unwrap().messages.is_empty());
        let snapshot = next_item(&mut sub).await.unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id, "m1");

        // Polling goes on, but unchanged results are not re-emitted.
        let quiet = tokio::time::timeout(Duration::from_millis(150), sub.next()).await;
        assert!(quiet.is_err());
        assert!(server.received_requests().await.unwrap().len() > 4);
        sub.close();
    }

    #[tokio::test]
    async fn feed_reports_an_outage_and_clears_it_on_recovery() {
        let server = MockServer::start().await;
        let messages = format!("{DB}/support_chats/u1:runQuery");
        Mock::given(method("POST"))
            .and(path(messages.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_rows()))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(messages.clone()))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(FAILURES_BEFORE_REPORT as u64)
            .with_priority(2)
            .mount(&server)
            .await;
        // Same (empty) result as before the outage.
        Mock::given(method("POST"))
            .and(path(messages))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_rows()))
            .with_priority(3)
            .mount(&server)
            .await;

        let mut machine = ConversationMachine::new(Arc::new(served_store(&server)));
        machine.open(Some(Identity::user("u1", None)));
        settle(&mut machine).await;
        assert!(machine.feed_error().is_none());

        settle(&mut machine).await;
        match machine.feed_error() {
            Some(SubscriptionError::Interrupted { attempts, source }) => {
                assert_eq!(*attempts, FAILURES_BEFORE_REPORT);
                assert!(matches!(source, ReadError::Rejected(_)));
            }
            None => panic!("outage was not reported"),
        }

        settle(&mut machine).await;
        assert!(machine.feed_error().is_none());
        assert!(machine.messages().is_empty());
    }
}
