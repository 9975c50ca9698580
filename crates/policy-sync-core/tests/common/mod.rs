//! Shared fixtures: an in-memory resource manager behind a wiremock batch
//! endpoint, and a scratch policy repository.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use policy_sync_core::{
    AccessToken, BatchClient, BatchSettings, RestClient, RetrySettings, SyncConfig,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SUB: &str = "/subscriptions/00000000-0000-0000-0000-000000000001";

pub fn definition_id(name: &str) -> String {
    format!("{SUB}/providers/Microsoft.Authorization/policyDefinitions/{name}")
}

pub fn assignment_id(name: &str) -> String {
    format!("{SUB}/providers/Microsoft.Authorization/policyAssignments/{name}")
}

pub fn definition(name: &str, effect: &str) -> Value {
    json!({
        "id": definition_id(name),
        "name": name,
        "type": "Microsoft.Authorization/policyDefinitions",
        "properties": {
            "displayName": format!("Definition {name}"),
            "mode": "All",
            "policyRule": {
                "if": { "field": "location", "notIn": ["westeurope"] },
                "then": { "effect": effect }
            }
        }
    })
}

pub fn assignment(name: &str, definition: &str) -> Value {
    json!({
        "id": assignment_id(name),
        "name": name,
        "type": "Microsoft.Authorization/policyAssignments",
        "properties": {
            "displayName": format!("Assignment {name}"),
            "policyDefinitionId": definition_id(definition),
            "scope": SUB
        }
    })
}

pub fn write_json(root: &Path, rel: &str, value: &Value) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Remote state and fault injection, keyed by lowercase resource path.
#[derive(Debug, Default)]
pub struct ArmState {
    pub objects: BTreeMap<String, Value>,
    /// PUTs over an existing object answered with 400
    pub reject_updates: HashSet<String>,
    /// PUTs answered with 400 whether or not the object exists
    pub reject_all_puts: HashSet<String>,
    /// Next PUT of each id answered with 500
    pub fail_next_put: HashSet<String>,
    /// DELETEs answered with 409
    pub fail_deletes: HashSet<String>,
    /// GETs answered with 403
    pub forbidden: HashSet<String>,
    /// Short role ids whose grants are answered with 404
    pub missing_roles: HashSet<String>,
    /// Every inner operation as `METHOD path`
    pub log: Vec<String>,
    /// Number of batch POSTs received, and the size of each
    pub chunks: Vec<usize>,
    principals: usize,
}

impl ArmState {
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.objects.get(&id.to_ascii_lowercase())
    }

    pub fn insert(&mut self, value: Value) {
        let id = value["id"].as_str().unwrap().to_ascii_lowercase();
        self.objects.insert(id, value);
    }

    pub fn reject_update(&mut self, id: &str) {
        self.reject_updates.insert(id.to_ascii_lowercase());
    }

    pub fn reject_put(&mut self, id: &str) {
        self.reject_all_puts.insert(id.to_ascii_lowercase());
    }

    pub fn fail_next_put_of(&mut self, id: &str) {
        self.fail_next_put.insert(id.to_ascii_lowercase());
    }

    pub fn fail_delete_of(&mut self, id: &str) {
        self.fail_deletes.insert(id.to_ascii_lowercase());
    }

    pub fn forbid(&mut self, id: &str) {
        self.forbidden.insert(id.to_ascii_lowercase());
    }

    pub fn count(&self, op: &str) -> usize {
        self.log.iter().filter(|l| l.starts_with(op)).count()
    }

    pub fn duplicates(&self) -> Vec<&String> {
        self.objects
            .keys()
            .filter(|k| k.ends_with("_duplicate"))
            .collect()
    }

    fn handle(&mut self, op: &Value) -> Value {
        let name = op["name"].clone();
        let http_method = op["httpMethod"].as_str().unwrap_or_default().to_string();
        let url = url::Url::parse(op["url"].as_str().unwrap_or_default()).unwrap();
        let resource = url.path().to_string();
        let key = resource.to_ascii_lowercase();
        self.log.push(format!("{http_method} {resource}"));

        let (status, content) = match http_method.as_str() {
            "GET" => self.read(&url, &key),
            "PUT" => self.write(&key, &resource, op["content"].clone()),
            "DELETE" if self.fail_deletes.contains(&key) => {
                (409, error("ResourceLocked", "the resource is locked"))
            }
            "DELETE" => match self.objects.remove(&key) {
                Some(_) => (200, Value::Null),
                None => (204, Value::Null),
            },
            other => (405, error("MethodNotAllowed", other)),
        };
        json!({ "name": name, "httpStatusCode": status, "headers": {}, "content": content })
    }

    fn read(&self, url: &url::Url, key: &str) -> (u16, Value) {
        if self.forbidden.contains(key) {
            return (403, error("AuthorizationFailed", "not allowed to read"));
        }
        if let Some((_, filter)) = url.query_pairs().find(|(k, _)| k == "$filter") {
            let definition = filter
                .split('\'')
                .nth(1)
                .unwrap_or_default()
                .to_ascii_lowercase();
            let value: Vec<Value> = self
                .objects
                .values()
                .filter(|o| {
                    o["properties"]["policyDefinitionId"]
                        .as_str()
                        .is_some_and(|d| d.to_ascii_lowercase() == definition)
                })
                .cloned()
                .collect();
            return (200, json!({ "value": value }));
        }
        match self.objects.get(key) {
            Some(object) => (200, object.clone()),
            None => (404, error(not_found_code(key), "not found")),
        }
    }

    fn write(&mut self, key: &str, resource: &str, mut content: Value) -> (u16, Value) {
        if key.contains("/roleassignments/") {
            let role = content["properties"]["roleDefinitionId"]
                .as_str()
                .and_then(|r| r.rsplit('/').next())
                .unwrap_or_default()
                .to_string();
            if self.missing_roles.contains(&role) {
                return (
                    404,
                    error("RoleDefinitionDoesNotExist", &format!("role {role} does not exist")),
                );
            }
            content["id"] = json!(resource);
            self.objects.insert(key.to_string(), content.clone());
            return (201, content);
        }

        let exists = self.objects.contains_key(key);
        if self.reject_all_puts.contains(key) || (exists && self.reject_updates.contains(key)) {
            return (400, error("InvalidPolicyRule", "the policy rule cannot be changed"));
        }
        if self.fail_next_put.remove(key) {
            return (500, error("InternalServerError", "try again later"));
        }

        if let Some(identity) = content.get_mut("identity")
            && identity.get("principalId").is_none()
        {
            self.principals += 1;
            identity["principalId"] = json!(format!("principal-{}", self.principals));
            identity["tenantId"] = json!("tenant-1");
        }
        self.objects.insert(key.to_string(), content.clone());
        (if exists { 200 } else { 201 }, content)
    }
}

fn not_found_code(key: &str) -> &'static str {
    if key.contains("/policydefinitions/") {
        "PolicyDefinitionNotFound"
    } else if key.contains("/policysetdefinitions/") {
        "PolicySetDefinitionNotFound"
    } else if key.contains("/policyassignments/") {
        "PolicyAssignmentNotFound"
    } else {
        "ResourceNotFound"
    }
}

fn error(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

/// Answers batch POSTs from [`ArmState`]. Responses come back in reverse
/// order so callers must correlate by name.
#[derive(Clone, Default)]
pub struct FakeArm {
    state: Arc<Mutex<ArmState>>,
}

impl FakeArm {
    pub fn state(&self) -> MutexGuard<'_, ArmState> {
        self.state.lock().unwrap()
    }
}

impl Respond for FakeArm {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let ops = body["requests"].as_array().cloned().unwrap_or_default();
        let mut state = self.state();
        state.chunks.push(ops.len());
        let mut responses: Vec<Value> = ops.iter().map(|op| state.handle(op)).collect();
        responses.reverse();
        ResponseTemplate::new(200).set_body_json(json!({ "responses": responses }))
    }
}

/// Mock resource manager with the batch endpoint mounted.
pub struct MockArmServer {
    pub server: MockServer,
    pub arm: FakeArm,
}

impl MockArmServer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let arm = FakeArm::default();
        Mock::given(method("POST"))
            .and(path("/batch"))
            .respond_with(arm.clone())
            .mount(&server)
            .await;
        Self { server, arm }
    }

    pub fn state(&self) -> MutexGuard<'_, ArmState> {
        self.arm.state()
    }

    pub fn client(&self) -> BatchClient {
        client_for(&self.server, fast_batch_settings())
    }
}

pub fn fast_batch_settings() -> BatchSettings {
    BatchSettings {
        poll_interval_ms: 10,
        poll_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn client_for(server: &MockServer, settings: BatchSettings) -> BatchClient {
    let access = AccessToken {
        token: "test-token".into(),
        management_url: server.uri(),
    };
    let transport = RestClient::new(
        &access,
        RetrySettings {
            max_retries: 0,
            ..Default::default()
        },
    );
    BatchClient::new(Arc::new(transport), &server.uri(), settings, "2020-06-01")
}

pub fn sync_config(root: &Path) -> SyncConfig {
    let mut config = SyncConfig {
        root: root.to_path_buf(),
        paths: vec!["policies/**".into()],
        ..Default::default()
    };
    config.context.repo_name = "contoso/policies".into();
    config.context.commit_sha = "0123abcd".into();
    config.context.run_url = "https://github.com/contoso/policies/actions/runs/1".into();
    config
}
