//! In-memory K2 array for tests
//!
//! Speaks the same request shapes as the real management API and enforces
//! the referential rules the orchestration code depends on:
//!
//! - a volume group with volumes or snapshots cannot be deleted
//! - a mapped volume or view cannot be deleted
//! - a host with mappings cannot be deleted
//! - an `in_sync` or `suspended` replication session cannot be deleted
//!
//! A source array can be linked to a target array. Session creation and
//! peer volume creation then materialize the remote objects, and session
//! state changes reach the target session only after a configurable number
//! of reads, like the real asynchronous propagation.

use crate::config::RetryConfig;
use crate::domain::ports::{ApiRequest, ArrayTransport, Method};
use crate::error::{Error, Result};
use crate::k2::client::ResilientClient;
use crate::k2::objects::STANDARD_RETENTION_POLICY;
use crate::metrics::DriverMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Injected failure for matching requests
struct Fault {
    method: Method,
    collection: String,
    status: u16,
    body: String,
    remaining: u32,
}

/// State change waiting to become visible on a target session
struct PendingState {
    state: Value,
    reads_left: u32,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    collections: BTreeMap<String, BTreeMap<u64, Value>>,
    faults: Vec<Fault>,
    requests: Vec<(Method, String, bool)>,
    peer: Option<(Arc<FakeArray>, u32)>,
    pending: BTreeMap<u64, PendingState>,
}

pub(crate) struct FakeArray {
    name: String,
    state: Mutex<FakeState>,
}

impl FakeArray {
    /// New array answering on management address `name`
    pub fn new(name: &str) -> Arc<Self> {
        let array = Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FakeState::default()),
        });
        array.insert("system/state", json!({"rest_api_version": "2.2.0"}));
        array.insert(
            "system/capacity",
            json!({"free": 0, "total": 0, "provisioned": 0, "provisioned_volumes": 0}),
        );
        array.insert("retention_policies", json!({"name": STANDARD_RETENTION_POLICY}));
        array
    }

    /// Resilient client for this array with near-instant retries
    pub fn client(self: &Arc<Self>, label: &str) -> Arc<ResilientClient> {
        let metrics = Arc::new(DriverMetrics::new().expect("metrics registry"));
        Arc::new(ResilientClient::new(
            label,
            self.clone(),
            RetryConfig {
                initial_interval_ms: 1,
                multiplier: 1.0,
            },
            metrics,
        ))
    }

    /// Register `target` as this array's replication peer
    pub fn link_peer(self: &Arc<Self>, target: &Arc<FakeArray>, lag_reads: u32) {
        self.insert(
            "replication/peer_k2arrays",
            json!({"name": format!("peer-{}", target.name), "mgmt_host": target.name}),
        );
        self.state.lock().peer = Some((target.clone(), lag_reads));
    }

    /// Fail the next `times` requests of `method` on `collection`
    pub fn fail_next(&self, method: &str, collection: &str, status: u16, body: &str, times: u32) {
        let method = match method {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            other => panic!("unknown method {other}"),
        };
        self.state.lock().faults.push(Fault {
            method,
            collection: collection.to_string(),
            status,
            body: body.to_string(),
            remaining: times,
        });
    }

    pub fn insert(&self, collection: &str, mut object: Value) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        object["id"] = json!(id);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, object);
        id
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn names(&self, collection: &str) -> Vec<String> {
        let field = name_field(collection);
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|objects| {
                objects
                    .values()
                    .filter_map(|o| o.get(field).and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find(&self, collection: &str, name: &str) -> Option<Value> {
        let state = self.state.lock();
        find_named(&state, collection, name).map(|(_, object)| object.clone())
    }

    pub fn set_field(&self, collection: &str, name: &str, field: &str, value: Value) {
        let mut state = self.state.lock();
        let id = find_named(&state, collection, name).map(|(id, _)| id);
        if let Some(object) = id.and_then(|id| {
            state
                .collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(&id))
        }) {
            object[field] = value;
        }
    }

    /// Capacity counters in KiB; `provisioned` includes snapshots, unlike
    /// `provisioned_volumes`
    pub fn set_capacity(&self, free: u64, total: u64, provisioned: u64, provisioned_volumes: u64) {
        let mut state = self.state.lock();
        if let Some(capacity) = state
            .collections
            .get_mut("system/capacity")
            .and_then(|c| c.values_mut().next())
        {
            capacity["free"] = json!(free);
            capacity["total"] = json!(total);
            capacity["provisioned"] = json!(provisioned);
            capacity["provisioned_volumes"] = json!(provisioned_volumes);
        }
    }

    pub fn set_api_version(&self, version: &str) {
        let mut state = self.state.lock();
        if let Some(system) = state
            .collections
            .get_mut("system/state")
            .and_then(|c| c.values_mut().next())
        {
            system["rest_api_version"] = json!(version);
        }
    }

    /// Drop every object of a collection
    pub fn clear(&self, collection: &str) {
        self.state.lock().collections.remove(collection);
    }

    /// Number of requests of `method` against `collection`
    pub fn requests(&self, method: Method, collection: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, c, _)| *m == method && c == collection)
            .count()
    }

    /// Number of single-object reads (not searches) on `collection`
    pub fn reads(&self, collection: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, c, by_id)| *m == Method::Get && c == collection && *by_id)
            .count()
    }

    // =========================================================================
    // Request Handling
    // =========================================================================

    fn handle(&self, request: &ApiRequest) -> Result<Value> {
        let (collection, id) = split_path(&request.path);

        let mut state = self.state.lock();
        state
            .requests
            .push((request.method, collection.clone(), id.is_some()));
        if let Some(fault) = state
            .faults
            .iter_mut()
            .find(|f| f.method == request.method && f.collection == collection && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(Error::Http {
                status: fault.status,
                body: fault.body.clone(),
            });
        }

        match (request.method, id) {
            (Method::Get, None) => Ok(search(&state, &collection, &request.query)),
            (Method::Get, Some(id)) => read(&mut state, &collection, id),
            (Method::Post, None) => {
                let body = request.body.clone().unwrap_or_else(|| json!({}));
                let (created, remote) = create(&mut state, &collection, body)?;
                let peer = state.peer.clone();
                drop(state);
                if let (Some(remote), Some((target, _))) = (remote, peer) {
                    target.materialize(remote);
                }
                Ok(created)
            }
            (Method::Patch, Some(id)) => {
                let patch = request.body.clone().unwrap_or_else(|| json!({}));
                let (updated, mirror) = update(&mut state, &collection, id, patch)?;
                let peer = state.peer.clone();
                drop(state);
                if let (Some((session, new_state)), Some((target, lag))) = (mirror, peer) {
                    target.schedule_state(&session, new_state, lag);
                }
                Ok(updated)
            }
            (Method::Delete, Some(id)) => {
                delete(&mut state, &collection, id)?;
                Ok(Value::Null)
            }
            _ => Err(Error::Http {
                status: 405,
                body: format!("{} not allowed on {}", request.method, request.path),
            }),
        }
    }

    /// Create the remote side of a replication object
    fn materialize(&self, remote: RemoteObject) {
        match remote {
            RemoteObject::Session {
                session_name,
                group_name,
                is_dedup,
            } => {
                self.insert(
                    "volume_groups",
                    json!({"name": group_name, "quota": 0, "is_dedup": is_dedup}),
                );
                self.insert(
                    "replication/sessions",
                    json!({"name": session_name, "state": "initializing"}),
                );
            }
            RemoteObject::Volume {
                name,
                size,
                group_name,
            } => {
                let group = self.find("volume_groups", &group_name);
                if let Some(group) = group {
                    let group_ref = json!({"ref": format!("/volume_groups/{}", group["id"])});
                    self.insert(
                        "volumes",
                        json!({"name": name, "size": size, "volume_group": group_ref}),
                    );
                }
            }
        }
    }

    fn schedule_state(&self, session_name: &str, new_state: Value, lag: u32) {
        let mut state = self.state.lock();
        let Some((id, _)) = find_named(&state, "replication/sessions", session_name) else {
            return;
        };
        if lag == 0 {
            if let Some(session) = state
                .collections
                .get_mut("replication/sessions")
                .and_then(|c| c.get_mut(&id))
            {
                session["state"] = new_state;
            }
            return;
        }
        state.pending.insert(
            id,
            PendingState {
                state: new_state,
                reads_left: lag,
            },
        );
    }
}

#[async_trait]
impl ArrayTransport for FakeArray {
    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        self.handle(request)
    }

    fn endpoint(&self) -> &str {
        &self.name
    }
}

enum RemoteObject {
    Session {
        session_name: String,
        group_name: String,
        is_dedup: bool,
    },
    Volume {
        name: String,
        size: u64,
        group_name: String,
    },
}

// =============================================================================
// Collection Operations
// =============================================================================

fn split_path(path: &str) -> (String, Option<u64>) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((collection, last)) => match last.parse::<u64>() {
            Ok(id) => (collection.to_string(), Some(id)),
            Err(_) => (trimmed.to_string(), None),
        },
        None => (trimmed.to_string(), None),
    }
}

fn name_field(collection: &str) -> &'static str {
    match collection {
        "snapshots" => "short_name",
        "host_iqns" => "iqn",
        "host_fc_ports" => "pwwn",
        _ => "name",
    }
}

fn field_matches(object: &Value, field: &str, expected: &str) -> bool {
    match object.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Object(o)) => o.get("ref").and_then(Value::as_str) == Some(expected),
        Some(Value::Bool(b)) => b.to_string() == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}

fn ref_path(object: &Value, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(|r| r.get("ref"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn find_named<'a>(state: &'a FakeState, collection: &str, name: &str) -> Option<(u64, &'a Value)> {
    let field = name_field(collection);
    state
        .collections
        .get(collection)?
        .iter()
        .find(|(_, o)| o.get(field).and_then(Value::as_str) == Some(name))
        .map(|(id, o)| (*id, o))
}

fn resolve<'a>(state: &'a FakeState, path: &str) -> Option<&'a Value> {
    let (collection, id) = split_path(path);
    state.collections.get(&collection)?.get(&id?)
}

fn any_referencing(state: &FakeState, collection: &str, field: &str, path: &str) -> bool {
    state
        .collections
        .get(collection)
        .is_some_and(|c| c.values().any(|o| field_matches(o, field, path)))
}

fn not_found(collection: &str, id: u64) -> Error {
    Error::Http {
        status: 404,
        body: format!("MC_ERR_NOT_FOUND: /{}/{}", collection, id),
    }
}

fn rejected(body: impl Into<String>) -> Error {
    Error::Http {
        status: 400,
        body: body.into(),
    }
}

fn search(state: &FakeState, collection: &str, query: &[(String, String)]) -> Value {
    let hits: Vec<Value> = state
        .collections
        .get(collection)
        .map(|objects| {
            objects
                .values()
                .filter(|o| query.iter().all(|(f, v)| field_matches(o, f, v)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    json!({"total": hits.len(), "hits": hits})
}

fn read(state: &mut FakeState, collection: &str, id: u64) -> Result<Value> {
    if collection == "replication/sessions" {
        let reads_left = state.pending.get(&id).map(|p| p.reads_left);
        let apply = match reads_left {
            Some(n) if n > 0 => {
                if let Some(pending) = state.pending.get_mut(&id) {
                    pending.reads_left -= 1;
                }
                None
            }
            Some(_) => state.pending.remove(&id).map(|p| p.state),
            None => None,
        };
        if let Some(new_state) = apply {
            if let Some(session) = state
                .collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(&id))
            {
                session["state"] = new_state;
            }
        }
    }
    state
        .collections
        .get(collection)
        .and_then(|c| c.get(&id))
        .cloned()
        .ok_or_else(|| not_found(collection, id))
}

fn create(
    state: &mut FakeState,
    collection: &str,
    mut body: Value,
) -> Result<(Value, Option<RemoteObject>)> {
    let field = name_field(collection);
    if let Some(name) = body.get(field).and_then(Value::as_str) {
        if find_named(state, collection, name).is_some() {
            return Err(rejected(format!("MC_ERR_NAME_EXISTS: {}", name)));
        }
    }

    let mut remote = None;
    match collection {
        "volumes" => {
            let group = ref_path(&body, "volume_group").unwrap_or_default();
            if resolve(state, &group).is_none() {
                return Err(rejected(format!("MC_ERR_INVALID_REF: {}", group)));
            }
        }
        "snapshots" => {
            let source = ref_path(&body, "source").unwrap_or_default();
            let group = match resolve(state, &source) {
                Some(_) if source.starts_with("/volume_groups/") => source.clone(),
                Some(snapshot) => ref_path(snapshot, "volume_group").unwrap_or_default(),
                None => return Err(rejected(format!("MC_ERR_INVALID_REF: {}", source))),
            };
            body["volume_group"] = json!({"ref": group});
        }
        "mappings" => {
            let mut volume = ref_path(&body, "volume").unwrap_or_default();
            let host = ref_path(&body, "host").unwrap_or_default();
            if volume.starts_with("/snapshots/") {
                let volsnap = state
                    .collections
                    .get("volsnaps")
                    .and_then(|c| c.values().find(|v| field_matches(v, "snapshot", &volume)))
                    .map(|v| format!("/volsnaps/{}", v["id"]))
                    .ok_or_else(|| rejected("MC_ERR_NOT_EXPOSABLE"))?;
                volume = volsnap;
                body["volume"] = json!({"ref": volume});
            }
            if resolve(state, &volume).is_none() || resolve(state, &host).is_none() {
                return Err(rejected("MC_ERR_INVALID_REF"));
            }
            let mappings = state.collections.get("mappings");
            if mappings.is_some_and(|c| {
                c.values()
                    .any(|m| field_matches(m, "volume", &volume) && field_matches(m, "host", &host))
            }) {
                return Err(rejected("MC_ERR_MAPPING_EXISTS"));
            }
            let luns = mappings.map_or(0, |c| {
                c.values().filter(|m| field_matches(m, "host", &host)).count()
            });
            body["lun"] = json!(luns + 1);
        }
        "replication/sessions" => {
            if body.get("state").is_none() {
                body["state"] = json!("initializing");
            }
            let group = ref_path(&body, "local_volume_group").unwrap_or_default();
            let is_dedup = resolve(state, &group)
                .and_then(|g| g.get("is_dedup"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if state.peer.is_some() {
                remote = Some(RemoteObject::Session {
                    session_name: body["remote_replication_session_name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    group_name: body["replication_peer_volume_group_name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    is_dedup,
                });
            }
        }
        "replication/peer_volumes" => {
            let session = ref_path(&body, "replication_session").unwrap_or_default();
            let volume = ref_path(&body, "local_volume").unwrap_or_default();
            let (Some(session), Some(volume)) = (resolve(state, &session), resolve(state, &volume))
            else {
                return Err(rejected("MC_ERR_INVALID_REF"));
            };
            if state.peer.is_some() {
                remote = Some(RemoteObject::Volume {
                    name: body["name"].as_str().unwrap_or_default().to_string(),
                    size: volume["size"].as_u64().unwrap_or(0),
                    group_name: session["replication_peer_volume_group_name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        _ => {}
    }

    state.next_id += 1;
    let id = state.next_id;
    body["id"] = json!(id);
    state
        .collections
        .entry(collection.to_string())
        .or_default()
        .insert(id, body.clone());

    if collection == "snapshots" && body["is_exposable"].as_bool() == Some(true) {
        state.next_id += 1;
        let volsnap_id = state.next_id;
        state.collections.entry("volsnaps".to_string()).or_default().insert(
            volsnap_id,
            json!({"id": volsnap_id, "snapshot": {"ref": format!("/snapshots/{}", id)}}),
        );
    }

    Ok((body, remote))
}

fn update(
    state: &mut FakeState,
    collection: &str,
    id: u64,
    patch: Value,
) -> Result<(Value, Option<(String, Value)>)> {
    let field = name_field(collection);
    if let Some(name) = patch.get(field).and_then(Value::as_str) {
        if find_named(state, collection, name).is_some_and(|(other, _)| other != id) {
            return Err(rejected(format!("MC_ERR_NAME_EXISTS: {}", name)));
        }
    }

    let object = state
        .collections
        .get_mut(collection)
        .and_then(|c| c.get_mut(&id))
        .ok_or_else(|| not_found(collection, id))?;
    if let (Value::Object(target), Value::Object(fields)) = (&mut *object, patch) {
        for (k, v) in fields {
            target.insert(k, v);
        }
    }
    let updated = object.clone();

    let mirror = if collection == "replication/sessions" {
        updated
            .get("remote_replication_session_name")
            .and_then(Value::as_str)
            .map(|remote| (remote.to_string(), updated["state"].clone()))
    } else {
        None
    };

    Ok((updated, mirror))
}

fn delete(state: &mut FakeState, collection: &str, id: u64) -> Result<()> {
    let path = format!("/{}/{}", collection, id);
    let object = state
        .collections
        .get(collection)
        .and_then(|c| c.get(&id))
        .cloned()
        .ok_or_else(|| not_found(collection, id))?;

    match collection {
        "volume_groups" => {
            if any_referencing(state, "volumes", "volume_group", &path) {
                return Err(rejected("MC_ERR_VG_NOT_EMPTY"));
            }
            if any_referencing(state, "snapshots", "volume_group", &path) {
                return Err(rejected("MC_ERR_VG_HAS_SNAPSHOTS"));
            }
        }
        "volumes" => {
            if any_referencing(state, "mappings", "volume", &path) {
                return Err(rejected("MC_ERR_VOLUME_MAPPED"));
            }
        }
        "hosts" => {
            if any_referencing(state, "mappings", "host", &path) {
                return Err(rejected("MC_ERR_HOST_HAS_MAPPINGS"));
            }
            for dependent in ["host_iqns", "host_fc_ports"] {
                if let Some(c) = state.collections.get_mut(dependent) {
                    c.retain(|_, o| !field_matches(o, "host", &path));
                }
            }
        }
        "snapshots" => {
            let volsnaps: Vec<String> = state
                .collections
                .get("volsnaps")
                .map(|c| {
                    c.values()
                        .filter(|v| field_matches(v, "snapshot", &path))
                        .map(|v| format!("/volsnaps/{}", v["id"]))
                        .collect()
                })
                .unwrap_or_default();
            if volsnaps
                .iter()
                .any(|v| any_referencing(state, "mappings", "volume", v))
            {
                return Err(rejected("MC_ERR_SNAPSHOT_MAPPED"));
            }
            if let Some(c) = state.collections.get_mut("volsnaps") {
                c.retain(|_, v| !field_matches(v, "snapshot", &path));
            }
        }
        "replication/sessions" => {
            let active = matches!(object["state"].as_str(), Some("in_sync") | Some("suspended"));
            if active {
                return Err(rejected("MC_ERR_SESSION_ACTIVE"));
            }
            if let Some(c) = state.collections.get_mut("replication/peer_volumes") {
                c.retain(|_, p| !field_matches(p, "replication_session", &path));
            }
            state.pending.remove(&id);
        }
        _ => {}
    }

    if let Some(c) = state.collections.get_mut(collection) {
        c.remove(&id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/volumes"), ("volumes".to_string(), None));
        assert_eq!(split_path("/volumes/4"), ("volumes".to_string(), Some(4)));
        assert_eq!(
            split_path("/replication/sessions/9"),
            ("replication/sessions".to_string(), Some(9))
        );
        assert_eq!(
            split_path("/replication/peer_k2arrays"),
            ("replication/peer_k2arrays".to_string(), None)
        );
    }

    #[tokio::test]
    async fn test_group_with_volume_cannot_be_deleted() {
        let array = FakeArray::new("k2");
        let vg = array.insert("volume_groups", json!({"name": "cvg-1", "is_dedup": true}));
        array.insert(
            "volumes",
            json!({"name": "cv-1", "size": 1, "volume_group": {"ref": format!("/volume_groups/{vg}")}}),
        );
        let err = array
            .send(&ApiRequest::delete(format!("/volume_groups/{vg}")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 400, ref body } if body.contains("NOT_EMPTY")));
    }

    #[tokio::test]
    async fn test_state_mirror_lags() {
        let source = FakeArray::new("src");
        let target = FakeArray::new("tgt");
        source.link_peer(&target, 2);

        let vg = source.insert("volume_groups", json!({"name": "cvg-1", "is_dedup": true}));
        let created = source
            .send(&ApiRequest::post(
                "/replication/sessions",
                json!({
                    "name": "ssn-1",
                    "local_volume_group": {"ref": format!("/volume_groups/{vg}")},
                    "replication_peer_volume_group_name": "rcvg-1",
                    "remote_replication_session_name": "rssn-1",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(target.names("volume_groups"), vec!["rcvg-1".to_string()]);

        source
            .send(&ApiRequest::patch(
                format!("/replication/sessions/{}", created["id"]),
                json!({"state": "suspended"}),
            ))
            .await
            .unwrap();

        let tgt_id = target.find("replication/sessions", "rssn-1").unwrap()["id"].clone();
        let path = format!("/replication/sessions/{}", tgt_id);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let s = target.send(&ApiRequest::get(path.clone())).await.unwrap();
            seen.push(s["state"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["initializing", "initializing", "suspended"]);
    }
}
