//! In-memory mock transport shared by the integration tests.
//!
//! Backs a flat path-keyed tree with explicit child ordering, records
//! every write call it receives, and can be switched read-only or made
//! to fail at chosen points.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use canopy_core::{
    ChildReorder, Node, PathMove, SessionError, Transport, TransactionTransport,
    TypeFilterTransport, VersioningTransport, WritingTransport,
};

/// One transport call, as the session issued it.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    GetNode(String),
    GetNodes(Vec<String>),
    StoreNodes(Vec<String>),
    MoveNodes(Vec<(String, String)>),
    DeleteNodes(Vec<String>),
    DeleteProperties(Vec<String>),
    UpdateProperties(String),
    ReorderChildren(String, Vec<(String, Option<String>)>),
    PrepareSave,
    FinishSave,
    RollbackSave,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    Checkin(String),
    Checkout(String),
    RemoveVersion(String),
    CopyNode(String, String),
    MoveImmediately(String, String),
    DeleteImmediately(String),
    DeletePropertyImmediately(String),
}

#[derive(Debug, Default)]
struct Backend {
    /// Properties per path (child entries are synthesised on read)
    records: HashMap<String, Map<String, Value>>,
    /// Ordered child names per path
    children: HashMap<String, Vec<String>>,
    identifiers: HashMap<String, String>,
    references: HashMap<String, Vec<String>>,
    weak_references: HashMap<String, Vec<String>>,
    binaries: HashMap<String, Vec<u8>>,
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn covers(base: &str, path: &str) -> bool {
    path == base || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}

fn build_payload(backend: &Backend, path: &str) -> Option<Value> {
    let record = backend.records.get(path)?;
    let mut payload = record.clone();
    if let Some(children) = backend.children.get(path) {
        for child in children {
            payload.insert(child.clone(), json!({ "jcr:uuid": null }));
        }
    }
    Some(Value::Object(payload))
}

fn missing(path: &str) -> anyhow::Error {
    anyhow::Error::new(SessionError::item_not_found(path))
}

pub struct MockTransport {
    backend: Mutex<Backend>,
    calls: Mutex<Vec<RecordedCall>>,
    writable: bool,
    server_filter: bool,
    fail_store: Mutex<bool>,
    fail_commit: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self {
            backend: Mutex::new(Backend::default()),
            calls: Mutex::new(Vec::new()),
            writable: true,
            server_filter: false,
            fail_store: Mutex::new(false),
            fail_commit: Mutex::new(false),
        };
        transport.seed("/", json!({ "jcr:primaryType": "nt:unstructured" }));
        transport
    }

    pub fn read_only() -> Self {
        Self {
            writable: false,
            ..Self::new()
        }
    }

    pub fn with_server_filter(mut self) -> Self {
        self.server_filter = true;
        self
    }

    /// Insert a backend node, linking it under its parent in seed order.
    pub fn seed(&self, path: &str, props: Value) {
        let mut backend = self.backend.lock().unwrap();
        let record = props.as_object().cloned().unwrap_or_default();
        if let Some(id) = record.get("jcr:uuid").and_then(Value::as_str) {
            backend.identifiers.insert(id.to_string(), path.to_string());
        }
        backend.records.insert(path.to_string(), record);
        backend.children.entry(path.to_string()).or_default();
        if path != "/" {
            let parent = parent_of(path);
            let name = name_of(path);
            let siblings = backend.children.entry(parent).or_default();
            if !siblings.contains(&name) {
                siblings.push(name);
            }
        }
    }

    pub fn set_references(&self, path: &str, property_paths: Vec<String>) {
        self.backend
            .lock()
            .unwrap()
            .references
            .insert(path.to_string(), property_paths);
    }

    pub fn set_weak_references(&self, path: &str, property_paths: Vec<String>) {
        self.backend
            .lock()
            .unwrap()
            .weak_references
            .insert(path.to_string(), property_paths);
    }

    pub fn set_binary(&self, path: &str, bytes: Vec<u8>) {
        self.backend
            .lock()
            .unwrap()
            .binaries
            .insert(path.to_string(), bytes);
    }

    /// Remove a backend subtree behind the session's back.
    pub fn delete_backend_node(&self, path: &str) {
        let mut backend = self.backend.lock().unwrap();
        Self::apply_delete(&mut backend, path);
    }

    pub fn fail_next_store(&self, fail: bool) {
        *self.fail_store.lock().unwrap() = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        *self.fail_commit.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded write calls only (reads filtered out).
    pub fn write_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RecordedCall::GetNode(_) | RecordedCall::GetNodes(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.backend.lock().unwrap().records.contains_key(path)
    }

    pub fn node_record(&self, path: &str) -> Option<Value> {
        self.backend
            .lock()
            .unwrap()
            .records
            .get(path)
            .cloned()
            .map(Value::Object)
    }

    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.backend
            .lock()
            .unwrap()
            .children
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn apply_store(backend: &mut Backend, node: &Node) {
        let mut record = Map::new();
        record.insert("jcr:primaryType".to_string(), json!(node.primary_type));
        if !node.mixin_types.is_empty() {
            record.insert("jcr:mixinTypes".to_string(), json!(node.mixin_types));
        }
        for (name, prop) in &node.properties {
            let value = if prop.multi_valued {
                Value::Array(prop.values.clone())
            } else {
                prop.values.first().cloned().unwrap_or(Value::Null)
            };
            record.insert(name.clone(), value);
        }
        if let Some(id) = &node.identifier {
            backend.identifiers.insert(id.clone(), node.path.clone());
        }
        backend.records.insert(node.path.clone(), record);
        backend.children.entry(node.path.clone()).or_default();
        let parent = parent_of(&node.path);
        let name = name_of(&node.path);
        let siblings = backend.children.entry(parent).or_default();
        if !siblings.contains(&name) {
            siblings.push(name);
        }
    }

    fn apply_move(backend: &mut Backend, src: &str, dst: &str) {
        let moved: Vec<String> = backend
            .records
            .keys()
            .filter(|p| covers(src, p))
            .cloned()
            .collect();
        for old in moved {
            let renamed = format!("{}{}", dst, &old[src.len()..]);
            if let Some(record) = backend.records.remove(&old) {
                backend.records.insert(renamed.clone(), record);
            }
            if let Some(children) = backend.children.remove(&old) {
                backend.children.insert(renamed.clone(), children);
            }
            for path in backend.identifiers.values_mut() {
                if *path == old {
                    *path = renamed.clone();
                }
            }
        }
        if let Some(siblings) = backend.children.get_mut(&parent_of(src)) {
            siblings.retain(|n| *n != name_of(src));
        }
        let siblings = backend.children.entry(parent_of(dst)).or_default();
        let dst_name = name_of(dst);
        if !siblings.contains(&dst_name) {
            siblings.push(dst_name);
        }
    }

    fn apply_delete(backend: &mut Backend, path: &str) {
        let doomed: Vec<String> = backend
            .records
            .keys()
            .filter(|p| covers(path, p))
            .cloned()
            .collect();
        for p in &doomed {
            backend.records.remove(p);
            backend.children.remove(p);
        }
        backend.identifiers.retain(|_, p| !covers(path, p));
        if let Some(siblings) = backend.children.get_mut(&parent_of(path)) {
            siblings.retain(|n| *n != name_of(path));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_node(&self, path: &str) -> anyhow::Result<Value> {
        self.record(RecordedCall::GetNode(path.to_string()));
        let backend = self.backend.lock().unwrap();
        build_payload(&backend, path).ok_or_else(|| missing(path))
    }

    async fn get_nodes(&self, paths: Vec<String>) -> anyhow::Result<HashMap<String, Value>> {
        self.record(RecordedCall::GetNodes(paths.clone()));
        let backend = self.backend.lock().unwrap();
        Ok(paths
            .into_iter()
            .filter_map(|p| build_payload(&backend, &p).map(|v| (p, v)))
            .collect())
    }

    async fn get_node_by_identifier(&self, identifier: &str) -> anyhow::Result<(String, Value)> {
        let backend = self.backend.lock().unwrap();
        let path = backend
            .identifiers
            .get(identifier)
            .ok_or_else(|| missing(identifier))?
            .clone();
        let payload = build_payload(&backend, &path).ok_or_else(|| missing(&path))?;
        Ok((path, payload))
    }

    async fn get_nodes_by_identifier(
        &self,
        identifiers: Vec<String>,
    ) -> anyhow::Result<HashMap<String, (String, Value)>> {
        let backend = self.backend.lock().unwrap();
        Ok(identifiers
            .into_iter()
            .filter_map(|id| {
                let path = backend.identifiers.get(&id)?.clone();
                let payload = build_payload(&backend, &path)?;
                Some((id, (path, payload)))
            })
            .collect())
    }

    async fn get_binary_stream(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let backend = self.backend.lock().unwrap();
        backend
            .binaries
            .get(path)
            .cloned()
            .ok_or_else(|| missing(path))
    }

    async fn get_references(&self, path: &str, name: Option<&str>) -> anyhow::Result<Vec<String>> {
        let backend = self.backend.lock().unwrap();
        let mut paths = backend.references.get(path).cloned().unwrap_or_default();
        if let Some(name) = name {
            paths.retain(|p| name_of(p) == name);
        }
        Ok(paths)
    }

    async fn get_weak_references(
        &self,
        path: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        let backend = self.backend.lock().unwrap();
        let mut paths = backend
            .weak_references
            .get(path)
            .cloned()
            .unwrap_or_default();
        if let Some(name) = name {
            paths.retain(|p| name_of(p) == name);
        }
        Ok(paths)
    }

    async fn get_namespaces(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut namespaces = HashMap::new();
        namespaces.insert("app".to_string(), "http://example.com/app/1.0".to_string());
        Ok(namespaces)
    }

    fn writing(&self) -> Option<&dyn WritingTransport> {
        self.writable.then_some(self as &dyn WritingTransport)
    }

    fn transactions(&self) -> Option<&dyn TransactionTransport> {
        self.writable.then_some(self as &dyn TransactionTransport)
    }

    fn versioning(&self) -> Option<&dyn VersioningTransport> {
        self.writable.then_some(self as &dyn VersioningTransport)
    }

    fn type_filtering(&self) -> Option<&dyn TypeFilterTransport> {
        self.server_filter.then_some(self as &dyn TypeFilterTransport)
    }
}

#[async_trait]
impl WritingTransport for MockTransport {
    async fn assert_valid_name(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn store_nodes(&self, nodes: Vec<Node>) -> anyhow::Result<()> {
        let paths: Vec<String> = nodes.iter().map(|n| n.path.clone()).collect();
        self.record(RecordedCall::StoreNodes(paths));
        if *self.fail_store.lock().unwrap() {
            return Err(anyhow!("simulated storage failure"));
        }
        let mut backend = self.backend.lock().unwrap();
        for node in &nodes {
            Self::apply_store(&mut backend, node);
        }
        Ok(())
    }

    async fn move_nodes(&self, moves: Vec<PathMove>) -> anyhow::Result<()> {
        self.record(RecordedCall::MoveNodes(
            moves
                .iter()
                .map(|m| (m.src_path.clone(), m.dst_path.clone()))
                .collect(),
        ));
        let mut backend = self.backend.lock().unwrap();
        for m in &moves {
            Self::apply_move(&mut backend, &m.src_path, &m.dst_path);
        }
        Ok(())
    }

    async fn delete_nodes(&self, paths: Vec<String>) -> anyhow::Result<()> {
        self.record(RecordedCall::DeleteNodes(paths.clone()));
        let mut backend = self.backend.lock().unwrap();
        for p in &paths {
            Self::apply_delete(&mut backend, p);
        }
        Ok(())
    }

    async fn delete_properties(&self, paths: Vec<String>) -> anyhow::Result<()> {
        self.record(RecordedCall::DeleteProperties(paths.clone()));
        let mut backend = self.backend.lock().unwrap();
        for property_path in &paths {
            let parent = parent_of(property_path);
            let name = name_of(property_path);
            if let Some(record) = backend.records.get_mut(&parent) {
                record.remove(&name);
            }
        }
        Ok(())
    }

    async fn update_properties(&self, node: &Node) -> anyhow::Result<()> {
        self.record(RecordedCall::UpdateProperties(node.path.clone()));
        let mut backend = self.backend.lock().unwrap();
        let children = backend.children.get(&node.path).cloned();
        Self::apply_store(&mut backend, node);
        if let Some(children) = children {
            backend.children.insert(node.path.clone(), children);
        }
        Ok(())
    }

    async fn reorder_children(
        &self,
        path: &str,
        reorders: Vec<ChildReorder>,
    ) -> anyhow::Result<()> {
        self.record(RecordedCall::ReorderChildren(
            path.to_string(),
            reorders
                .iter()
                .map(|r| (r.name.clone(), r.before.clone()))
                .collect(),
        ));
        let mut backend = self.backend.lock().unwrap();
        if let Some(children) = backend.children.get_mut(path) {
            for step in &reorders {
                children.retain(|c| *c != step.name);
                let at = step
                    .before
                    .as_ref()
                    .and_then(|b| children.iter().position(|c| c == b));
                match at {
                    Some(pos) => children.insert(pos, step.name.clone()),
                    None => children.push(step.name.clone()),
                }
            }
        }
        Ok(())
    }

    async fn copy_node(
        &self,
        src_path: &str,
        dst_path: &str,
        _src_workspace: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(RecordedCall::CopyNode(
            src_path.to_string(),
            dst_path.to_string(),
        ));
        let mut backend = self.backend.lock().unwrap();
        let copied: Vec<(String, Map<String, Value>)> = backend
            .records
            .iter()
            .filter(|(p, _)| covers(src_path, p))
            .map(|(p, r)| {
                (
                    format!("{}{}", dst_path, &p[src_path.len()..]),
                    r.clone(),
                )
            })
            .collect();
        let child_lists: Vec<(String, Vec<String>)> = backend
            .children
            .iter()
            .filter(|(p, _)| covers(src_path, p))
            .map(|(p, c)| {
                (
                    format!("{}{}", dst_path, &p[src_path.len()..]),
                    c.clone(),
                )
            })
            .collect();
        for (p, r) in copied {
            backend.records.insert(p, r);
        }
        for (p, c) in child_lists {
            backend.children.insert(p, c);
        }
        let siblings = backend.children.entry(parent_of(dst_path)).or_default();
        let name = name_of(dst_path);
        if !siblings.contains(&name) {
            siblings.push(name);
        }
        Ok(())
    }

    async fn clone_from(
        &self,
        _src_workspace: &str,
        src_path: &str,
        dst_path: &str,
        _remove_existing: bool,
    ) -> anyhow::Result<()> {
        self.copy_node(src_path, dst_path, None).await
    }

    async fn move_node_immediately(&self, src_path: &str, dst_path: &str) -> anyhow::Result<()> {
        self.record(RecordedCall::MoveImmediately(
            src_path.to_string(),
            dst_path.to_string(),
        ));
        let mut backend = self.backend.lock().unwrap();
        Self::apply_move(&mut backend, src_path, dst_path);
        Ok(())
    }

    async fn delete_node_immediately(&self, path: &str) -> anyhow::Result<()> {
        self.record(RecordedCall::DeleteImmediately(path.to_string()));
        let mut backend = self.backend.lock().unwrap();
        Self::apply_delete(&mut backend, path);
        Ok(())
    }

    async fn delete_property_immediately(&self, path: &str) -> anyhow::Result<()> {
        self.record(RecordedCall::DeletePropertyImmediately(path.to_string()));
        let mut backend = self.backend.lock().unwrap();
        let parent = parent_of(path);
        let name = name_of(path);
        if let Some(record) = backend.records.get_mut(&parent) {
            record.remove(&name);
        }
        Ok(())
    }

    async fn prepare_save(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::PrepareSave);
        Ok(())
    }

    async fn finish_save(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::FinishSave);
        Ok(())
    }

    async fn rollback_save(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::RollbackSave);
        Ok(())
    }
}

#[async_trait]
impl TransactionTransport for MockTransport {
    async fn begin_transaction(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::BeginTransaction);
        Ok(())
    }

    async fn commit_transaction(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::CommitTransaction);
        if *self.fail_commit.lock().unwrap() {
            return Err(anyhow!("simulated commit refusal"));
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> anyhow::Result<()> {
        self.record(RecordedCall::RollbackTransaction);
        Ok(())
    }
}

#[async_trait]
impl VersioningTransport for MockTransport {
    async fn checkin(&self, path: &str) -> anyhow::Result<String> {
        self.record(RecordedCall::Checkin(path.to_string()));
        Ok(format!("/jcr:versions{}", path))
    }

    async fn checkout(&self, path: &str) -> anyhow::Result<()> {
        self.record(RecordedCall::Checkout(path.to_string()));
        Ok(())
    }

    async fn remove_version(&self, version_path: &str) -> anyhow::Result<()> {
        self.record(RecordedCall::RemoveVersion(version_path.to_string()));
        let mut backend = self.backend.lock().unwrap();
        Self::apply_delete(&mut backend, version_path);
        Ok(())
    }
}

#[async_trait]
impl TypeFilterTransport for MockTransport {
    async fn get_nodes_filtered(
        &self,
        paths: Vec<String>,
        type_filter: Vec<String>,
    ) -> anyhow::Result<HashMap<String, Value>> {
        let backend = self.backend.lock().unwrap();
        Ok(paths
            .into_iter()
            .filter_map(|p| {
                let payload = build_payload(&backend, &p)?;
                let record = payload.as_object()?;
                let primary = record.get("jcr:primaryType").and_then(Value::as_str);
                let mixins: Vec<&str> = record
                    .get("jcr:mixinTypes")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let matched = type_filter
                    .iter()
                    .any(|f| Some(f.as_str()) == primary || mixins.contains(&f.as_str()));
                matched.then_some((p, payload))
            })
            .collect())
    }
}
