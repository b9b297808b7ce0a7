//! # Entity Registry
//!
//! The set of entities a session synchronizes, and the order their
//! mutations are pushed in.
//!
//! ## Registration
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  EntityConfig::new("quotes")                                           │
//! │      .page_size(50)                                                    │
//! │      .sequential()                                                     │
//! │      .depends_on(&["clients"])                                         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  EntityRegistry::register                                              │
//! │      ├── validate identifiers, endpoints, page size                    │
//! │      ├── insert into DependencyGraph (replace keeps position)          │
//! │      ├── topological sort ── cycle? ──► InvalidConfig, no change       │
//! │      └── store config + new push order                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use fieldops_core::validation::{validate_endpoint, validate_identifier, validate_page_size};
use fieldops_core::{entities, ConcurrencyClass, DependencyGraph, DEFAULT_PAGE_SIZE};
use fieldops_db::Database;

/// Maps a record between its server and local shapes.
pub type RecordTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Writes pulled records of an entity whose local shape is not one row per
/// record (e.g. a parent row plus child line items).
///
/// Records reaching the writer already passed the pending-mutation guard.
#[async_trait]
pub trait RelationalWriter: Send + Sync {
    /// Writes the records and returns how many were stored.
    async fn write(&self, db: &Database, records: Vec<Value>) -> SyncResult<usize>;
}

/// How pulled records reach local storage.
#[derive(Clone, Default)]
pub enum WriteStrategy {
    /// Chunked upsert into the entity's record table.
    #[default]
    DefaultUpsert,
    /// Delegated entirely to a custom writer.
    CustomRelational(Arc<dyn RelationalWriter>),
}

impl WriteStrategy {
    pub fn is_custom(&self) -> bool {
        matches!(self, WriteStrategy::CustomRelational(_))
    }
}

impl std::fmt::Debug for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::DefaultUpsert => f.write_str("DefaultUpsert"),
            WriteStrategy::CustomRelational(_) => f.write_str("CustomRelational"),
        }
    }
}

/// Everything the engine needs to sync one entity.
#[derive(Clone)]
pub struct EntityConfig {
    pub name: String,
    pub pull_endpoint: String,
    pub push_endpoint: String,
    pub table: String,
    pub page_size: u32,
    /// Server → local, applied to every pulled record.
    pub to_local: Option<RecordTransform>,
    /// Local → server, applied to every pushed record.
    pub to_server: Option<RecordTransform>,
    pub write_strategy: WriteStrategy,
    pub concurrency: ConcurrencyClass,
    /// Entities whose mutations must be pushed first.
    pub depends_on: Vec<String>,
}

impl EntityConfig {
    /// Creates a config with conventional endpoints:
    /// `sync/{name}` for pulls, `sync/{name}/push` for pushes.
    ///
    /// Well-known entities start out depending on the entities their
    /// records reference (quotes on clients, payments on invoices, ...).
    /// [`depends_on`](Self::depends_on) replaces that list.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let depends_on = entities::parents(&name)
            .iter()
            .map(|parent| parent.to_string())
            .collect();
        EntityConfig {
            pull_endpoint: format!("sync/{}", name),
            push_endpoint: format!("sync/{}/push", name),
            table: name.clone(),
            name,
            page_size: DEFAULT_PAGE_SIZE,
            to_local: None,
            to_server: None,
            write_strategy: WriteStrategy::DefaultUpsert,
            concurrency: ConcurrencyClass::Unclassified,
            depends_on,
        }
    }

    pub fn pull_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.pull_endpoint = endpoint.into();
        self
    }

    pub fn push_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.push_endpoint = endpoint.into();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn to_local(mut self, transform: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.to_local = Some(Arc::new(transform));
        self
    }

    pub fn to_server(mut self, transform: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.to_server = Some(Arc::new(transform));
        self
    }

    pub fn custom_writer(mut self, writer: Arc<dyn RelationalWriter>) -> Self {
        self.write_strategy = WriteStrategy::CustomRelational(writer);
        self
    }

    pub fn parallel_safe(mut self) -> Self {
        self.concurrency = ConcurrencyClass::ParallelSafe;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.concurrency = ConcurrencyClass::Sequential;
        self
    }

    pub fn depends_on(mut self, entities: &[&str]) -> Self {
        self.depends_on = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Applies the server → local transform, if any.
    pub fn apply_to_local(&self, record: Value) -> Value {
        match &self.to_local {
            Some(transform) => transform(record),
            None => record,
        }
    }

    /// Applies the local → server transform, if any.
    pub fn apply_to_server(&self, record: Value) -> Value {
        match &self.to_server {
            Some(transform) => transform(record),
            None => record,
        }
    }

    /// Checks names, endpoints and page size.
    pub fn validate(&self) -> SyncResult<()> {
        let invalid = |e: fieldops_core::ValidationError| {
            SyncError::InvalidConfig(format!("entity '{}': {}", self.name, e))
        };

        validate_identifier("name", &self.name).map_err(invalid)?;
        validate_identifier("table", &self.table).map_err(invalid)?;
        validate_endpoint("pull_endpoint", &self.pull_endpoint).map_err(invalid)?;
        validate_endpoint("push_endpoint", &self.push_endpoint).map_err(invalid)?;
        validate_page_size(self.page_size).map_err(invalid)?;

        if self.depends_on.iter().any(|dep| *dep == self.name) {
            return Err(SyncError::InvalidConfig(format!(
                "entity '{}' depends on itself",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityConfig")
            .field("name", &self.name)
            .field("pull_endpoint", &self.pull_endpoint)
            .field("push_endpoint", &self.push_endpoint)
            .field("table", &self.table)
            .field("page_size", &self.page_size)
            .field("write_strategy", &self.write_strategy)
            .field("concurrency", &self.concurrency)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Registered entities in registration order, plus the derived push order.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    configs: Vec<Arc<EntityConfig>>,
    graph: DependencyGraph,
    push_order: Vec<String>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces an entity.
    ///
    /// A replaced entity keeps its original position. On error the
    /// registry is left unchanged.
    pub fn register(&mut self, config: EntityConfig) -> SyncResult<Arc<EntityConfig>> {
        config.validate()?;

        let mut graph = self.graph.clone();
        graph.insert(config.name.clone(), config.depends_on.clone());
        let push_order = graph.topological_order()?;

        let config = Arc::new(config);
        match self.configs.iter_mut().find(|c| c.name == config.name) {
            Some(slot) => *slot = config.clone(),
            None => self.configs.push(config.clone()),
        }
        self.graph = graph;
        self.push_order = push_order;

        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityConfig>> {
        self.configs.iter().find(|c| c.name == name).cloned()
    }

    /// Like [`get`](Self::get), as a configuration error when missing.
    pub fn require(&self, name: &str) -> SyncResult<Arc<EntityConfig>> {
        self.get(name)
            .ok_or_else(|| SyncError::UnregisteredEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.contains(name)
    }

    /// Configs in registration order.
    pub fn entities(&self) -> Vec<Arc<EntityConfig>> {
        self.configs.clone()
    }

    /// Entity names, dependencies first.
    pub fn push_order(&self) -> &[String] {
        &self.push_order
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Drops every registration (logout).
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EntityConfig::new("clients");
        assert_eq!(config.pull_endpoint, "sync/clients");
        assert_eq!(config.push_endpoint, "sync/clients/push");
        assert_eq!(config.table, "clients");
        assert_eq!(config.concurrency, ConcurrencyClass::Unclassified);
        assert!(!config.write_strategy.is_custom());
        assert!(config.depends_on.is_empty());
    }

    #[test]
    fn test_well_known_entities_depend_on_their_parents() {
        assert_eq!(EntityConfig::new(entities::QUOTES).depends_on, [entities::CLIENTS]);
        assert_eq!(
            EntityConfig::new(entities::INVOICES).depends_on,
            [entities::CLIENTS, entities::WORK_ORDERS]
        );
        assert!(EntityConfig::new("sites").depends_on.is_empty());

        let mut registry = EntityRegistry::new();
        for name in [entities::PAYMENTS, entities::INVOICES, entities::WORK_ORDERS, entities::QUOTES, entities::CLIENTS] {
            registry.register(EntityConfig::new(name)).unwrap();
        }
        assert_eq!(
            registry.push_order(),
            [entities::CLIENTS, entities::QUOTES, entities::WORK_ORDERS, entities::INVOICES, entities::PAYMENTS]
        );
    }

    #[test]
    fn test_push_order_follows_dependencies() {
        let mut registry = EntityRegistry::new();
        registry
            .register(EntityConfig::new("quotes").depends_on(&["clients"]))
            .unwrap();
        registry.register(EntityConfig::new("clients")).unwrap();

        assert_eq!(registry.push_order(), ["clients", "quotes"]);
        let names: Vec<_> = registry.entities().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, ["quotes", "clients"]);
    }

    #[test]
    fn test_cycle_leaves_registry_unchanged() {
        let mut registry = EntityRegistry::new();
        registry
            .register(EntityConfig::new("a").depends_on(&["b"]))
            .unwrap();

        let err = registry
            .register(EntityConfig::new("b").depends_on(&["a"]))
            .unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains("b"));
    }

    #[test]
    fn test_replace_by_name() {
        let mut registry = EntityRegistry::new();
        registry.register(EntityConfig::new("clients").page_size(50)).unwrap();
        registry.register(EntityConfig::new("sites")).unwrap();
        registry.register(EntityConfig::new("clients").page_size(25)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("clients").unwrap().page_size, 25);
        assert_eq!(registry.entities()[0].name, "clients");
    }

    #[test]
    fn test_invalid_configs() {
        let mut registry = EntityRegistry::new();
        assert!(registry.register(EntityConfig::new("Bad Name")).is_err());
        assert!(registry.register(EntityConfig::new("clients").page_size(0)).is_err());
        assert!(registry
            .register(EntityConfig::new("clients").pull_endpoint("https://x/y"))
            .is_err());
        assert!(registry
            .register(EntityConfig::new("clients").depends_on(&["clients"]))
            .is_err());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.require("clients"),
            Err(SyncError::UnregisteredEntity(_))
        ));
    }

    #[test]
    fn test_transforms() {
        let config = EntityConfig::new("clients").to_local(|mut value| {
            value["local"] = Value::Bool(true);
            value
        });
        let out = config.apply_to_local(serde_json::json!({"id": "c-1"}));
        assert_eq!(out["local"], true);
        assert_eq!(config.apply_to_server(serde_json::json!(1)), serde_json::json!(1));
    }
}
