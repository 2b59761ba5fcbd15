//! The data view: CRUD intents in, optimistic cache patches and transaction
//! operations out.
//!
//! With a transaction manager every intent becomes an operation and a tagged
//! row in the cache; manager events later strip, revert or invalidate those
//! rows. Without one, intents run at once with a snapshot to restore on error.

use dk_core::{
    new_operation_id, DataViewConfig, Mutation, NewOperation, OperationTrigger, Transaction, TransactionConfig,
    TransactionResult,
};
use dk_transaction::{
    EventKind, Registration, Subscription, TransactionEvent, TransactionManager, TransactionRegistry,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapter::{patch_rows, DefaultAdapter, ResponseAdapter};
use crate::cache::{MemoryCache, QueryCache};
use crate::client::{ClientCompensator, CrudClient};
use crate::error::{DataViewError, Result};
use crate::filter::{apply_filter, FilterField};
use crate::overlay::{self, PendingState};
use crate::query::{FilterValue, QueryKey, QueryParams, Sort, SortDirection};
use crate::render::{ColumnDescriptor, FilterRenderer, FormRenderer, RowAction, Selection, TableRenderer};

type ErrorCallback = Arc<dyn Fn(&DataViewError) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Recorded in the open transaction; the server sees it on commit.
    Queued { operation_id: String },
    /// Executed at once, with the server's reply.
    Applied(Value),
}

impl ChangeOutcome {
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            ChangeOutcome::Queued { operation_id } => Some(operation_id),
            ChangeOutcome::Applied(_) => None,
        }
    }
}

/// One cached row split into entity and overlay metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub id: Option<String>,
    pub entity: Value,
    pub pending: Option<PendingState>,
    pub operation_id: Option<String>,
    pub temporary: bool,
}

impl RowView {
    fn from_row(row: &Value, id_field: &str) -> Self {
        let tag = overlay::pending_tag(row);
        let entity = overlay::entity(row);
        Self {
            id: overlay::row_id(&entity, id_field),
            pending: tag.as_ref().map(|t| t.state),
            operation_id: tag.map(|t| t.operation_id),
            temporary: overlay::temp_id(row).is_some(),
            entity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageView {
    pub rows: Vec<RowView>,
    pub total: usize,
    /// The page is missing or invalidated and should be refetched.
    pub stale: bool,
}

impl PageView {
    pub fn pending_rows(&self) -> impl Iterator<Item = &RowView> {
        self.rows.iter().filter(|r| r.pending.is_some())
    }
}

/// State reachable from manager event handlers and mutation closures.
struct Shared {
    resource: String,
    id_field: String,
    cache: Arc<dyn QueryCache>,
    adapter: Arc<dyn ResponseAdapter>,
    on_error: Option<ErrorCallback>,
    on_success: Option<SuccessCallback>,
}

impl Shared {
    /// Rewrite the rows of every cached page of the resource.
    fn patch_all(&self, f: impl Fn(Vec<Value>) -> Vec<Value>) -> usize {
        let adapter = self.adapter.as_ref();
        self.cache
            .set_matching(&self.resource, &|response| patch_rows(adapter, response, &f))
    }

    fn patch_page(&self, key: &QueryKey, f: impl Fn(Vec<Value>) -> Vec<Value>) {
        let adapter = self.adapter.as_ref();
        self.cache
            .set(key, &|previous| previous.map(|response| patch_rows(adapter, response, &f)));
    }

    fn revert(&self, operation_ids: &HashSet<String>) -> usize {
        self.patch_all(|rows| overlay::revert_operations(rows, operation_ids))
    }

    fn notify_error(&self, error: &DataViewError) {
        tracing::warn!(resource = %self.resource, error = %error, "data view error");
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }

    fn report(&self, error: DataViewError) -> DataViewError {
        self.notify_error(&error);
        error
    }

    fn succeed(&self, message: &str) {
        if let Some(callback) = &self.on_success {
            callback(message);
        }
    }
}

fn operation_ids(transaction: &Transaction) -> HashSet<String> {
    transaction.operations.iter().map(|op| op.id.clone()).collect()
}

/// Apply `f` to the rows whose id is `id`.
fn map_row(rows: Vec<Value>, id_field: &str, id: &str, f: impl Fn(&mut Value)) -> Vec<Value> {
    rows.into_iter()
        .map(|mut row| {
            if overlay::row_id(&row, id_field).as_deref() == Some(id) {
                f(&mut row);
            }
            row
        })
        .collect()
}

fn subscribe(manager: &TransactionManager, shared: &Arc<Shared>) -> Vec<Subscription> {
    let mut subscriptions = Vec::with_capacity(5);

    let s = shared.clone();
    subscriptions.push(manager.on(EventKind::TransactionCancelled, move |event| {
        if let TransactionEvent::TransactionCancelled { transaction } = event {
            let pages = s.revert(&operation_ids(transaction));
            tracing::debug!(resource = %s.resource, tx = %transaction.id, pages, "pending rows reverted");
        }
    }));

    let s = shared.clone();
    subscriptions.push(manager.on(EventKind::OperationRemoved, move |event| {
        if let TransactionEvent::OperationRemoved { operation, .. } = event {
            s.revert(&HashSet::from([operation.id.clone()]));
        }
    }));

    let s = shared.clone();
    subscriptions.push(manager.on(EventKind::TransactionComplete, move |event| {
        if let TransactionEvent::TransactionComplete { transaction, results } = event {
            let ids = operation_ids(transaction);
            s.patch_all(|rows| overlay::strip_operations(rows, &ids));
            s.cache.invalidate(&s.resource);
            s.succeed(&format!("{} change(s) saved", results.len()));
        }
    }));

    let s = shared.clone();
    subscriptions.push(manager.on(EventKind::TransactionError, move |event| {
        if let TransactionEvent::TransactionError { error, .. } = event {
            s.notify_error(&DataViewError::CommitFailed(error.clone()));
        }
    }));

    let s = shared.clone();
    subscriptions.push(manager.on(EventKind::RollbackComplete, move |event| {
        if let TransactionEvent::RollbackComplete { transaction, .. } = event {
            s.revert(&operation_ids(transaction));
            s.cache.invalidate(&s.resource);
        }
    }));

    subscriptions
}

pub struct DataViewBuilder {
    resource: String,
    client: Arc<dyn CrudClient>,
    cache: Option<Arc<dyn QueryCache>>,
    adapter: Option<Arc<dyn ResponseAdapter>>,
    config: DataViewConfig,
    manager: Option<Arc<TransactionManager>>,
    transaction: Option<TransactionConfig>,
    registry: Option<(TransactionRegistry, String)>,
    filters: Vec<FilterField>,
    on_error: Option<ErrorCallback>,
    on_success: Option<SuccessCallback>,
}

impl DataViewBuilder {
    /// Share a cache between views; each view gets its own otherwise.
    pub fn cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ResponseAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn config(mut self, config: DataViewConfig) -> Self {
        self.config = config;
        self
    }

    /// Route intents through an existing manager.
    pub fn manager(mut self, manager: Arc<TransactionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Build a dedicated manager whose compensations go through the client.
    pub fn transactional(mut self, config: TransactionConfig) -> Self {
        self.transaction = Some(config);
        self
    }

    /// Register the view's manager under `view_id` for as long as the view lives.
    pub fn registry(mut self, registry: &TransactionRegistry, view_id: impl Into<String>) -> Self {
        self.registry = Some((registry.clone(), view_id.into()));
        self
    }

    pub fn filters(mut self, filters: Vec<FilterField>) -> Self {
        self.filters = filters;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&DataViewError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> DataView {
        let DataViewBuilder {
            resource,
            client,
            cache,
            adapter,
            config,
            manager,
            transaction,
            registry,
            filters,
            on_error,
            on_success,
        } = self;

        let manager = manager.or_else(|| {
            transaction.map(|tx_config| {
                let mut builder = TransactionManager::builder()
                    .config(tx_config)
                    .compensator(Arc::new(ClientCompensator::new(client.clone(), config.id_field.clone())));
                if let Some((_, view_id)) = &registry {
                    builder = builder.id(view_id.clone());
                }
                builder.build()
            })
        });

        let shared = Arc::new(Shared {
            resource,
            id_field: config.id_field.clone(),
            cache: cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
            adapter: adapter.unwrap_or_else(|| Arc::new(DefaultAdapter::default())),
            on_error,
            on_success,
        });

        let subscriptions = manager
            .as_deref()
            .map(|m| subscribe(m, &shared))
            .unwrap_or_default();

        let registration = match (&manager, registry) {
            (Some(manager), Some((registry, view_id))) => Some(registry.register(view_id, manager.clone())),
            (None, Some((_, view_id))) => {
                tracing::debug!(view = %view_id, "view has no transaction manager, not registered");
                None
            }
            _ => None,
        };

        DataView {
            params: RwLock::new(QueryParams::new(config.page_size)),
            shared,
            client,
            config,
            manager,
            filters,
            _subscriptions: subscriptions,
            _registration: registration,
        }
    }
}

/// A paged CRUD collection bound to a cache and, optionally, a transaction
/// manager.
pub struct DataView {
    shared: Arc<Shared>,
    client: Arc<dyn CrudClient>,
    config: DataViewConfig,
    manager: Option<Arc<TransactionManager>>,
    params: RwLock<QueryParams>,
    filters: Vec<FilterField>,
    _subscriptions: Vec<Subscription>,
    _registration: Option<Registration>,
}

impl DataView {
    pub fn builder(resource: impl Into<String>, client: Arc<dyn CrudClient>) -> DataViewBuilder {
        DataViewBuilder {
            resource: resource.into(),
            client,
            cache: None,
            adapter: None,
            config: DataViewConfig::default(),
            manager: None,
            transaction: None,
            registry: None,
            filters: Vec::new(),
            on_error: None,
            on_success: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    pub fn manager(&self) -> Option<&Arc<TransactionManager>> {
        self.manager.as_ref()
    }

    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.shared.cache
    }

    pub fn filters(&self) -> &[FilterField] {
        &self.filters
    }

    pub fn params(&self) -> QueryParams {
        self.params.read().clone()
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.shared.resource.clone(), self.params())
    }

    // ========== Reading ==========

    /// Fetch the current page and store it as fresh.
    pub async fn fetch(&self) -> Result<PageView> {
        let key = self.key();
        let response = match self.client.list(&key.resource, &key.params).await {
            Ok(response) => response,
            Err(e) => return Err(self.shared.report(e.into())),
        };
        tracing::debug!(resource = %key.resource, page = key.params.page, "page fetched");
        self.shared.cache.insert(key, response);
        Ok(self.rows())
    }

    /// The cached page when fresh, a refetch otherwise.
    pub async fn load(&self) -> Result<PageView> {
        if self.shared.cache.is_stale(&self.key()) {
            self.fetch().await
        } else {
            Ok(self.rows())
        }
    }

    /// The current page as cached, overlay included. Never hits the network.
    pub fn rows(&self) -> PageView {
        let key = self.key();
        let stale = self.shared.cache.is_stale(&key);
        let Some(response) = self.shared.cache.get(&key) else {
            return PageView { rows: Vec::new(), total: 0, stale };
        };
        let adapter = self.shared.adapter.as_ref();
        let rows = adapter
            .response_rows(&response)
            .iter()
            .map(|row| RowView::from_row(row, &self.config.id_field))
            .collect();
        PageView {
            rows,
            total: adapter.response_row_count(&response),
            stale,
        }
    }

    /// Raw cached row of the current page by id or temporary id.
    pub fn find_row(&self, id: &str) -> Option<Value> {
        let response = self.shared.cache.get(&self.key())?;
        self.shared
            .adapter
            .response_rows(&response)
            .into_iter()
            .find(|row| {
                overlay::row_id(row, &self.config.id_field).as_deref() == Some(id)
                    || overlay::temp_id(row) == Some(id)
            })
    }

    /// A row that exists server-side.
    fn persisted_row(&self, id: &str) -> Result<Value> {
        let row = self
            .find_row(id)
            .ok_or_else(|| DataViewError::RowNotFound(id.to_string()))?;
        if overlay::temp_id(&row).is_some() {
            return Err(DataViewError::TemporaryRow(id.to_string()));
        }
        Ok(row)
    }

    // ========== Intents ==========

    pub async fn create(&self, entity: Value) -> Result<ChangeOutcome> {
        let resource = self.shared.resource.clone();
        let temp = format!("temp-{}", Uuid::new_v4().simple());
        let mut row = entity.clone();
        if let Value::Object(map) = &mut row {
            map.entry(self.config.id_field.clone())
                .or_insert_with(|| Value::String(temp.clone()));
        }
        overlay::mark_temporary(&mut row, &temp);

        let Some(manager) = &self.manager else {
            let call = self.client.create(&resource, &entity);
            return self
                .apply_direct(
                    |mut rows| {
                        rows.insert(0, row.clone());
                        rows
                    },
                    call,
                    "created",
                )
                .await;
        };

        let mutation = {
            let client = self.client.clone();
            let shared = self.shared.clone();
            let temp = temp.clone();
            let body = entity.clone();
            Mutation::new(move || {
                let client = client.clone();
                let shared = shared.clone();
                let temp = temp.clone();
                let body = body.clone();
                async move {
                    let created = client.create(&shared.resource, &body).await?;
                    shared.patch_all(|rows| overlay::replace_temporary(rows, &temp, &created));
                    Ok(created)
                }
            })
        };
        // The row goes in before the operation is queued: an immediate
        // auto-commit may complete before add_operation returns.
        let operation_id = new_operation_id();
        if self.config.optimistic {
            overlay::tag_row(&mut row, PendingState::Added, &operation_id);
            self.shared.patch_page(&self.key(), |mut rows| {
                rows.insert(0, row.clone());
                rows
            });
        }

        let new = NewOperation::create(&resource, &temp, entity, mutation).with_id(operation_id.clone());
        if let Err(e) = manager.add_operation(new) {
            if self.config.optimistic {
                self.shared.revert(&HashSet::from([operation_id]));
            }
            return Err(self.shared.report(e.into()));
        }
        Ok(ChangeOutcome::Queued { operation_id })
    }

    pub async fn update(&self, id: &str, changes: Value) -> Result<ChangeOutcome> {
        self.update_row(id, changes, OperationTrigger::UserEdit).await
    }

    pub async fn delete(&self, id: &str) -> Result<ChangeOutcome> {
        self.delete_row(id, OperationTrigger::RowAction).await
    }

    /// Delete several rows as one bulk action. Stops at the first rejected id.
    pub async fn bulk_delete(&self, ids: &[String]) -> Result<Vec<ChangeOutcome>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.delete_row(id, OperationTrigger::BulkAction).await?);
        }
        Ok(outcomes)
    }

    pub async fn bulk_update(&self, ids: &[String], changes: Value) -> Result<Vec<ChangeOutcome>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.update_row(id, changes.clone(), OperationTrigger::BulkAction).await?);
        }
        Ok(outcomes)
    }

    async fn update_row(&self, id: &str, changes: Value, trigger: OperationTrigger) -> Result<ChangeOutcome> {
        let row = self.persisted_row(id)?;
        let resource = self.shared.resource.clone();
        let id_field = self.config.id_field.clone();

        let Some(manager) = &self.manager else {
            let call = self.client.update(&resource, id, &changes);
            return self
                .apply_direct(
                    |rows| map_row(rows, &id_field, id, |row| overlay::merge(row, &changes)),
                    call,
                    "updated",
                )
                .await;
        };

        let original = overlay::entity(&row);
        let mut next = original.clone();
        overlay::merge(&mut next, &changes);
        let changed_fields: Vec<String> = changes
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let mutation = {
            let client = self.client.clone();
            let resource = resource.clone();
            let id = id.to_string();
            let changes = changes.clone();
            Mutation::new(move || {
                let client = client.clone();
                let resource = resource.clone();
                let id = id.clone();
                let changes = changes.clone();
                async move { client.update(&resource, &id, &changes).await }
            })
        };
        let operation_id = new_operation_id();
        if self.config.optimistic {
            self.shared.patch_all(|rows| {
                map_row(rows, &id_field, id, |row| {
                    overlay::tag_row(row, PendingState::Edited, &operation_id);
                    overlay::merge(row, &changes);
                })
            });
        }

        let new = NewOperation::update(&resource, id, next, original, mutation)
            .with_id(operation_id.clone())
            .trigger(trigger)
            .changed_fields(changed_fields);
        self.queue(manager, new, id, &row)?;
        Ok(ChangeOutcome::Queued { operation_id })
    }

    async fn delete_row(&self, id: &str, trigger: OperationTrigger) -> Result<ChangeOutcome> {
        let row = self.persisted_row(id)?;
        let resource = self.shared.resource.clone();
        let id_field = self.config.id_field.clone();

        let Some(manager) = &self.manager else {
            let call = self.client.delete(&resource, id);
            return self
                .apply_direct(
                    |rows| {
                        rows.into_iter()
                            .filter(|row| overlay::row_id(row, &id_field).as_deref() != Some(id))
                            .collect()
                    },
                    call,
                    "deleted",
                )
                .await;
        };

        let mutation = {
            let client = self.client.clone();
            let resource = resource.clone();
            let id = id.to_string();
            Mutation::new(move || {
                let client = client.clone();
                let resource = resource.clone();
                let id = id.clone();
                async move { client.delete(&resource, &id).await }
            })
        };
        let operation_id = new_operation_id();
        if self.config.optimistic {
            self.shared.patch_all(|rows| {
                map_row(rows, &id_field, id, |row| {
                    overlay::tag_row(row, PendingState::Deleted, &operation_id)
                })
            });
        }

        let new = NewOperation::delete(&resource, id, overlay::entity(&row), mutation)
            .with_id(operation_id.clone())
            .trigger(trigger);
        self.queue(manager, new, id, &row)?;
        Ok(ChangeOutcome::Queued { operation_id })
    }

    /// Queue an operation whose row is already tagged. A refused operation
    /// puts `previous` back in every cached page.
    fn queue(&self, manager: &TransactionManager, new: NewOperation, id: &str, previous: &Value) -> Result<()> {
        if let Err(e) = manager.add_operation(new) {
            if self.config.optimistic {
                let id_field = &self.config.id_field;
                self.shared
                    .patch_all(|rows| map_row(rows, id_field, id, |row| *row = previous.clone()));
            }
            return Err(self.shared.report(e.into()));
        }
        Ok(())
    }

    /// Run a change right away: patch the current page, call the server,
    /// put the snapshot back if it fails. The resource is invalidated either way.
    async fn apply_direct<F>(
        &self,
        patch: impl Fn(Vec<Value>) -> Vec<Value>,
        call: F,
        action: &str,
    ) -> Result<ChangeOutcome>
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        let key = self.key();
        let snapshot = self.shared.cache.get(&key);
        if self.config.optimistic {
            self.shared.patch_page(&key, patch);
        }

        let outcome = call.await;
        match outcome {
            Ok(value) => {
                self.shared.cache.invalidate(&self.shared.resource);
                self.shared
                    .succeed(&format!("{} {}", self.shared.resource, action));
                Ok(ChangeOutcome::Applied(value))
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.shared.cache.set(&key, &|_| Some(snapshot.clone()));
                }
                self.shared.cache.invalidate(&self.shared.resource);
                Err(self.shared.report(e.into()))
            }
        }
    }

    // ========== Transaction control ==========

    /// Drop one queued operation and undo its visual effect.
    pub fn discard_change(&self, operation_id: &str) -> bool {
        self.manager
            .as_ref()
            .is_some_and(|m| m.remove_operation(operation_id))
    }

    /// Commit pending changes, skipping any confirmation step.
    ///
    /// Failures are also delivered to `on_error` through the manager's events.
    pub async fn commit(&self) -> Result<Vec<TransactionResult>> {
        match &self.manager {
            Some(manager) => Ok(manager.commit(true).await?),
            None => Ok(Vec::new()),
        }
    }

    pub fn cancel(&self) -> bool {
        self.manager.as_ref().is_some_and(|m| m.cancel())
    }

    pub fn pending_count(&self) -> usize {
        self.manager
            .as_ref()
            .map_or(0, |m| m.get_operations().len())
    }

    pub fn has_pending(&self) -> bool {
        self.manager.as_ref().is_some_and(|m| m.has_operations())
    }

    // ========== Query ==========

    pub fn set_query(&self, params: QueryParams) {
        *self.params.write() = params;
    }

    /// Validate and apply one filter value; the view returns to the first page.
    pub fn set_filter(&self, name: &str, value: FilterValue) -> Result<()> {
        apply_filter(&mut self.params.write(), &self.filters, name, value)
    }

    pub fn clear_filters(&self) {
        let mut params = self.params.write();
        params.filters.clear();
        params.page = 0;
    }

    pub fn set_page(&self, page: usize) {
        self.params.write().page = page;
    }

    pub fn set_sort(&self, field: impl Into<String>, direction: SortDirection) {
        self.params.write().sort = Some(Sort { field: field.into(), direction });
    }

    // ========== Rendering ==========

    pub fn render_table(
        &self,
        renderer: &mut dyn TableRenderer,
        columns: &[ColumnDescriptor],
        actions: &[RowAction],
        selection: &Selection,
    ) {
        let page = self.rows();
        renderer.render_table(&page.rows, page.total, columns, actions, selection);
    }

    pub fn render_filters(&self, renderer: &mut dyn FilterRenderer) {
        let values = self.params.read().filters.clone();
        renderer.render_filters(&self.filters, &values);
    }

    /// Render a create form (`row_id` is `None`) or an edit form seeded from
    /// the cached row.
    pub fn render_form(
        &self,
        renderer: &mut dyn FormRenderer,
        fields: &[FilterField],
        row_id: Option<&str>,
    ) -> Result<()> {
        let initial = match row_id {
            Some(id) => {
                let row = self
                    .find_row(id)
                    .ok_or_else(|| DataViewError::RowNotFound(id.to_string()))?;
                overlay::entity(&row)
            }
            None => Value::Object(Map::new()),
        };
        renderer.render_form(fields, &initial);
        Ok(())
    }
}

impl std::fmt::Debug for DataView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataView")
            .field("resource", &self.shared.resource)
            .field("id_field", &self.shared.id_field)
            .field("params", &*self.params.read())
            .field("manager", &self.manager.as_ref().map(|m| m.id().to_string()))
            .finish()
    }
}
