//! Flow manager
//!
//! Hosts the active flows, routes user input to their current step and turns
//! finished flows into config entries.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use fints_config_entries::{ConfigEntries, ConfigEntriesError, ConfigEntry};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

use crate::flow::{
    ConfigFlow, ConfigFlowHandler, FlowContext, FlowError, FlowResult, FlowResultType,
    FlowStepResult,
};

/// Creates a fresh flow for a handler
pub type FlowFactory = Arc<dyn Fn() -> Box<dyn ConfigFlow> + Send + Sync>;

/// Capacity of the progress and entry-created channels
const CHANNEL_CAPACITY: usize = 64;

struct ActiveFlow {
    handler: String,
    step_id: String,
    flow: Box<dyn ConfigFlow>,
}

/// Hosts config flows
pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    handlers: DashMap<String, FlowFactory>,
    flows: DashMap<String, Arc<Mutex<ActiveFlow>>>,
    /// Results pushed by background tasks
    progressed: broadcast::Sender<FlowResult>,
    /// Entries created by finished flows
    created: broadcast::Sender<ConfigEntry>,
    this: Weak<FlowManager>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Arc<Self> {
        let (progressed, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (created, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            entries,
            handlers: DashMap::new(),
            flows: DashMap::new(),
            progressed,
            created,
            this: this.clone(),
        })
    }

    /// Register the flow factory for a handler (integration domain)
    pub fn register(&self, handler: impl Into<String>, factory: FlowFactory) {
        let handler = handler.into();
        debug!("Registered config flow handler: {}", handler);
        self.handlers.insert(handler, factory);
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    /// Receive results that background tasks pushed into a flow
    pub fn subscribe_progressed(&self) -> broadcast::Receiver<FlowResult> {
        self.progressed.subscribe()
    }

    /// Receive entries created by finished flows
    pub fn subscribe_created(&self) -> broadcast::Receiver<ConfigEntry> {
        self.created.subscribe()
    }

    pub(crate) fn notify_progressed(&self, result: &FlowResult) {
        trace!(flow_id = %result.flow_id, "Flow progressed");
        // No subscribers is fine
        let _ = self.progressed.send(result.clone());
    }

    /// Whether a flow with this id is still active
    pub fn has_flow(&self, flow_id: &str) -> bool {
        self.flows.contains_key(flow_id)
    }

    fn context(&self, flow_id: &str, handler: &str) -> FlowContext {
        FlowContext {
            flow_id: flow_id.to_string(),
            handler: handler.to_string(),
            manager: self.this.clone(),
        }
    }

    /// Run the current step of a flow with `user_input`
    pub async fn progress(&self, flow_id: &str, user_input: Option<Value>) -> FlowStepResult {
        let flow = self
            .flows
            .get(flow_id)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let mut active = flow.lock().await;
        // Finished while we waited for the lock
        if !self.has_flow(flow_id) {
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }

        let ctx = self.context(flow_id, &active.handler);
        let step_id = active.step_id.clone();
        debug!(flow_id, step_id = %step_id, "Running flow step");
        let result = active.flow.async_step(&step_id, user_input, &ctx).await?;
        self.handle_result(flow_id, &mut active, result).await
    }

    async fn handle_result(
        &self,
        flow_id: &str,
        active: &mut ActiveFlow,
        mut result: FlowResult,
    ) -> FlowStepResult {
        result.flow_id = flow_id.to_string();
        result.handler = active.handler.clone();

        match result.result_type {
            FlowResultType::Form | FlowResultType::ShowProgress => {
                if let Some(ref step_id) = result.step_id {
                    active.step_id = step_id.clone();
                }
            }
            FlowResultType::ShowProgressDone => {
                if let Some(ref next) = result.next_step_id {
                    active.step_id = next.clone();
                    result.step_id = Some(next.clone());
                }
            }
            FlowResultType::CreateEntry => {
                // A storage error keeps the flow so the step can be retried
                let result = self.create_entry(&active.handler, result).await?;
                self.flows.remove(flow_id);
                return Ok(result);
            }
            FlowResultType::Abort => {
                self.flows.remove(flow_id);
                info!(
                    flow_id,
                    "Flow {} aborted: {}",
                    active.handler,
                    result.reason.as_deref().unwrap_or("")
                );
            }
        }
        Ok(result)
    }

    async fn create_entry(&self, handler: &str, mut result: FlowResult) -> FlowStepResult {
        let title = result.title.clone().unwrap_or_default();
        let mut entry =
            ConfigEntry::new(handler, &title).with_data(result.data.take().unwrap_or_default());
        if let Some(ref unique_id) = result.unique_id {
            entry = entry.with_unique_id(unique_id);
        }
        if let Some(version) = result.version {
            entry = entry.with_version(version);
        }

        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                let mut abort = FlowResult::abort("already_configured");
                abort.flow_id = result.flow_id;
                abort.handler = result.handler;
                return Ok(abort);
            }
            Err(err) => return Err(err.into()),
        };

        result.result = Some(json!({
            "entry_id": entry.entry_id,
            "title": entry.title,
        }));
        if self.created.send(entry).is_err() {
            trace!("No listener for created entries");
        }
        Ok(result)
    }

    /// Drop a flow without finishing it
    pub fn abort_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        self.flows
            .remove(flow_id)
            .map(|_| debug!(flow_id, "Flow aborted by user"))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))
    }
}

#[async_trait]
impl ConfigFlowHandler for FlowManager {
    async fn start_flow(&self, handler: &str) -> FlowStepResult {
        let factory = self
            .handlers
            .get(handler)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(handler.to_string()))?;

        let flow = factory();
        let flow_id = Ulid::new().to_string();
        let step_id = flow.init_step().to_string();
        self.flows.insert(
            flow_id.clone(),
            Arc::new(Mutex::new(ActiveFlow {
                handler: handler.to_string(),
                step_id,
                flow,
            })),
        );
        info!(flow_id = %flow_id, "Started config flow for {}", handler);

        let result = self.progress(&flow_id, None).await;
        if result.is_err() {
            self.flows.remove(&flow_id);
        }
        result
    }

    async fn progress_flow(&self, flow_id: &str, user_input: Option<Value>) -> FlowStepResult {
        let result = self.progress(flow_id, user_input).await;
        if let Err(ref err) = result {
            warn!(flow_id, "Flow step failed: {}", err);
        }
        result
    }

    async fn list_flows(&self) -> Vec<Value> {
        let flows: Vec<(String, Arc<Mutex<ActiveFlow>>)> = self
            .flows
            .iter()
            .map(|f| (f.key().clone(), f.value().clone()))
            .collect();

        let mut listed = Vec::with_capacity(flows.len());
        for (flow_id, flow) in flows {
            let active = flow.lock().await;
            listed.push(json!({
                "flow_id": flow_id,
                "handler": active.handler,
                "step_id": active.step_id,
            }));
        }
        listed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fints_config_entries::Storage;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Two-step flow: a form, then an entry titled with the submitted name
    struct NameFlow;

    #[async_trait]
    impl ConfigFlow for NameFlow {
        async fn async_step(
            &mut self,
            step_id: &str,
            user_input: Option<Value>,
            ctx: &FlowContext,
        ) -> FlowStepResult {
            match (step_id, user_input) {
                ("user", None) => Ok(FlowResult::form("user", Vec::new())),
                ("user", Some(input)) => {
                    let name = input["name"].as_str().unwrap_or("unnamed").to_string();
                    if ctx.is_configured(&name) {
                        return Ok(FlowResult::abort("already_configured"));
                    }
                    if name == "slow" {
                        return Ok(FlowResult::show_progress_done("finish"));
                    }
                    let data = HashMap::from([("name".to_string(), Value::String(name.clone()))]);
                    Ok(FlowResult::create_entry(&name, data, Some(name.clone())))
                }
                ("finish", _) => Ok(FlowResult::create_entry("slow", HashMap::new(), None)),
                (other, _) => Err(FlowError::UnknownStep {
                    handler: ctx.handler().to_string(),
                    step_id: other.to_string(),
                }),
            }
        }
    }

    fn create_test_manager() -> (TempDir, Arc<FlowManager>) {
        let temp_dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(temp_dir.path()))));
        let manager = FlowManager::new(entries);
        manager.register("test", Arc::new(|| Box::new(NameFlow) as Box<dyn ConfigFlow>));
        (temp_dir, manager)
    }

    #[tokio::test]
    async fn test_start_flow_shows_form() {
        let (_dir, manager) = create_test_manager();

        let result = manager.start_flow("test").await.unwrap();
        assert_eq!(result.result_type, FlowResultType::Form);
        assert_eq!(result.handler, "test");
        assert!(manager.has_flow(&result.flow_id));

        let flows = manager.list_flows().await;
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0]["step_id"], "user");
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let (_dir, manager) = create_test_manager();
        assert!(matches!(
            manager.start_flow("nope").await,
            Err(FlowError::UnknownHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_create_entry_persists_and_finishes() {
        let (_dir, manager) = create_test_manager();
        let mut created = manager.subscribe_created();

        let form = manager.start_flow("test").await.unwrap();
        let result = manager
            .progress_flow(&form.flow_id, Some(json!({"name": "Bank"})))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(result.result.as_ref().unwrap()["title"], "Bank");
        assert!(!manager.has_flow(&form.flow_id));
        assert!(manager.entries().is_configured("test", "Bank"));
        assert_eq!(created.recv().await.unwrap().title, "Bank");
    }

    #[tokio::test]
    async fn test_duplicate_entry_aborts() {
        let (_dir, manager) = create_test_manager();
        for _ in 0..2 {
            let form = manager.start_flow("test").await.unwrap();
            let result = manager
                .progress_flow(&form.flow_id, Some(json!({"name": "Bank"})))
                .await
                .unwrap();
            if result.result_type == FlowResultType::Abort {
                assert_eq!(result.reason.as_deref(), Some("already_configured"));
                assert!(!manager.has_flow(&form.flow_id));
                return;
            }
        }
        panic!("second flow was not aborted");
    }

    #[tokio::test]
    async fn test_progress_done_moves_to_next_step() {
        let (_dir, manager) = create_test_manager();

        let form = manager.start_flow("test").await.unwrap();
        let done = manager
            .progress_flow(&form.flow_id, Some(json!({"name": "slow"})))
            .await
            .unwrap();
        assert_eq!(done.result_type, FlowResultType::ShowProgressDone);
        assert_eq!(done.step_id.as_deref(), Some("finish"));

        let result = manager.progress_flow(&form.flow_id, None).await.unwrap();
        assert_eq!(result.result_type, FlowResultType::CreateEntry);
    }

    #[tokio::test]
    async fn test_abort_flow() {
        let (_dir, manager) = create_test_manager();
        let form = manager.start_flow("test").await.unwrap();

        manager.abort_flow(&form.flow_id).unwrap();
        assert!(matches!(
            manager.progress_flow(&form.flow_id, None).await,
            Err(FlowError::UnknownFlow(_))
        ));
        assert!(manager.abort_flow(&form.flow_id).is_err());
    }

    #[tokio::test]
    async fn test_context_configure_notifies() {
        let (_dir, manager) = create_test_manager();
        let mut progressed = manager.subscribe_progressed();
        let form = manager.start_flow("test").await.unwrap();

        let ctx = manager.context(&form.flow_id, "test");
        let result = ctx.configure(Some(json!({"name": "slow"}))).await.unwrap();

        assert_eq!(result.result_type, FlowResultType::ShowProgressDone);
        let pushed = progressed.recv().await.unwrap();
        assert_eq!(pushed.flow_id, form.flow_id);
    }

    #[tokio::test]
    async fn test_storage_error_keeps_flow() {
        let (dir, manager) = create_test_manager();
        let storage_path = dir.path().join(".storage");
        std::fs::write(&storage_path, b"not a directory").unwrap();

        let form = manager.start_flow("test").await.unwrap();
        let result = manager
            .progress_flow(&form.flow_id, Some(json!({"name": "Bank"})))
            .await;

        assert!(matches!(result, Err(FlowError::Entries(_))));
        assert!(manager.has_flow(&form.flow_id));
        assert!(!manager.entries().is_configured("test", "Bank"));

        std::fs::remove_file(&storage_path).unwrap();
        let retry = manager
            .progress_flow(&form.flow_id, Some(json!({"name": "Bank"})))
            .await
            .unwrap();
        assert_eq!(retry.result_type, FlowResultType::CreateEntry);
        assert!(!manager.has_flow(&form.flow_id));
    }
}
