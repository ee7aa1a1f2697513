//! Config flow types
//!
//! A config flow is a small wizard: every step either shows a form, shows a
//! progress spinner, creates a config entry or aborts. Flows are hosted by
//! the [`FlowManager`](crate::FlowManager).

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;
use fints_config_entries::ConfigEntriesError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manager::FlowManager;

/// Errors raised while driving a flow
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("No flow registered for handler {0}")]
    UnknownHandler(String),

    #[error("Handler {handler} has no step {step_id}")]
    UnknownStep { handler: String, step_id: String },

    #[error("Invalid user input: {0}")]
    InvalidInput(String),

    #[error("Flow manager has shut down")]
    ManagerGone,

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

pub type FlowStepResult = Result<FlowResult, FlowError>;

/// Kind of step result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
    ShowProgress,
    ShowProgressDone,
}

/// Result of a config flow step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    /// Flow ID
    pub flow_id: String,
    /// Handler (integration domain)
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    /// Current step ID (form and progress types)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Always present, empty if no schema
    pub data_schema: Vec<FormField>,
    /// Errors from the previous submission
    pub errors: Option<HashMap<String, String>>,
    pub description_placeholders: Option<HashMap<String, String>>,
    /// Title (for create_entry type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Abort reason (for abort type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// What the progress spinner waits for (for show_progress type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_action: Option<String>,
    /// Step to run after show_progress_done
    #[serde(skip)]
    pub next_step_id: Option<String>,
    /// Entry data (for create_entry); holds credentials, never serialized
    #[serde(skip)]
    pub data: Option<HashMap<String, serde_json::Value>>,
    /// Unique id of the entry to create
    #[serde(skip)]
    pub unique_id: Option<String>,
    /// Created entry id and title, filled in by the manager
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl FlowResult {
    fn empty(result_type: FlowResultType) -> Self {
        Self {
            flow_id: String::new(),
            handler: String::new(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            description_placeholders: None,
            title: None,
            reason: None,
            progress_action: None,
            next_step_id: None,
            data: None,
            unique_id: None,
            result: None,
            version: None,
        }
    }

    /// Show a form for `step_id`
    pub fn form(step_id: impl Into<String>, data_schema: Vec<FormField>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            data_schema,
            ..Self::empty(FlowResultType::Form)
        }
    }

    /// Finish the flow by creating a config entry
    pub fn create_entry(
        title: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
        unique_id: Option<String>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            data: Some(data),
            unique_id,
            version: Some(1),
            ..Self::empty(FlowResultType::CreateEntry)
        }
    }

    /// Finish the flow without creating anything
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(FlowResultType::Abort)
        }
    }

    /// Show a spinner while a background task runs
    pub fn show_progress(step_id: impl Into<String>, progress_action: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            progress_action: Some(progress_action.into()),
            ..Self::empty(FlowResultType::ShowProgress)
        }
    }

    /// The background task is done; continue with `next_step_id`
    pub fn show_progress_done(next_step_id: impl Into<String>) -> Self {
        Self {
            next_step_id: Some(next_step_id.into()),
            ..Self::empty(FlowResultType::ShowProgressDone)
        }
    }

    pub fn with_errors(mut self, errors: HashMap<String, String>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Shorthand for `errors = {"base": error}`
    pub fn with_base_error(self, error: &str) -> Self {
        self.with_errors(HashMap::from([("base".to_string(), error.to_string())]))
    }

    pub fn with_placeholders(mut self, placeholders: HashMap<String, String>) -> Self {
        self.description_placeholders = Some(placeholders);
        self
    }

    /// Whether the flow ends with this result
    pub fn is_finished(&self) -> bool {
        matches!(
            self.result_type,
            FlowResultType::CreateEntry | FlowResultType::Abort
        )
    }

    /// The `errors.base` value, if any
    pub fn base_error(&self) -> Option<&str> {
        self.errors
            .as_ref()
            .and_then(|e| e.get("base"))
            .map(String::as_str)
    }
}

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FormField {
    pub fn string(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type: "string".to_string(),
            required,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Option<serde_json::Value>) -> Self {
        self.default = default;
        self
    }
}

/// Handle a flow uses to reach its manager
///
/// Background tasks keep a clone to push the flow forward once they finish.
#[derive(Clone)]
pub struct FlowContext {
    pub(crate) flow_id: String,
    pub(crate) handler: String,
    pub(crate) manager: Weak<FlowManager>,
}

impl FlowContext {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Whether an entry with this unique id already exists for the handler
    pub fn is_configured(&self, unique_id: &str) -> bool {
        self.manager
            .upgrade()
            .map(|m| m.entries().is_configured(&self.handler, unique_id))
            .unwrap_or(false)
    }

    /// Feed input to the flow's current step, as the frontend would
    pub async fn configure(&self, user_input: Option<serde_json::Value>) -> FlowStepResult {
        let manager = self.manager.upgrade().ok_or(FlowError::ManagerGone)?;
        let result = manager.progress(&self.flow_id, user_input).await?;
        manager.notify_progressed(&result);
        Ok(result)
    }
}

/// A config flow for one integration
#[async_trait]
pub trait ConfigFlow: Send {
    /// Step run when the flow starts
    fn init_step(&self) -> &'static str {
        "user"
    }

    /// Run `step_id` with the submitted input (`None` when first shown)
    async fn async_step(
        &mut self,
        step_id: &str,
        user_input: Option<serde_json::Value>,
        ctx: &FlowContext,
    ) -> FlowStepResult;
}

/// Trait for driving configuration flows from a frontend
#[async_trait]
pub trait ConfigFlowHandler: Send + Sync {
    /// Start a new configuration flow for an integration
    async fn start_flow(&self, handler: &str) -> FlowStepResult;

    /// Continue a flow with user input
    async fn progress_flow(
        &self,
        flow_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> FlowStepResult;

    /// Active flows as `{flow_id, handler, step_id}`
    async fn list_flows(&self) -> Vec<serde_json::Value>;
}
