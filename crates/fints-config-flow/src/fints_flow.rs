//! The FinTS setup flow
//!
//! `user` collects the login and asks the bank for its SEPA accounts. If the
//! bank asks for a TAN, the paused dialog is kept and the flow either waits
//! for the pushTAN in the background (`wait_for_tan`) or lets the user confirm
//! manually (`confirm_tan`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fints_client::{run_blocking, FinTsClient};
use fints_core::{
    BankError, BankResult, ClientFactory, DialogData, NeedTanResponse, SepaAccount,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::flow::{ConfigFlow, FlowContext, FlowError, FlowResult, FlowStepResult};
use crate::manager::FlowFactory;
use crate::schema::{user_data_schema, UserInput};
use crate::tan::{self, PendingTan, TanPollConfig, TanProgress};

const CONFIRM_TAN_MESSAGE: &str =
    "Please confirm the pushTAN on your smartphone, then click 'Submit'.";
const WAIT_FOR_TAN_DESCRIPTION: &str = "Please confirm the pushTAN on your smartphone.";

/// What the first account lookup found
enum Detected {
    Accounts(Vec<SepaAccount>),
    NeedTan(NeedTanResponse),
}

/// Bootstrap the client and list the SEPA accounts
///
/// Blocks on bank I/O. On a TAN demand the dialog is left open.
fn detect_accounts(client: &FinTsClient) -> BankResult<Detected> {
    if let Err(err) = client.bootstrap() {
        warn!("Could not initialize FinTS client: {}", err);
    }
    match client.with_dialog(|c| c.get_sepa_accounts()) {
        Ok(accounts) => Ok(Detected::Accounts(accounts)),
        Err(BankError::NeedTan(challenge)) => Ok(Detected::NeedTan(challenge)),
        Err(err) => Err(err),
    }
}

/// Config flow adding a FinTS bank login
pub struct FinTsConfigFlow {
    factory: Arc<dyn ClientFactory>,
    tan_config: TanPollConfig,
    user_input: Option<UserInput>,
    pending: Option<Arc<PendingTan>>,
    tan_task: Option<JoinHandle<()>>,
}

impl FinTsConfigFlow {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            tan_config: TanPollConfig::default(),
            user_input: None,
            pending: None,
            tan_task: None,
        }
    }

    pub fn with_tan_config(mut self, tan_config: TanPollConfig) -> Self {
        self.tan_config = tan_config;
        self
    }

    /// Factory for [`FlowManager::register`](crate::FlowManager::register)
    pub fn flow_factory(factory: Arc<dyn ClientFactory>, tan_config: TanPollConfig) -> FlowFactory {
        Arc::new(move || {
            Box::new(Self::new(factory.clone()).with_tan_config(tan_config)) as Box<dyn ConfigFlow>
        })
    }

    fn user_form(&self, error: Option<&str>) -> FlowResult {
        let form = FlowResult::form("user", user_data_schema(self.user_input.as_ref()));
        match error {
            Some(error) => form.with_base_error(error),
            None => form,
        }
    }

    fn confirm_tan_form(&self) -> FlowResult {
        FlowResult::form("confirm_tan", Vec::new()).with_placeholders(HashMap::from([(
            "message".to_string(),
            CONFIRM_TAN_MESSAGE.to_string(),
        )]))
    }

    /// Finish with an entry for the submitted login
    fn create_entry(&self, ctx: &FlowContext, system_id: Option<String>) -> FlowStepResult {
        let Some(input) = self.user_input.as_ref() else {
            return Ok(self.user_form(Some("unknown")));
        };

        let unique_id = input.unique_id();
        if ctx.is_configured(&unique_id) {
            return Ok(FlowResult::abort("already_configured"));
        }

        let data = input.entry_data(system_id).to_data();
        Ok(FlowResult::create_entry(
            input.display_name(),
            data,
            Some(unique_id),
        ))
    }

    async fn step_user(&mut self, user_input: Option<Value>, ctx: &FlowContext) -> FlowStepResult {
        let Some(raw) = user_input else {
            return Ok(self.user_form(None));
        };
        let input = UserInput::parse(&raw)?;

        let client = Arc::new(FinTsClient::new(
            input.credentials(),
            input.display_name(),
            HashMap::new(),
            HashMap::new(),
            self.factory.clone(),
        ));
        self.user_input = Some(input);

        let detected = {
            let client = client.clone();
            run_blocking(move || detect_accounts(&client)).await
        };

        match detected {
            Ok(Detected::Accounts(accounts)) if !accounts.is_empty() => {
                info!("Found {} SEPA accounts", accounts.len());
                self.create_entry(ctx, client.system_id())
            }
            Ok(Detected::Accounts(_)) => {
                warn!("Bank returned no SEPA accounts");
                Ok(self.user_form(Some("cannot_connect")))
            }
            Ok(Detected::NeedTan(challenge)) => {
                let decoupled = challenge.decoupled;
                info!(decoupled, "Bank requires a TAN to list accounts");
                if let Err(err) = self.handle_tan_challenge(client, challenge, None).await {
                    warn!("Could not pause dialog for TAN: {}", err);
                    return Ok(self.user_form(Some("cannot_connect")));
                }
                if decoupled {
                    Ok(self.step_wait_for_tan(None, ctx))
                } else {
                    self.step_confirm_tan(None, ctx).await
                }
            }
            Err(err) => {
                warn!("Could not connect to bank: {}", err);
                Ok(self.user_form(Some("cannot_connect")))
            }
        }
    }

    /// Keep the client and its paused dialog until the TAN is confirmed
    ///
    /// Without `dialog`, the client's open dialog is paused now.
    async fn handle_tan_challenge(
        &mut self,
        client: Arc<FinTsClient>,
        challenge: NeedTanResponse,
        dialog: Option<DialogData>,
    ) -> BankResult<()> {
        let pending = match dialog {
            Some(dialog) => PendingTan::new(client, challenge, Some(dialog)),
            None => run_blocking(move || PendingTan::pause(client, challenge)).await?,
        };
        if let Some(task) = self.tan_task.take() {
            task.abort();
        }
        self.pending = Some(Arc::new(pending));
        Ok(())
    }

    async fn step_confirm_tan(
        &mut self,
        user_input: Option<Value>,
        ctx: &FlowContext,
    ) -> FlowStepResult {
        if user_input.is_some() {
            return self.step_tan_confirmed(ctx).await;
        }
        Ok(self.confirm_tan_form())
    }

    async fn step_tan_confirmed(&mut self, ctx: &FlowContext) -> FlowStepResult {
        let Some(pending) = self.pending.clone() else {
            return Ok(self.user_form(Some("unknown")));
        };

        let task = pending.clone();
        match run_blocking(move || task.submit()).await {
            Ok(TanProgress::Confirmed(accounts)) if !accounts.is_empty() => {
                self.create_entry(ctx, pending.client().system_id())
            }
            Ok(TanProgress::Confirmed(_)) => {
                warn!("No SEPA accounts after TAN confirmation");
                Ok(self.confirm_tan_form())
            }
            Ok(TanProgress::Pending) => {
                debug!("TAN not confirmed yet");
                Ok(self.confirm_tan_form())
            }
            Err(err) => {
                warn!("Error after TAN confirmation: {}", err);
                Ok(self.confirm_tan_form())
            }
        }
    }

    fn step_wait_for_tan(&mut self, user_input: Option<Value>, ctx: &FlowContext) -> FlowResult {
        if user_input.is_some() {
            let failed = self.pending.as_ref().map_or(true, |p| p.tan_error());
            if failed {
                return self.user_form(Some("tan_failed"));
            }
            return FlowResult::show_progress_done("tan_done");
        }

        let running = self.tan_task.as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            debug!(flow_id = ctx.flow_id(), "Starting pushTAN waiter");
            self.tan_task = Some(tokio::spawn(tan::wait_for_tan(
                self.pending.clone(),
                self.tan_config,
                ctx.clone(),
            )));
        }

        FlowResult::show_progress("wait_for_tan", "wait_for_tan").with_placeholders(HashMap::from(
            [(
                "description".to_string(),
                WAIT_FOR_TAN_DESCRIPTION.to_string(),
            )],
        ))
    }

    fn step_tan_done(&self, ctx: &FlowContext) -> FlowStepResult {
        let system_id = self.pending.as_ref().and_then(|p| p.client().system_id());
        match system_id {
            Some(ref id) => info!("Saved system id {}", id),
            None => debug!("Bank assigned no system id"),
        }
        self.create_entry(ctx, system_id)
    }
}

#[async_trait]
impl ConfigFlow for FinTsConfigFlow {
    async fn async_step(
        &mut self,
        step_id: &str,
        user_input: Option<Value>,
        ctx: &FlowContext,
    ) -> FlowStepResult {
        match step_id {
            "user" => self.step_user(user_input, ctx).await,
            "confirm_tan" => self.step_confirm_tan(user_input, ctx).await,
            "tan_confirmed" => self.step_tan_confirmed(ctx).await,
            "wait_for_tan" => Ok(self.step_wait_for_tan(user_input, ctx)),
            "tan_done" => self.step_tan_done(ctx),
            other => Err(FlowError::UnknownStep {
                handler: ctx.handler().to_string(),
                step_id: other.to_string(),
            }),
        }
    }
}

impl Drop for FinTsConfigFlow {
    fn drop(&mut self) {
        if let Some(task) = self.tan_task.take() {
            task.abort();
        }
    }
}
