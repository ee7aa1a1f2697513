//! Config flow for adding a FinTS bank login
//!
//! The [`FlowManager`] hosts flows and persists the entries they create.
//! [`FinTsConfigFlow`] asks for the login, checks it against the bank and
//! walks the user through the pushTAN confirmation when the bank wants one.
//!
//! # Steps
//!
//! - `user` - login form and account detection
//! - `confirm_tan` / `tan_confirmed` - manual confirmation after a TAN demand
//! - `wait_for_tan` / `tan_done` - background polling for a decoupled pushTAN

mod fints_flow;
mod flow;
mod manager;
mod schema;
mod tan;

pub use fints_flow::FinTsConfigFlow;
pub use flow::{
    ConfigFlow, ConfigFlowHandler, FlowContext, FlowError, FlowResult, FlowResultType,
    FlowStepResult, FormField,
};
pub use manager::{FlowFactory, FlowManager};
pub use schema::{user_data_schema, UserInput};
pub use tan::{send_pending_tan, wait_for_tan, PendingTan, TanPollConfig, TanProgress};
