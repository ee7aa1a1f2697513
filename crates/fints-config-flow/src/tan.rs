//! pushTAN confirmation
//!
//! A [`PendingTan`] keeps the client whose dialog was paused on a TAN
//! challenge. Confirming means resuming that dialog and sending an empty TAN
//! until the bank reports the order as done.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fints_client::{run_blocking, FinTsClient};
use fints_core::{BankResult, DialogData, NeedTanResponse, SepaAccount, TanOutcome};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::flow::FlowContext;

/// Timing of the background TAN waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TanPollConfig {
    /// Pause before each confirmation attempt
    pub interval: Duration,
    pub attempts: u32,
    /// Extra wait before the first attempt on a decoupled challenge
    pub decoupled_delay: Duration,
}

impl Default for TanPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            attempts: 6,
            decoupled_delay: Duration::from_secs(30),
        }
    }
}

/// Result of one confirmation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TanProgress {
    /// The bank accepted the order; these are the accounts it returned
    Confirmed(Vec<SepaAccount>),
    /// Not confirmed yet; the dialog is paused again
    Pending,
}

#[derive(Debug)]
struct PendingState {
    challenge: NeedTanResponse,
    dialog: Option<DialogData>,
    tan_error: bool,
    tan_sent: bool,
}

/// A TAN challenge waiting for confirmation
pub struct PendingTan {
    client: Arc<FinTsClient>,
    state: Mutex<PendingState>,
}

impl PendingTan {
    pub fn new(
        client: Arc<FinTsClient>,
        challenge: NeedTanResponse,
        dialog: Option<DialogData>,
    ) -> Self {
        Self {
            client,
            state: Mutex::new(PendingState {
                challenge,
                dialog,
                tan_error: false,
                tan_sent: false,
            }),
        }
    }

    /// Pause the client's open dialog and keep it for later
    ///
    /// Blocks on bank I/O.
    pub fn pause(client: Arc<FinTsClient>, challenge: NeedTanResponse) -> BankResult<Self> {
        let dialog = client.with_client(|c| c.pause_dialog())?;
        Ok(Self::new(client, challenge, Some(dialog)))
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client(&self) -> &Arc<FinTsClient> {
        &self.client
    }

    pub fn challenge(&self) -> NeedTanResponse {
        self.lock().challenge.clone()
    }

    pub fn is_decoupled(&self) -> bool {
        self.lock().challenge.decoupled
    }

    pub fn tan_error(&self) -> bool {
        self.lock().tan_error
    }

    pub fn set_tan_error(&self) {
        self.lock().tan_error = true;
    }

    pub fn tan_sent(&self) -> bool {
        self.lock().tan_sent
    }

    pub fn mark_tan_sent(&self) {
        self.lock().tan_sent = true;
    }

    /// Whether a paused dialog is waiting to be resumed
    pub fn has_dialog(&self) -> bool {
        self.lock().dialog.is_some()
    }

    /// Send an empty TAN and fetch the accounts once the bank accepts it
    ///
    /// Blocks on bank I/O. Resumes the paused dialog, or opens a new one if
    /// there is none. A still pending order leaves the dialog paused again
    /// with the bank's latest challenge stored. If the bank fails before the
    /// TAN went through, the paused dialog is kept for the next attempt.
    pub fn submit(&self) -> BankResult<TanProgress> {
        let (challenge, dialog) = {
            let mut state = self.lock();
            (state.challenge.clone(), state.dialog.take())
        };
        let saved = dialog.clone();

        let submitted = self.client.with_client(|client| {
            match dialog {
                Some(data) => client.resume_dialog(data)?,
                None => client.open_dialog()?,
            }

            let still_pending = match client.send_tan(&challenge, "")? {
                TanOutcome::NeedTan(next) => Some(next),
                TanOutcome::Completed => client.init_tan_response(),
            };
            if let Some(next) = still_pending {
                let paused = client.pause_dialog()?;
                return Ok(Submitted::StillPending(next, paused));
            }

            let accounts = client.get_sepa_accounts();
            if let Err(err) = client.close_dialog() {
                warn!("Could not close dialog: {}", err);
            }
            Ok(Submitted::Done(accounts))
        });

        match submitted {
            Ok(Submitted::Done(accounts)) => {
                let accounts = accounts?;
                info!("TAN confirmed, {} accounts found", accounts.len());
                Ok(TanProgress::Confirmed(accounts))
            }
            Ok(Submitted::StillPending(next, paused)) => {
                debug!(reference = %next.reference, "TAN still pending");
                let mut state = self.lock();
                state.challenge = next;
                state.dialog = Some(paused);
                Ok(TanProgress::Pending)
            }
            Err(err) => {
                if let Some(dialog) = saved {
                    self.lock().dialog.get_or_insert(dialog);
                }
                Err(err)
            }
        }
    }
}

/// What one submission left behind
enum Submitted {
    /// The TAN went through and the dialog is closed
    Done(BankResult<Vec<SepaAccount>>),
    StillPending(NeedTanResponse, DialogData),
}

impl std::fmt::Debug for PendingTan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTan")
            .field("client", &self.client.name())
            .field("state", &*self.lock())
            .finish()
    }
}

/// Make one confirmation attempt
///
/// Returns `true` once the bank accepted the TAN and returned at least one
/// account. Errors are logged and flag the challenge as failed.
pub async fn send_pending_tan(pending: Option<&Arc<PendingTan>>, config: &TanPollConfig) -> bool {
    let Some(pending) = pending else {
        warn!("No pending TAN challenge to confirm");
        return false;
    };

    if pending.is_decoupled() && !pending.tan_sent() {
        debug!(
            "Waiting {:?} for the decoupled TAN to be confirmed",
            config.decoupled_delay
        );
        tokio::time::sleep(config.decoupled_delay).await;
        pending.mark_tan_sent();
    }

    let task = Arc::clone(pending);
    match run_blocking(move || task.submit()).await {
        Ok(TanProgress::Confirmed(accounts)) => !accounts.is_empty(),
        Ok(TanProgress::Pending) => false,
        Err(err) => {
            warn!("Sending TAN failed: {}", err);
            pending.set_tan_error();
            false
        }
    }
}

/// Background task polling the bank until the pushTAN is confirmed
///
/// Pushes `{}` into the flow on success and `{"error": "timeout"}` once all
/// attempts are used up or an attempt failed.
pub async fn wait_for_tan(
    pending: Option<Arc<PendingTan>>,
    config: TanPollConfig,
    ctx: FlowContext,
) {
    for attempt in 1..=config.attempts {
        tokio::time::sleep(config.interval).await;
        debug!(flow_id = ctx.flow_id(), attempt, "Checking pushTAN confirmation");

        if send_pending_tan(pending.as_ref(), &config).await {
            info!(flow_id = ctx.flow_id(), "pushTAN confirmed");
            if let Err(err) = ctx.configure(Some(json!({}))).await {
                warn!("Could not continue flow after TAN: {}", err);
            }
            return;
        }
        if pending.as_ref().is_some_and(|p| p.tan_error()) {
            break;
        }
    }

    warn!(flow_id = ctx.flow_id(), "pushTAN was not confirmed");
    if let Some(pending) = &pending {
        pending.set_tan_error();
    }
    if let Err(err) = ctx.configure(Some(json!({"error": "timeout"}))).await {
        warn!("Could not report TAN timeout: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fints_core::testing::{MockBank, MockBankFactory};
    use fints_core::{BankCredentials, BankError};
    use std::collections::HashMap;

    fn challenge(decoupled: bool) -> NeedTanResponse {
        NeedTanResponse {
            challenge: "Bitte bestätigen Sie in Ihrer App".to_string(),
            decoupled,
            reference: "ref-1".to_string(),
        }
    }

    fn fast_config() -> TanPollConfig {
        TanPollConfig {
            interval: Duration::from_millis(1),
            attempts: 3,
            decoupled_delay: Duration::from_millis(1),
        }
    }

    fn pending_for(bank: MockBank) -> Arc<PendingTan> {
        let client = Arc::new(FinTsClient::new(
            BankCredentials::new("12030000", "max", "1234", "https://banking.example"),
            "Test",
            HashMap::new(),
            HashMap::new(),
            Arc::new(MockBankFactory::new(bank)),
        ));
        Arc::new(PendingTan::pause(client, challenge(true)).unwrap())
    }

    fn bank_with_account(polls: u32) -> MockBank {
        MockBank::new("max")
            .with_account(
                fints_core::SepaAccount::new(Some("DE02120300000000202051"), "202051", "12030000"),
                Some(1),
            )
            .with_pending_tan(challenge(true), polls)
    }

    #[test]
    fn test_submit_pending_then_confirmed() {
        let bank = bank_with_account(1);
        let pending = pending_for(bank.clone());
        assert!(pending.has_dialog());

        assert_eq!(pending.submit().unwrap(), TanProgress::Pending);
        assert!(pending.has_dialog());
        assert!(bank.state().paused);

        let TanProgress::Confirmed(accounts) = pending.submit().unwrap() else {
            panic!("TAN not confirmed");
        };
        assert_eq!(accounts.len(), 1);
        assert!(!pending.has_dialog());
        assert!(!bank.state().dialog_open);
        assert_eq!(bank.call_count("resume_dialog"), 2);
    }

    #[test]
    fn test_submit_error() {
        let bank = bank_with_account(0);
        bank.state().send_tan_error = Some(BankError::Protocol("9050".to_string()));
        let pending = pending_for(bank);

        assert!(pending.submit().is_err());
    }

    #[tokio::test]
    async fn test_send_pending_tan_without_challenge() {
        assert!(!send_pending_tan(None, &fast_config()).await);
    }

    #[tokio::test]
    async fn test_send_pending_tan_marks_decoupled_sent() {
        let pending = pending_for(bank_with_account(0));
        assert!(!pending.tan_sent());

        assert!(send_pending_tan(Some(&pending), &fast_config()).await);
        assert!(pending.tan_sent());
        assert!(!pending.tan_error());
    }

    #[tokio::test]
    async fn test_send_pending_tan_error_sets_flag() {
        let bank = bank_with_account(0);
        bank.state().send_tan_error = Some(BankError::Connection("reset".to_string()));
        let pending = pending_for(bank);

        assert!(!send_pending_tan(Some(&pending), &fast_config()).await);
        assert!(pending.tan_error());
    }

    #[tokio::test]
    async fn test_send_pending_tan_no_accounts() {
        let bank = MockBank::new("max").with_pending_tan(challenge(true), 0);
        let pending = pending_for(bank);

        assert!(!send_pending_tan(Some(&pending), &fast_config()).await);
        assert!(!pending.tan_error());
    }

    #[test]
    fn test_submit_completed_but_bank_asks_again() {
        let follow_up = NeedTanResponse {
            reference: "ref-2".to_string(),
            ..challenge(true)
        };
        let bank = bank_with_account(0).with_pending_after_submit(follow_up);
        let pending = pending_for(bank.clone());

        assert_eq!(pending.submit().unwrap(), TanProgress::Pending);
        assert_eq!(pending.challenge().reference, "ref-2");
        assert!(pending.has_dialog());
        assert!(bank.state().paused);

        assert!(matches!(
            pending.submit().unwrap(),
            TanProgress::Confirmed(ref accounts) if accounts.len() == 1
        ));
    }

    #[test]
    fn test_failed_resume_keeps_paused_dialog() {
        let bank = bank_with_account(0);
        let pending = pending_for(bank.clone());
        bank.state().resume_error = Some(BankError::Connection("reset".to_string()));

        assert!(pending.submit().is_err());
        assert!(pending.has_dialog());

        assert!(matches!(pending.submit().unwrap(), TanProgress::Confirmed(_)));
        assert_eq!(bank.call_count("resume_dialog"), 2);
        assert_eq!(bank.call_count("open_dialog"), 0);
    }
}
