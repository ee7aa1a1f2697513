//! In-memory banking client for tests
//!
//! [`MockBank`] plays a scripted bank. Clones share their state, so a test can
//! keep one handle for assertions while another is boxed into the code under
//! test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bank::{BankingClient, ClientFactory};
use crate::error::{BankError, BankResult};
use crate::models::{
    AccountInformation, Balance, BankCredentials, BankInformation, DialogData, Holding,
    NeedTanResponse, SepaAccount, TanMechanism, TanMedium, TanOutcome,
};

/// Scripted bank behaviour and call log
#[derive(Debug, Default)]
pub struct MockBankState {
    pub user_id: String,
    pub system_id: Option<String>,
    pub accounts: Vec<SepaAccount>,
    pub information: BankInformation,
    pub balances: HashMap<String, Balance>,
    pub holdings: HashMap<String, Vec<Holding>>,
    pub tan_mechanisms: Vec<TanMechanism>,
    pub tan_media: Option<(u32, Vec<TanMedium>)>,
    /// Challenge raised by `get_sepa_accounts` until confirmed
    pub pending_tan: Option<NeedTanResponse>,
    /// How many `send_tan` calls are answered with "still pending"
    pub tan_polls_before_confirm: u32,
    /// System id handed out once the TAN is confirmed
    pub system_id_after_tan: Option<String>,
    /// Next challenge: the following `send_tan` completes but leaves this pending
    pub pending_after_submit: Option<NeedTanResponse>,
    /// Fails the next `resume_dialog`
    pub resume_error: Option<BankError>,
    pub accounts_error: Option<BankError>,
    pub send_tan_error: Option<BankError>,
    pub balance_error: Option<BankError>,
    pub information_error: Option<BankError>,
    pub selected_mechanism: Option<String>,
    pub selected_medium: Option<TanMedium>,
    pub dialog_open: bool,
    pub paused: bool,
    pub calls: Vec<String>,
}

/// Shared handle to a scripted bank
#[derive(Debug, Clone, Default)]
pub struct MockBank {
    state: Arc<Mutex<MockBankState>>,
}

impl MockBank {
    pub fn new(user_id: impl Into<String>) -> Self {
        let bank = Self::default();
        bank.state().user_id = user_id.into();
        bank
    }

    /// Lock the scripted state for setup or inspection
    pub fn state(&self) -> MutexGuard<'_, MockBankState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an account together with its information entry
    pub fn with_account(self, account: SepaAccount, account_type: Option<u32>) -> Self {
        {
            let mut state = self.state();
            state.information.accounts.push(AccountInformation {
                iban: account.iban.clone(),
                account_number: Some(account.accountnumber.clone()),
                account_type,
                ..Default::default()
            });
            state.accounts.push(account);
        }
        self
    }

    pub fn with_balance(self, accountnumber: &str, balance: Balance) -> Self {
        self.state()
            .balances
            .insert(accountnumber.to_string(), balance);
        self
    }

    pub fn with_holdings(self, accountnumber: &str, holdings: Vec<Holding>) -> Self {
        self.state()
            .holdings
            .insert(accountnumber.to_string(), holdings);
        self
    }

    /// Require a TAN that is confirmed after `polls` unsuccessful submissions
    pub fn with_pending_tan(self, challenge: NeedTanResponse, polls: u32) -> Self {
        {
            let mut state = self.state();
            state.pending_tan = Some(challenge);
            state.tan_polls_before_confirm = polls;
        }
        self
    }

    /// Answer the next submission with another challenge instead of confirming
    pub fn with_pending_after_submit(self, next: NeedTanResponse) -> Self {
        self.state().pending_after_submit = Some(next);
        self
    }

    pub fn with_tan_mechanisms(self, mechanisms: Vec<TanMechanism>) -> Self {
        self.state().tan_mechanisms = mechanisms;
        self
    }

    /// Names of all trait methods called so far
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == name).count()
    }

    fn record(&self, name: &str) -> MutexGuard<'_, MockBankState> {
        let mut state = self.state();
        state.calls.push(name.to_string());
        state
    }
}

impl BankingClient for MockBank {
    fn open_dialog(&mut self) -> BankResult<()> {
        self.record("open_dialog").dialog_open = true;
        Ok(())
    }

    fn close_dialog(&mut self) -> BankResult<()> {
        self.record("close_dialog").dialog_open = false;
        Ok(())
    }

    fn pause_dialog(&mut self) -> BankResult<DialogData> {
        let mut state = self.record("pause_dialog");
        state.paused = true;
        state.dialog_open = false;
        Ok(DialogData(b"paused".to_vec()))
    }

    fn resume_dialog(&mut self, _data: DialogData) -> BankResult<()> {
        let mut state = self.record("resume_dialog");
        if let Some(err) = state.resume_error.take() {
            return Err(err);
        }
        state.paused = false;
        state.dialog_open = true;
        Ok(())
    }

    fn get_tan_mechanisms(&mut self) -> BankResult<Vec<TanMechanism>> {
        Ok(self.record("get_tan_mechanisms").tan_mechanisms.clone())
    }

    fn set_tan_mechanism(&mut self, code: &str) -> BankResult<()> {
        self.record("set_tan_mechanism").selected_mechanism = Some(code.to_string());
        Ok(())
    }

    fn get_tan_media(&mut self) -> BankResult<(u32, Vec<TanMedium>)> {
        self.record("get_tan_media")
            .tan_media
            .clone()
            .ok_or_else(|| BankError::Unsupported("HKTAB".to_string()))
    }

    fn set_tan_medium(&mut self, medium: &TanMedium) -> BankResult<()> {
        self.record("set_tan_medium").selected_medium = Some(medium.clone());
        Ok(())
    }

    fn get_information(&mut self) -> BankResult<BankInformation> {
        let state = self.record("get_information");
        match &state.information_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.information.clone()),
        }
    }

    fn get_sepa_accounts(&mut self) -> BankResult<Vec<SepaAccount>> {
        let state = self.record("get_sepa_accounts");
        if let Some(err) = &state.accounts_error {
            return Err(err.clone());
        }
        if let Some(challenge) = &state.pending_tan {
            return Err(BankError::NeedTan(challenge.clone()));
        }
        Ok(state.accounts.clone())
    }

    fn send_tan(&mut self, challenge: &NeedTanResponse, _tan: &str) -> BankResult<TanOutcome> {
        let mut state = self.record("send_tan");
        if let Some(err) = &state.send_tan_error {
            return Err(err.clone());
        }
        if state.pending_tan.is_none() {
            return Ok(TanOutcome::Completed);
        }
        if let Some(next) = state.pending_after_submit.take() {
            state.pending_tan = Some(next);
            return Ok(TanOutcome::Completed);
        }
        if state.tan_polls_before_confirm > 0 {
            state.tan_polls_before_confirm -= 1;
            return Ok(TanOutcome::NeedTan(challenge.clone()));
        }
        state.pending_tan = None;
        if let Some(system_id) = state.system_id_after_tan.take() {
            state.system_id = Some(system_id);
        }
        Ok(TanOutcome::Completed)
    }

    fn init_tan_response(&self) -> Option<NeedTanResponse> {
        self.state().pending_tan.clone()
    }

    fn get_balance(&mut self, account: &SepaAccount) -> BankResult<Balance> {
        let state = self.record("get_balance");
        if let Some(err) = &state.balance_error {
            return Err(err.clone());
        }
        state
            .balances
            .get(&account.accountnumber)
            .cloned()
            .ok_or_else(|| BankError::Protocol(format!("no balance for {}", account.accountnumber)))
    }

    fn get_holdings(&mut self, account: &SepaAccount) -> BankResult<Vec<Holding>> {
        Ok(self
            .record("get_holdings")
            .holdings
            .get(&account.accountnumber)
            .cloned()
            .unwrap_or_default())
    }

    fn system_id(&self) -> Option<String> {
        self.state().system_id.clone()
    }

    fn user_id(&self) -> String {
        self.state().user_id.clone()
    }
}

/// Factory that hands out clones of one [`MockBank`]
#[derive(Debug, Clone, Default)]
pub struct MockBankFactory {
    bank: MockBank,
    connects: Arc<AtomicUsize>,
    fail: bool,
}

impl MockBankFactory {
    pub fn new(bank: MockBank) -> Self {
        Self {
            bank,
            connects: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    /// A factory whose every `connect` fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn bank(&self) -> &MockBank {
        &self.bank
    }

    /// Number of clients created so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MockBankFactory {
    fn connect(&self, credentials: &BankCredentials) -> BankResult<Box<dyn BankingClient>> {
        if self.fail {
            return Err(BankError::Connection(credentials.url.clone()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.bank.clone()))
    }
}
