//! Cached FinTS session

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fints_core::{
    AccountInformation, Balance, BankCredentials, BankError, BankResult, BankingClient,
    ClientFactory, Holding, SepaAccount, PUSHTAN_CODE,
};
use tracing::{debug, info, instrument, warn};

/// Maps an IBAN or account number to an optional display name
pub type AccountConfig = HashMap<String, Option<String>>;

/// Type codes the bank uses for giro and savings accounts
const BALANCE_ACCOUNT_TYPES: RangeInclusive<u32> = 1..=9;

/// Type codes the bank uses for securities accounts
const HOLDINGS_ACCOUNT_TYPES: RangeInclusive<u32> = 30..=39;

/// Accounts of a login, split by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedAccounts {
    pub balance: Vec<SepaAccount>,
    pub holdings: Vec<SepaAccount>,
}

/// Wrapper around a FinTS PIN/TAN client
///
/// All methods block on bank I/O. Share the wrapper through an `Arc` and call
/// it from `tokio::task::spawn_blocking` when used from async code.
pub struct FinTsClient {
    credentials: BankCredentials,
    name: String,
    account_config: AccountConfig,
    holdings_config: AccountConfig,
    factory: Arc<dyn ClientFactory>,
    client: Mutex<Option<Box<dyn BankingClient>>>,
    /// Account information by IBAN, fetched once
    account_information: Mutex<Option<HashMap<String, AccountInformation>>>,
}

impl FinTsClient {
    /// Create a wrapper; no connection is made until first use
    pub fn new(
        credentials: BankCredentials,
        name: impl Into<String>,
        account_config: AccountConfig,
        holdings_config: AccountConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            credentials,
            name: name.into(),
            account_config,
            holdings_config,
            factory,
            client: Mutex::new(None),
            account_information: Mutex::new(None),
        }
    }

    /// Display name of the bank login
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &BankCredentials {
        &self.credentials
    }

    pub fn account_config(&self) -> &AccountConfig {
        &self.account_config
    }

    pub fn holdings_config(&self) -> &AccountConfig {
        &self.holdings_config
    }

    /// Whether the protocol client has been created yet
    pub fn has_client(&self) -> bool {
        self.lock_client().is_some()
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<Box<dyn BankingClient>>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the cached protocol client, creating it on first use
    pub fn with_client<R>(
        &self,
        f: impl FnOnce(&mut dyn BankingClient) -> BankResult<R>,
    ) -> BankResult<R> {
        let mut guard = self.lock_client();
        if guard.is_none() {
            debug!(blz = %self.credentials.blz, "Creating FinTS client");
            *guard = Some(self.factory.connect(&self.credentials)?);
        }
        match guard.as_deref_mut() {
            Some(client) => f(client),
            None => Err(BankError::Connection("client unavailable".to_string())),
        }
    }

    /// Run `f` inside a bank dialog
    ///
    /// The dialog is closed afterwards, except when `f` fails because the
    /// bank wants a TAN: that dialog stays open so it can be paused and
    /// resumed once the TAN is confirmed.
    pub fn with_dialog<R>(
        &self,
        f: impl FnOnce(&mut dyn BankingClient) -> BankResult<R>,
    ) -> BankResult<R> {
        self.with_client(|client| {
            client.open_dialog()?;
            let result = f(client);
            if matches!(result, Err(BankError::NeedTan(_))) {
                return result;
            }
            if let Err(err) = client.close_dialog() {
                warn!("Could not close dialog: {}", err);
            }
            result
        })
    }

    /// Create the client and pick the TAN mechanism
    pub fn bootstrap(&self) -> BankResult<()> {
        self.with_client(|_| Ok(()))?;
        self.init_tan_mechanism();
        Ok(())
    }

    /// Select pushTAN if the bank offers it
    ///
    /// Does nothing before the client exists. Failures are logged, never
    /// returned.
    pub fn init_tan_mechanism(&self) {
        if !self.has_client() {
            return;
        }
        let result = self.with_dialog(|client| {
            let mechanisms = client.get_tan_mechanisms()?;
            if mechanisms.is_empty() {
                warn!("No TAN mechanisms available");
                return Ok(());
            }

            let Some(pushtan) = mechanisms.iter().find(|m| m.code == PUSHTAN_CODE) else {
                let codes: Vec<&str> = mechanisms.iter().map(|m| m.code.as_str()).collect();
                warn!(
                    "pushTAN ({}) not available, available: {:?}",
                    PUSHTAN_CODE, codes
                );
                return Ok(());
            };

            info!("Using pushTAN ({})", PUSHTAN_CODE);
            client.set_tan_mechanism(PUSHTAN_CODE)?;

            if pushtan.description_required {
                let medium = client.get_tan_media().and_then(|(_, media)| {
                    match media.first() {
                        Some(medium) => client.set_tan_medium(medium),
                        None => Ok(()),
                    }
                });
                if let Err(err) = medium {
                    warn!("Could not set TAN medium: {}", err);
                }
            }
            Ok(())
        });

        if let Err(err) = result {
            warn!("Could not initialize TAN mechanism: {}", err);
        }
    }

    /// System id assigned by the bank, if a client exists and has one
    pub fn system_id(&self) -> Option<String> {
        self.lock_client().as_ref().and_then(|c| c.system_id())
    }

    /// Login of the client, if it exists
    pub fn user_id(&self) -> Option<String> {
        self.lock_client().as_ref().map(|c| c.user_id())
    }

    /// Information about the account with the given IBAN
    ///
    /// The bank is queried on the first call only.
    pub fn get_account_information(&self, iban: &str) -> BankResult<Option<AccountInformation>> {
        let mut cache = self
            .account_information
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cache.is_none() {
            let info = self.with_client(|client| client.get_information())?;
            let by_iban = info
                .accounts
                .into_iter()
                .filter_map(|account| account.iban.clone().map(|iban| (iban, account)))
                .collect();
            *cache = Some(by_iban);
        }

        Ok(cache.as_ref().and_then(|m| m.get(iban).cloned()))
    }

    /// Whether the account holds money
    pub fn is_balance_account(&self, account: &SepaAccount) -> BankResult<bool> {
        self.is_account_of_kind(account, BALANCE_ACCOUNT_TYPES, &self.account_config)
    }

    /// Whether the account holds securities
    pub fn is_holdings_account(&self, account: &SepaAccount) -> BankResult<bool> {
        self.is_account_of_kind(account, HOLDINGS_ACCOUNT_TYPES, &self.holdings_config)
    }

    /// Classify by the bank's type code, falling back to explicit config
    /// when the bank reports none
    fn is_account_of_kind(
        &self,
        account: &SepaAccount,
        types: RangeInclusive<u32>,
        config: &AccountConfig,
    ) -> BankResult<bool> {
        let Some(iban) = account.iban.as_deref().filter(|iban| !iban.is_empty()) else {
            return Ok(false);
        };
        let Some(information) = self.get_account_information(iban)? else {
            return Ok(false);
        };

        if let Some(account_type) = information.account_type.filter(|t| *t != 0) {
            return Ok(types.contains(&account_type));
        }

        let listed = |key: &Option<String>| {
            key.as_deref()
                .map(|k| config.contains_key(k))
                .unwrap_or(false)
        };
        Ok(listed(&information.iban) || listed(&information.account_number))
    }

    /// List the accounts of the login and split them by kind
    #[instrument(skip(self), fields(bank = %self.name))]
    pub fn detect_accounts(&self) -> BankResult<DetectedAccounts> {
        let accounts = self.with_client(|client| client.get_sepa_accounts())?;
        let mut detected = DetectedAccounts::default();

        for account in accounts {
            if self.is_balance_account(&account)? {
                detected.balance.push(account);
            } else if self.is_holdings_account(&account)? {
                detected.holdings.push(account);
            } else {
                warn!(
                    "Could not determine type of account {:?} from {:?}",
                    account.iban,
                    self.user_id()
                );
            }
        }

        debug!(
            balance = detected.balance.len(),
            holdings = detected.holdings.len(),
            "Detected accounts"
        );
        Ok(detected)
    }

    /// Current balance of an account
    pub fn get_balance(&self, account: &SepaAccount) -> BankResult<Balance> {
        self.with_client(|client| client.get_balance(account))
    }

    /// Current positions of a securities account
    pub fn get_holdings(&self, account: &SepaAccount) -> BankResult<Vec<Holding>> {
        self.with_client(|client| client.get_holdings(account))
    }
}

impl std::fmt::Debug for FinTsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinTsClient")
            .field("name", &self.name)
            .field("credentials", &self.credentials)
            .field("has_client", &self.has_client())
            .finish()
    }
}
