//! Banking client trait
//!
//! Defines the interface of the FinTS protocol library. The implementation
//! (wire protocol, SEPA parsing, message signing) is provided externally.

use crate::error::BankResult;
use crate::models::{
    Balance, BankCredentials, BankInformation, DialogData, Holding, NeedTanResponse, SepaAccount,
    TanMechanism, TanMedium, TanOutcome,
};

/// A connected FinTS PIN/TAN client for one bank login
///
/// All methods block on network I/O. The client keeps the current dialog
/// with the bank and the bank's capabilities between calls, so one instance
/// should be reused for the lifetime of a login.
pub trait BankingClient: Send {
    /// Open a dialog (or join the one already open)
    fn open_dialog(&mut self) -> BankResult<()>;

    /// Close the current dialog
    fn close_dialog(&mut self) -> BankResult<()>;

    /// Suspend the current dialog so it can be resumed later
    fn pause_dialog(&mut self) -> BankResult<DialogData>;

    /// Resume a previously paused dialog
    fn resume_dialog(&mut self, data: DialogData) -> BankResult<()>;

    /// TAN mechanisms offered by the bank, keyed by mechanism code
    fn get_tan_mechanisms(&mut self) -> BankResult<Vec<TanMechanism>>;

    /// Select the TAN mechanism used for all further orders
    fn set_tan_mechanism(&mut self, code: &str) -> BankResult<()>;

    /// Registered TAN media as `(usage option, media)`
    fn get_tan_media(&mut self) -> BankResult<(u32, Vec<TanMedium>)>;

    /// Select the TAN medium used for all further orders
    fn set_tan_medium(&mut self, medium: &TanMedium) -> BankResult<()>;

    /// Query bank and account information
    fn get_information(&mut self) -> BankResult<BankInformation>;

    /// List the SEPA accounts of the login
    ///
    /// Returns [`BankError::NeedTan`](crate::BankError::NeedTan) when the
    /// bank wants a TAN before it hands out the account list.
    fn get_sepa_accounts(&mut self) -> BankResult<Vec<SepaAccount>>;

    /// Submit a TAN for a pending challenge; decoupled challenges take `""`
    fn send_tan(&mut self, challenge: &NeedTanResponse, tan: &str) -> BankResult<TanOutcome>;

    /// TAN challenge raised while initialising the dialog, if still pending
    fn init_tan_response(&self) -> Option<NeedTanResponse>;

    /// Current balance of an account
    fn get_balance(&mut self, account: &SepaAccount) -> BankResult<Balance>;

    /// Current positions of a securities account
    fn get_holdings(&mut self, account: &SepaAccount) -> BankResult<Vec<Holding>>;

    /// System id assigned by the bank, once synchronised
    fn system_id(&self) -> Option<String>;

    /// Login the client was created for
    fn user_id(&self) -> String;
}

/// Creates banking clients from credentials
pub trait ClientFactory: Send + Sync {
    fn connect(&self, credentials: &BankCredentials) -> BankResult<Box<dyn BankingClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&BankCredentials) -> BankResult<Box<dyn BankingClient>> + Send + Sync,
{
    fn connect(&self, credentials: &BankCredentials) -> BankResult<Box<dyn BankingClient>> {
        self(credentials)
    }
}
