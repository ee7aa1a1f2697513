//! FinTS client wrapper
//!
//! Wraps a [`BankingClient`](fints_core::BankingClient) for one bank login.
//! The protocol client is created lazily and cached, because it keeps the
//! current dialog and the bank's capabilities between calls.
//!
//! # Key Types
//!
//! - [`FinTsClient`] - Cached session with account classification
//! - [`DetectedAccounts`] - Balance and holdings accounts of a login
//! - [`AccountConfig`] - Account identifier to optional display name

mod blocking;
mod client;

pub use blocking::run_blocking;
pub use client::{AccountConfig, DetectedAccounts, FinTsClient};
