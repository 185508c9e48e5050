use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{AuthTokens, Purchase, PurchasePrice, RequestMetadata, TokenSetMode};
use crate::datastore::{encode, Datastore, LoadOutcome};
use crate::errors::{ErrorKind, PsiCashError, Result, WrapError};

/// Datastore keys
pub mod keys {
    pub const AUTH_TOKENS: &str = "authTokens";
    pub const IS_ACCOUNT: &str = "isAccount";
    pub const BALANCE: &str = "balance";
    pub const PURCHASE_PRICES: &str = "purchasePrices";
    pub const PURCHASES: &str = "purchases";
    pub const SERVER_TIME_DIFF: &str = "serverTimeDiff";
    pub const REQUEST_METADATA: &str = "requestMetadata";
}

/// Typed view over the datastore: tokens, balance, purchases and the rest of the user's state.
///
/// Getters never fail. A value that cannot be decoded is logged and reported as its
/// fresh-install default, since the store is only a cache of server state.
#[derive(Debug, Default)]
pub struct UserData {
    datastore: Datastore,
}

impl UserData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, root: &Path) -> Result<LoadOutcome> {
        self.datastore.load(root).wrap_err("datastore load failed")
    }

    /// Resets to the fresh-install state: no tokens, zero balance, no purchases,
    /// tracker user, zero clock skew.
    pub fn clear(&mut self) -> Result<()> {
        self.datastore.clear().wrap_err("datastore clear failed")
    }

    fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.datastore.get(key) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(key, error = %err, "unreadable datastore value; using default");
                T::default()
            }
        }
    }

    /// Difference between server time and local time, as of the last usable server `Date`.
    /// An out-of-range stored value is logged and treated as zero.
    pub fn server_time_diff(&self) -> TimeDelta {
        let millis = self.get_or_default::<i64>(keys::SERVER_TIME_DIFF);
        TimeDelta::try_milliseconds(millis).unwrap_or_else(|| {
            tracing::warn!(millis, "stored server time diff out of range; using zero");
            TimeDelta::zero()
        })
    }

    /// Converts a server timestamp to local time using the stored skew.
    ///
    /// If the shift leaves chrono's range the result is `DateTime::MIN_UTC`, so an
    /// expiry computed from it is already in the past and the purchase gets pruned.
    pub(crate) fn to_local_time(&self, server_time: DateTime<Utc>) -> DateTime<Utc> {
        shift_to_local(server_time, self.server_time_diff())
    }

    /// Records the skew between `server_now` and the local clock.
    pub fn set_server_time_diff(&mut self, server_now: DateTime<Utc>) -> Result<()> {
        let diff = server_now - Utc::now();
        self.datastore
            .set(keys::SERVER_TIME_DIFF, &diff.num_milliseconds())
            .wrap_err("failed to store server time diff")
    }

    pub fn auth_tokens(&self) -> AuthTokens {
        self.get_or_default(keys::AUTH_TOKENS)
    }

    /// Stores `tokens` and the account flag as one snapshot.
    ///
    /// Account tokens are never silently replaced. Once the stored user is an account,
    /// `ReplaceAll` is refused and so is clearing the account flag; only `clear` turns an
    /// account back into a tracker.
    pub fn set_auth_tokens(
        &mut self,
        tokens: AuthTokens,
        mode: TokenSetMode,
        is_account: bool,
    ) -> Result<()> {
        if self.is_account() {
            if mode == TokenSetMode::ReplaceAll {
                return Err(PsiCashError::new(
                    ErrorKind::NotPermitted,
                    "cannot replace the tokens of an account user",
                ));
            }
            if !is_account {
                return Err(PsiCashError::new(
                    ErrorKind::NotPermitted,
                    "cannot turn an account user back into a tracker",
                ));
            }
        }

        let mut merged = match mode {
            TokenSetMode::Merge => self.auth_tokens(),
            TokenSetMode::ReplaceAll => AuthTokens::new(),
        };
        merged.extend(tokens);

        let tokens_value = encode(keys::AUTH_TOKENS, &merged)?;
        self.datastore
            .update(|data| {
                data.insert(keys::AUTH_TOKENS.to_string(), tokens_value);
                data.insert(keys::IS_ACCOUNT.to_string(), Value::Bool(is_account));
                Ok(())
            })
            .wrap_err("failed to store auth tokens")
    }

    pub fn is_account(&self) -> bool {
        self.get_or_default(keys::IS_ACCOUNT)
    }

    pub fn balance(&self) -> i64 {
        self.get_or_default(keys::BALANCE)
    }

    pub fn set_balance(&mut self, balance: i64) -> Result<()> {
        self.datastore
            .set(keys::BALANCE, &balance)
            .wrap_err("failed to store balance")
    }

    pub fn purchase_prices(&self) -> Vec<PurchasePrice> {
        self.get_or_default(keys::PURCHASE_PRICES)
    }

    /// Replaces the stored price list wholesale.
    pub fn set_purchase_prices(&mut self, prices: &[PurchasePrice]) -> Result<()> {
        self.datastore
            .set(keys::PURCHASE_PRICES, &prices)
            .wrap_err("failed to store purchase prices")
    }

    /// Stored purchases with `local_time_expiry` derived from the current clock skew.
    pub fn purchases(&self) -> Vec<Purchase> {
        let diff = self.server_time_diff();
        let mut purchases: Vec<Purchase> = self.get_or_default(keys::PURCHASES);
        for purchase in &mut purchases {
            purchase.local_time_expiry = purchase
                .server_time_expiry
                .map(|expiry| shift_to_local(expiry, diff));
        }
        purchases
    }

    pub fn set_purchases(&mut self, purchases: &[Purchase]) -> Result<()> {
        for (i, purchase) in purchases.iter().enumerate() {
            if purchases[..i].iter().any(|p| p.id == purchase.id) {
                return Err(PsiCashError::new(
                    ErrorKind::InvalidArgument,
                    format!("duplicate purchase id {}", purchase.id),
                ));
            }
        }

        self.datastore
            .set(keys::PURCHASES, &purchases)
            .wrap_err("failed to store purchases")
    }

    /// Appends `purchase`, replacing any stored purchase with the same ID.
    pub fn add_purchase(&mut self, purchase: &Purchase) -> Result<()> {
        let mut purchases = self.purchases();
        purchases.retain(|p| p.id != purchase.id);
        purchases.push(purchase.clone());
        self.set_purchases(&purchases).wrap_err("add purchase failed")
    }

    pub fn request_metadata(&self) -> RequestMetadata {
        self.get_or_default(keys::REQUEST_METADATA)
    }

    pub fn set_request_metadata_item(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(PsiCashError::new(
                ErrorKind::InvalidArgument,
                "request metadata key is empty",
            ));
        }

        let mut metadata = self.request_metadata();
        metadata.insert(key.to_string(), value.to_string());
        self.datastore
            .set(keys::REQUEST_METADATA, &metadata)
            .wrap_err("failed to store request metadata")
    }
}

fn shift_to_local(server_time: DateTime<Utc>, diff: TimeDelta) -> DateTime<Utc> {
    server_time.checked_sub_signed(diff).unwrap_or_else(|| {
        tracing::warn!(%server_time, diff_ms = diff.num_milliseconds(), "local time out of range; treating as expired");
        DateTime::<Utc>::MIN_UTC
    })
}
