//! Purchase lifecycle: listing, expiring and removing stored purchases, and
//! buying new expiring purchases from the server.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::client::Client;
use super::Purchase;
use crate::errors::{ErrorKind, PsiCashError, Result, WrapError};

const TRANSACTION_PATH: &str = "/transaction";
const EXPIRING_PURCHASE_TYPE: &str = "expiring-purchase";

/// Outcome of a purchase request that the server answered within the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsiCashStatus {
    Success,
    /// The server returned a 429: Too Many Requests status code.
    /// Another transaction for this user is still being processed.
    ExistingTransaction,
    /// The server returned a 402: Payment Required status code.
    InsufficientBalance,
    /// The server returned a 409: Conflict status code.
    /// The price the client expected no longer matches the server's.
    TransactionAmountMismatch,
    /// The server returned a 404: Not Found status code.
    /// The transaction class/distinguisher pair does not exist.
    TransactionTypeNotFound,
    /// The server returned a 401: Unauthorized status code.
    InvalidTokens,
    /// The server returned a 500: Internal Server Error status code, after retries.
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExpiringPurchaseResponse {
    pub status: PsiCashStatus,
    /// Set only when `status` is `Success`.
    pub purchase: Option<Purchase>,
}

/// Fields of a transaction response body. All of them are optional on the wire.
#[derive(Debug, Default)]
struct TransactionFields {
    transaction_id: Option<String>,
    authorization: Option<String>,
    transaction_type: Option<String>,
    server_expiry: Option<DateTime<Utc>>,
}

impl Client {
    /// Purchases that have not expired in local time. Purchases without an expiry never expire.
    pub fn valid_purchases(&self) -> Vec<Purchase> {
        let local_now = Utc::now();
        self.purchases()
            .into_iter()
            .filter(|p| !p.is_expired(local_now))
            .collect()
    }

    /// The purchase that will expire first, if any purchase has an expiry.
    pub fn next_expiring_purchase(&self) -> Option<Purchase> {
        // Purchases are compared with each other rather than with now, so server
        // time works and the clock skew cancels out.
        self.purchases()
            .into_iter()
            .filter(|p| p.server_time_expiry.is_some())
            .min_by_key(|p| p.server_time_expiry)
    }

    /// Removes expired purchases from the store and returns them.
    pub fn expire_purchases(&mut self) -> Result<Vec<Purchase>> {
        let local_now = Utc::now();
        let (expired, valid): (Vec<Purchase>, Vec<Purchase>) = self
            .purchases()
            .into_iter()
            .partition(|p| p.is_expired(local_now));

        self.user_data
            .set_purchases(&valid)
            .wrap_err("set purchases failed")?;

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expired purchases removed");
        }
        Ok(expired)
    }

    /// Removes the purchases with the given IDs. Unknown IDs are ignored.
    pub fn remove_purchases<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<()> {
        let remaining: Vec<Purchase> = self
            .purchases()
            .into_iter()
            .filter(|p| !ids.iter().any(|id| id.as_ref() == p.id))
            .collect();

        self.user_data
            .set_purchases(&remaining)
            .wrap_err("set purchases failed")
    }

    /// Buys an expiring purchase of `transaction_class`/`distinguisher`.
    ///
    /// `expected_price` is the positive price the user was shown; the server rejects
    /// the transaction with `TransactionAmountMismatch` if it differs from the real one.
    /// Any balance the server reports is stored, whatever the outcome.
    pub fn new_expiring_purchase(
        &mut self,
        transaction_class: &str,
        distinguisher: &str,
        expected_price: i64,
    ) -> Result<NewExpiringPurchaseResponse> {
        // The price is a positive magnitude; the server wants the (negative) amount.
        let expected_amount = expected_price.checked_neg().ok_or_else(|| {
            PsiCashError::new(
                ErrorKind::InvalidArgument,
                format!("expected price out of range: {expected_price}"),
            )
        })?;

        let query = json!({
            "class": transaction_class,
            "distinguisher": distinguisher,
            "expectedAmount": expected_amount,
        });

        let result = self
            .make_http_request_with_retry("POST", TRANSACTION_PATH, true, &query)
            .wrap_err("make HTTP request with retry failed")?;

        let status = u16::try_from(result.status)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| unexpected_status(result.status))?;

        let fields = match status {
            StatusCode::OK
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::PAYMENT_REQUIRED
            | StatusCode::CONFLICT => {
                let body = result.body.as_deref().filter(|b| !b.is_empty()).ok_or_else(|| {
                    PsiCashError::new(
                        ErrorKind::Protocol,
                        format!("result has no body; status: {}", result.status),
                    )
                })?;
                self.parse_transaction_body(body)
                    .wrap_err("parse transaction body failed")?
            }
            _ => TransactionFields::default(),
        };

        let status = match status {
            StatusCode::OK => {
                let purchase = self
                    .store_new_purchase(transaction_class, distinguisher, fields)
                    .wrap_err("store new purchase failed")?;
                return Ok(NewExpiringPurchaseResponse {
                    status: PsiCashStatus::Success,
                    purchase: Some(purchase),
                });
            }
            StatusCode::TOO_MANY_REQUESTS => PsiCashStatus::ExistingTransaction,
            StatusCode::PAYMENT_REQUIRED => PsiCashStatus::InsufficientBalance,
            StatusCode::CONFLICT => PsiCashStatus::TransactionAmountMismatch,
            StatusCode::NOT_FOUND => PsiCashStatus::TransactionTypeNotFound,
            StatusCode::UNAUTHORIZED => PsiCashStatus::InvalidTokens,
            StatusCode::INTERNAL_SERVER_ERROR => PsiCashStatus::ServerError,
            _ => return Err(unexpected_status(result.status)),
        };

        tracing::debug!(transaction_class, distinguisher, ?status, "purchase not completed");
        Ok(NewExpiringPurchaseResponse {
            status,
            purchase: None,
        })
    }

    /// Extracts the transaction fields from a response body, storing the balance if present.
    fn parse_transaction_body(&mut self, body: &str) -> Result<TransactionFields> {
        let json: Value = serde_json::from_str(body).map_err(|err| {
            PsiCashError::new(
                ErrorKind::Parse,
                format!("json parse failed: {err}; body: {body}"),
            )
        })?;

        if let Some(balance) = json.get("Balance").and_then(Value::as_i64) {
            if let Err(err) = self.user_data.set_balance(balance) {
                tracing::warn!(error = %err, "failed to store balance from transaction response");
            }
        }

        let string_at = |pointer: &str| {
            json.pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let server_expiry = match string_at("/TransactionResponse/Values/Expires") {
            Some(expires) => Some(
                DateTime::parse_from_rfc3339(&expires)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|err| {
                        PsiCashError::new(
                            ErrorKind::Parse,
                            format!(
                                "failed to parse TransactionResponse.Values.Expires; got {expires}: {err}"
                            ),
                        )
                    })?,
            ),
            None => None,
        };

        Ok(TransactionFields {
            transaction_id: string_at("/TransactionID"),
            authorization: string_at("/Authorization"),
            transaction_type: string_at("/TransactionResponse/Type"),
            server_expiry,
        })
    }

    fn store_new_purchase(
        &mut self,
        transaction_class: &str,
        distinguisher: &str,
        fields: TransactionFields,
    ) -> Result<Purchase> {
        let transaction_type = fields.transaction_type.unwrap_or_default();
        if transaction_type != EXPIRING_PURCHASE_TYPE {
            return Err(PsiCashError::new(
                ErrorKind::Protocol,
                format!(
                    "response contained incorrect TransactionResponse.Type; want '{EXPIRING_PURCHASE_TYPE}', got '{transaction_type}'"
                ),
            ));
        }

        let Some(id) = fields.transaction_id.filter(|id| !id.is_empty()) else {
            return Err(PsiCashError::new(
                ErrorKind::Protocol,
                "response did not provide valid TransactionID",
            ));
        };

        let Some(server_expiry) = fields
            .server_expiry
            .filter(|expiry| expiry.timestamp() != 0 || expiry.timestamp_subsec_nanos() != 0)
        else {
            return Err(PsiCashError::new(
                ErrorKind::Protocol,
                "response did not provide valid TransactionResponse.Values.Expires",
            ));
        };

        // Authorization does not apply to every expiring purchase, so it is not required.
        let purchase = Purchase {
            id,
            transaction_class: transaction_class.to_string(),
            distinguisher: distinguisher.to_string(),
            authorization: fields.authorization.filter(|a| !a.is_empty()),
            server_time_expiry: Some(server_expiry),
            local_time_expiry: Some(self.user_data.to_local_time(server_expiry)),
        };

        self.user_data
            .add_purchase(&purchase)
            .wrap_err("add purchase failed")?;

        tracing::debug!(id = %purchase.id, transaction_class, distinguisher, "purchase stored");
        Ok(purchase)
    }
}

fn unexpected_status(status: i32) -> PsiCashError {
    PsiCashError::new(
        ErrorKind::Protocol,
        format!("request returned unexpected status code: {status}"),
    )
}
