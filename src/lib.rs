//! # PsiCash client core
//!
//! Keeps a durable local record of a user's auth tokens, balance and purchases, and
//! talks to the PsiCash server through a transport function supplied by the host.
//!
//! ```rust,no_run
//! use psicash::{Client, ClientOptions, ReqwestTransport};
//!
//! fn main() -> Result<(), psicash::PsiCashError> {
//!     let options = ClientOptions {
//!         file_store_root: "/path/to/app/data/psicash".into(),
//!         ..Default::default()
//!     };
//!     let mut client = Client::new(options, ReqwestTransport::new().into_request_fn())?;
//!
//!     client.set_request_metadata_item("client_version", "123")?;
//!     let response = client.new_expiring_purchase("speed-boost", "1hr", 100)?;
//!     println!("purchase status: {:?}", response.status);
//!
//!     for expired in client.expire_purchases()? {
//!         println!("expired: {}", expired.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod datastore;
pub mod errors;
pub mod structs;
pub mod transport;

pub use datastore::{Datastore, LoadOutcome};
pub use errors::{ErrorKind, Frame, PsiCashError, Result, WrapError};
pub use structs::client::{ApiServer, Client, ClientOptions};
pub use structs::purchase::{NewExpiringPurchaseResponse, PsiCashStatus};
pub use structs::user::UserData;
pub use structs::{AuthTokens, Purchase, PurchasePrice, RequestMetadata, TokenSetMode, TokenType};
pub use transport::{HttpResult, MakeHttpRequestFn, ReqwestTransport, RequestParams};
