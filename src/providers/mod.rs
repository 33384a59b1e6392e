//! Provider clients and the normalized transaction model.

pub mod api_types;
pub mod client;
pub mod mock;
pub mod stripe;
pub mod types;
pub mod zoho;

pub use client::{FunctionsClient, TransactionSource};
pub use stripe::StripeClient;
pub use types::{Source, Transaction, TransactionType};
pub use zoho::ZohoClient;
