//! External collaborators: the record store, the interest-join source and the
//! image signing service.

pub mod api_types;
pub mod client;
pub mod interests;
pub mod query;
pub mod signer;
pub mod source;
pub mod types;

pub use client::RecordStoreClient;
pub use interests::InterestClient;
pub use query::{ItemFilter, ItemQuery};
pub use signer::GatewaySigner;
pub use source::{InterestSource, RecordSource, UrlSigner};
pub use types::{ItemExpand, ItemRecord, ListPage, ProfileRecord, RefRecord, SignedUrl, SubscriptionRow};
