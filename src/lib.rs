//! Mail ingestion pipeline: provider adapters (Microsoft Graph push,
//! generic IMAP polling) feeding a dedup/persist/enrich chain, with a
//! webhook endpoint and background sync loops on top.

pub mod db;
pub mod enrich;
pub mod providers;
pub mod server;
pub mod subscriptions;
pub mod sync;
