//! Webhook surfaces through which workers and third parties deliver call state.
//!
//! - `internal`: keyed by call id, backed by the [`CallLedger`](crate::ledger::CallLedger)
//! - `external`: single-shot `{id, data}` drop box for push-once third parties

pub mod external;
pub mod internal;
