mod atomic;
pub mod ledger;
pub mod session_store;

pub use ledger::{RestartLedger, RestartRecord};
pub use session_store::{Session, SessionEvent, SessionStore};
