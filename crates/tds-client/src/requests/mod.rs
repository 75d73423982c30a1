//! Built-in requests: PRELOGIN, LOGIN7 and SQL batches.

mod batch;
mod login;
mod prelogin;

pub use batch::{BatchHandle, BatchSummary, SqlBatchRequest};
pub use login::LoginRequest;
pub use prelogin::{PreloginRequest, negotiate};
