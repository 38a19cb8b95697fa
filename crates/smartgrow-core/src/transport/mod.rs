//! Session transport for the SmartGrow REST API.
//!
//! Every request goes out with the stored access token as bearer credential.
//! When the backend answers 401, the transport renews the token once for all
//! concurrent callers, replays each failed request a single time, and ends
//! the session (clearing credentials and publishing
//! [`SessionEvent::Expired`]) if renewal fails.

pub mod events;
pub mod exchange;
pub mod refresh;
pub mod request;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{SessionEvent, UNAUTHENTICATED_ROOT};
pub use exchange::{HttpExchange, ReqwestExchange};
pub use refresh::{RefreshFailure, RefreshGate};
pub use request::{HttpResponse, PreparedRequest, RequestDescriptor};
pub use session::{SessionTransport, TransportSettings};
