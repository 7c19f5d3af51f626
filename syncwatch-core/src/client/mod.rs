//! Client surface for embedding applications
//!
//! [`Client`] ties the server connection, the player controller, and the
//! sync engine together; everything it wants shown arrives through a
//! [`ClientCallback`].

mod handlers;
mod session;
mod types;

pub use session::Client;
pub use types::{Advisory, ClientCallback, CoreError};
