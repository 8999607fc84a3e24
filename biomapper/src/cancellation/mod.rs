//! Cooperative cancellation for strategy runs.
//!
//! Jobs hold a [`CancellationToken`]; the waterfall pipeline checks it at
//! every stage boundary. A stage that is already running is never
//! interrupted by the token.

mod token;

pub use token::CancellationToken;
