//! Beacon generation, chain serving and catch-up

mod chain;
mod handler;
mod partials;
mod sync;

pub use chain::{ChainState, Subscription};
pub use handler::{transition_round, Handler, HandlerConfig};
pub use partials::PartialCache;
pub use sync::Syncer;
