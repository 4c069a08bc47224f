mod chain;
mod ledger;
mod queue;
mod window;

pub use chain::Chain;
pub use ledger::{InFlight, Ledger, Operation};
pub use queue::DropQueue;
pub use window::SequenceWindow;
