//! Trainer-side library: a synchronous facade over the RPC client plus the
//! distributed NodeFlow loader that feeds a training loop.

pub mod cltctx;
pub mod sampler;

pub use cltctx::ClientContext;
pub use sampler::{DistLoaderOptions, DistNodeFlowLoader};
