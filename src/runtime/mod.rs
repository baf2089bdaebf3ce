//! Guest module runtime: compilation cache and the execution host.

mod cache;
pub mod host;

pub use host::{ModuleHost, ModuleInvocation};
