//! Download engine
//!
//! The pieces, leaf-first:
//! - redirect resolver with an explicit hop budget
//! - metadata prober (filename, extension, size, resumability)
//! - transfer worker (streaming, range resume, progress sampling)
//! - download registry (state machine, one live handle per record)
//! - record store (debounced JSON snapshots, crash-recovery demotion)

mod probe;
mod registry;
mod resolver;
mod store;
mod worker;

pub use probe::*;
pub use registry::*;
pub use resolver::*;
pub use store::*;
pub use worker::*;
