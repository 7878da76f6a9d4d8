//! Memoized value transformations.
//!
//! Display widgets often need to turn a raw value into its presentation: a
//! number into hexadecimal, a code into a label. When many widgets show the
//! same value, the transformation should run once and every widget should get
//! the result. This crate provides the pieces for that:
//!
//! - A [`MemoCache`] of shared [`TransformResult`] entries. Looking up a key
//!   either creates the entry (and hands the caller a [`Completer`] that must
//!   settle it) or returns the existing one. Callers observe entries by
//!   subscribing and are notified exactly once.
//! - [`Engine`]s that do the transforming. A [`StaticEngine`] wraps a plain
//!   function; a [`DynamicEngine`] is minted from a unit of user-supplied
//!   WebAssembly compiled by the [`UnitRegistry`].
//! - A [`Coordinator`] that wires triggers, cache and engines together and
//!   delivers results to [`Sink`]s, computing on an [`Executor`].
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use transmemo::{Coordinator, EngineSource, Sink, StaticEngine};
//!
//! #[derive(Default)]
//! struct Label(Mutex<String>);
//!
//! impl Sink for Label {
//!     fn set_value(&self, value: &str) {
//!         *self.0.lock() = value.into();
//!     }
//! }
//!
//! let coordinator = Coordinator::new(EngineSource::fixed(StaticEngine::hex()));
//! let label = Arc::new(Label::default());
//! coordinator.trigger("42", "42", label.clone());
//! assert_eq!(*label.0.lock(), "0x2A");
//! ```

mod cache;
mod config;
mod coordinator;
mod engine;
mod entry;
mod error;
mod executor;
mod identity;
mod registry;
#[cfg(feature = "testing")]
mod testing;
mod wasm;

pub use crate::cache::{Lookup, MemoCache};
pub use crate::config::Config;
pub use crate::coordinator::{Coordinator, Delivery, EngineSource, Sink};
pub use crate::engine::{DynamicEngine, Engine, StaticEngine, TransformFn};
pub use crate::entry::{Completer, Status, SubscriptionId, TransformResult};
pub use crate::error::{
    CompileError, ConfigError, Diagnostic, Diagnostics, Fault, InstantiationError,
    TransformError,
};
pub use crate::executor::{Executor, Inline, Job, pool};
pub use crate::identity::UnitIdentity;
pub use crate::registry::{
    Artifact, CompiledUnit, Compiler, Contract, UnitDescriptor, UnitRegistry, UnitStatus,
};
pub use crate::wasm::{DEFAULT_FUEL, MAX_NESTING, MAX_SOURCE_LEN, WasmCompiler};

#[cfg(feature = "macros")]
pub use transmemo_macros::transform;

/// These are implementation details. Do not rely on them!
#[doc(hidden)]
pub mod internal {
    #[cfg(feature = "testing")]
    pub use crate::testing::{Outcome, last_lookup, last_was_hit};
}
