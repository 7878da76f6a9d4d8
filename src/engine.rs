use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::TransformError;
use crate::registry::Artifact;

/// Transforms one raw value into its display output.
///
/// Implemented by fixed functions ([`StaticEngine`]) and by instances minted
/// from compiled units ([`DynamicEngine`]). Callers treat both the same.
pub trait Engine: Send + Sync {
    /// A name for diagnostics and logs.
    fn name(&self) -> &str;

    /// Transform a raw value.
    fn invoke(&self, raw: &str) -> Result<String, TransformError>;
}

impl<E: Engine + ?Sized> Engine for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, raw: &str) -> Result<String, TransformError> {
        (**self).invoke(raw)
    }
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, raw: &str) -> Result<String, TransformError> {
        (**self).invoke(raw)
    }
}

/// The signature of a function usable as a static engine.
pub type TransformFn = fn(&str) -> Result<String, TransformError>;

/// An engine backed by a plain function. There is no compilation step.
///
/// Usually created with the [`transform`](macro@crate::transform) attribute.
#[derive(Copy, Clone)]
pub struct StaticEngine {
    name: &'static str,
    func: TransformFn,
}

impl StaticEngine {
    /// Wrap a function.
    pub const fn new(name: &'static str, func: TransformFn) -> Self {
        Self { name, func }
    }

    /// Formats a decimal integer as uppercase hexadecimal: `42` becomes
    /// `0x2A`.
    pub const fn hex() -> Self {
        Self::new("hex", to_hex)
    }
}

impl Engine for StaticEngine {
    fn name(&self) -> &str {
        self.name
    }

    fn invoke(&self, raw: &str) -> Result<String, TransformError> {
        (self.func)(raw)
    }
}

impl Debug for StaticEngine {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("StaticEngine").field(&self.name).finish()
    }
}

fn to_hex(raw: &str) -> Result<String, TransformError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| TransformError::fault("hex", format!("`{raw}` is not an integer")))?;
    let sign = if value < 0 { "-" } else { "" };
    Ok(format!("{sign}0x{:X}", value.unsigned_abs()))
}

/// An engine instance minted from a compiled unit.
///
/// Every instance of a unit shares the unit's artifact; minting never
/// recompiles.
pub struct DynamicEngine {
    unit: Arc<str>,
    artifact: Arc<dyn Artifact>,
}

impl DynamicEngine {
    pub(crate) fn new(unit: Arc<str>, artifact: Arc<dyn Artifact>) -> Self {
        Self { unit, artifact }
    }

    /// Whether two instances share the same loaded artifact.
    pub fn shares_artifact(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.artifact, &other.artifact)
    }
}

impl Engine for DynamicEngine {
    fn name(&self) -> &str {
        &self.unit
    }

    fn invoke(&self, raw: &str) -> Result<String, TransformError> {
        // Loaded code is foreign to this crate; a panic in it must not unwind
        // through the cache or the worker pool.
        match panic::catch_unwind(AssertUnwindSafe(|| self.artifact.run(raw))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(fault)) => Err(TransformError::fault(&*self.unit, fault.0)),
            Err(payload) => Err(TransformError::Panicked {
                engine: self.unit.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Debug for DynamicEngine {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("DynamicEngine").field(&self.unit).finish()
    }
}

/// Extract the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
