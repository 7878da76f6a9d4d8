use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::engine::DynamicEngine;
use crate::error::{CompileError, ConfigError, Diagnostics, Fault, InstantiationError};
use crate::identity::{IdentityMap, UnitIdentity};
use crate::wasm::WasmCompiler;

/// The shape a unit must have to be usable.
///
/// Names the interface the compiled unit implements and the entry function
/// that receives the raw value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Contract {
    /// The interface name, e.g. `Converter`.
    pub name: String,
    /// The function invoked with the raw value.
    pub entry: String,
}

impl Contract {
    /// Create a contract.
    pub fn new(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self { name: name.into(), entry: entry.into() }
    }

    /// The usual value-converter contract: `fn convert(value)`.
    pub fn converter() -> Self {
        Self::new("Converter", "convert")
    }
}

/// Everything that describes a unit of user-supplied transformation logic.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct UnitDescriptor {
    pub namespace: String,
    pub type_name: String,
    pub contract: Contract,
    /// The source text.
    pub body: String,
}

impl UnitDescriptor {
    /// Describe a unit.
    pub fn new(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        contract: Contract,
        body: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            contract,
            body: body.into(),
        }
    }

    /// The unit's identity, derived from every field.
    pub fn identity(&self) -> UnitIdentity {
        UnitIdentity::of(self)
    }

    /// `namespace.TypeName`.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }
}

/// A loaded, callable compilation artifact.
pub trait Artifact: Send + Sync {
    /// Run the entry point on a raw value.
    fn run(&self, raw: &str) -> Result<String, Fault>;
}

/// Turns unit source text into an artifact.
///
/// Implementations must be deterministic: the same descriptor always yields
/// the same artifact or the same diagnostics.
pub trait Compiler: Send + Sync {
    fn compile(&self, descriptor: &UnitDescriptor) -> Result<Arc<dyn Artifact>, Diagnostics>;
}

/// Whether a unit has been compiled, and how that went.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UnitStatus {
    Unbuilt,
    Built,
    BuildFailed,
}

/// A unit tracked by the registry.
pub struct CompiledUnit {
    identity: UnitIdentity,
    descriptor: UnitDescriptor,
    name: Arc<str>,
    /// Initialized at most once, by the first `get_or_build` for the identity.
    build: OnceLock<Result<Arc<dyn Artifact>, Diagnostics>>,
}

impl CompiledUnit {
    fn new(identity: UnitIdentity, descriptor: UnitDescriptor) -> Self {
        Self {
            identity,
            name: descriptor.qualified_name().into(),
            descriptor,
            build: OnceLock::new(),
        }
    }

    /// The unit's identity.
    pub fn identity(&self) -> UnitIdentity {
        self.identity
    }

    /// The descriptor the unit was built from.
    pub fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    /// The source text.
    pub fn source(&self) -> &str {
        &self.descriptor.body
    }

    /// `namespace.TypeName`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The build status.
    pub fn status(&self) -> UnitStatus {
        match self.build.get() {
            None => UnitStatus::Unbuilt,
            Some(Ok(_)) => UnitStatus::Built,
            Some(Err(_)) => UnitStatus::BuildFailed,
        }
    }

    /// The compile error, if the build failed.
    pub fn error(&self) -> Option<CompileError> {
        match self.build.get() {
            Some(Err(diagnostics)) => Some(CompileError {
                unit: self.name.to_string(),
                diagnostics: diagnostics.clone(),
            }),
            _ => None,
        }
    }
}

impl Debug for CompiledUnit {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("status", &self.status())
            .finish()
    }
}

/// Compiles units once per identity and mints engines from them.
///
/// A failed build is kept like a successful one: asking again for the same
/// identity returns the same diagnostics without recompiling. Use
/// [`invalidate`](Self::invalidate) to allow another attempt.
pub struct UnitRegistry {
    compiler: Box<dyn Compiler>,
    units: Mutex<IdentityMap<Arc<CompiledUnit>>>,
    compilations: AtomicUsize,
}

impl UnitRegistry {
    /// A registry compiling WebAssembly text units with a [`WasmCompiler`].
    pub fn new() -> Result<Self, ConfigError> {
        let compiler =
            WasmCompiler::new().map_err(|err| ConfigError::Runtime(format!("{err:#}")))?;
        Ok(Self::with_compiler(compiler))
    }

    /// A registry using a custom compiler.
    pub fn with_compiler(compiler: impl Compiler + 'static) -> Self {
        Self {
            compiler: Box::new(compiler),
            units: Mutex::new(IdentityMap::default()),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Return the unit for the descriptor, compiling it on first request.
    ///
    /// Concurrent first requests for one identity compile once; the others
    /// block until that compilation finishes. Requests for other identities
    /// are not blocked.
    pub fn get_or_build(&self, descriptor: &UnitDescriptor) -> Arc<CompiledUnit> {
        let identity = descriptor.identity();
        let unit = self
            .units
            .lock()
            .entry(identity)
            .or_insert_with(|| Arc::new(CompiledUnit::new(identity, descriptor.clone())))
            .clone();

        unit.build.get_or_init(|| {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            let result = self.compiler.compile(&unit.descriptor);
            match &result {
                Ok(_) => tracing::debug!(unit = %unit.name, "compiled unit"),
                Err(diagnostics) => tracing::warn!(
                    unit = %unit.name,
                    problems = diagnostics.len(),
                    "unit failed to compile"
                ),
            }
            result
        });

        unit
    }

    /// Check that the descriptor compiles, surfacing the diagnostics if not.
    ///
    /// Goes through the cache: the result is remembered like any other build.
    pub fn try_compile(&self, descriptor: &UnitDescriptor) -> Result<(), CompileError> {
        match self.get_or_build(descriptor).error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Create a fresh engine for a built unit.
    ///
    /// All engines minted from one unit share its artifact.
    pub fn mint_instance(&self, unit: &CompiledUnit) -> Result<DynamicEngine, InstantiationError> {
        match unit.build.get() {
            Some(Ok(artifact)) => Ok(DynamicEngine::new(unit.name.clone(), artifact.clone())),
            _ => {
                debug_assert!(
                    unit.status() != UnitStatus::Unbuilt,
                    "transmemo: engine minted from a unit that was never built"
                );
                Err(InstantiationError { unit: unit.name.to_string(), status: unit.status() })
            }
        }
    }

    /// The unit with the given identity, if it was ever requested.
    pub fn get(&self, identity: UnitIdentity) -> Option<Arc<CompiledUnit>> {
        self.units.lock().get(&identity).cloned()
    }

    /// Forget a unit so that the next request compiles it again.
    ///
    /// Engines already minted from it keep working. Returns whether the unit
    /// was known.
    pub fn invalidate(&self, identity: UnitIdentity) -> bool {
        self.units.lock().remove(&identity).is_some()
    }

    /// The number of known units.
    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    /// Whether no unit was requested yet.
    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }

    /// How many times the compiler has been invoked.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl Debug for UnitRegistry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}
