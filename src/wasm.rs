use std::sync::Arc;

use unscanny::Scanner;
use wasmtime::{
    Engine, ExternType, FuncType, Instance, Module, ResourceLimiter, Store, StoreLimitsBuilder,
    ValType,
};

use crate::error::{Diagnostics, Fault};
use crate::registry::{Artifact, Compiler, Contract, UnitDescriptor};

/// Deepest parenthesis nesting accepted in unit source.
pub const MAX_NESTING: usize = 256;

/// Largest unit source accepted, in bytes.
pub const MAX_SOURCE_LEN: usize = 1 << 20;

/// Fuel one invocation may burn before it is stopped.
pub const DEFAULT_FUEL: u64 = 10_000_000;

/// Linear memory one invocation may grow to.
const MAX_MEMORY: usize = 16 << 20;

/// Compiles units written in the WebAssembly text format.
///
/// A unit is a module that imports nothing and exports:
///
/// - `memory`, its linear memory,
/// - `alloc: (i32) -> i32`, reserving room for the raw value,
/// - the contract's entry point, `(ptr: i32, len: i32) -> i64`, returning the
///   output's pointer in the high and its length in the low 32 bits.
///
/// Every invocation runs in a fresh store with bounded fuel and memory, so a
/// unit cannot keep state between values or run forever.
#[derive(Clone)]
pub struct WasmCompiler {
    engine: Engine,
    fuel: u64,
}

impl WasmCompiler {
    /// Create a compiler with its own wasm engine.
    pub fn new() -> wasmtime::Result<Self> {
        let mut config = wasmtime::Config::new();
        config.consume_fuel(true);
        Ok(Self { engine: Engine::new(&config)?, fuel: DEFAULT_FUEL })
    }

    /// Set the fuel each invocation gets.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }
}

impl Compiler for WasmCompiler {
    fn compile(&self, descriptor: &UnitDescriptor) -> Result<Arc<dyn Artifact>, Diagnostics> {
        let src = descriptor.body.as_str();
        check_shape(src)?;

        let module = Module::new(&self.engine, src).map_err(|err| {
            let text = format!("{err:#}");
            let (line, column) = error_position(&text).unwrap_or((1, 1));
            let message = text.lines().next().unwrap_or("invalid module").trim();
            let mut diagnostics = Diagnostics::new();
            diagnostics.push(line, column, message);
            diagnostics
        })?;

        check_contract(&module, &descriptor.contract)?;

        Ok(Arc::new(WasmArtifact {
            engine: self.engine.clone(),
            module,
            entry: descriptor.contract.entry.clone(),
            fuel: self.fuel,
        }))
    }
}

/// Reject sources that are too large or nest too deeply before parsing them.
fn check_shape(src: &str) -> Result<(), Diagnostics> {
    let mut diagnostics = Diagnostics::new();
    if src.len() > MAX_SOURCE_LEN {
        diagnostics.push(
            1,
            1,
            format!("unit source is {} bytes, more than the limit of {MAX_SOURCE_LEN}", src.len()),
        );
        return Err(diagnostics);
    }

    let mut s = Scanner::new(src);
    let mut depth = 0usize;
    while let Some(c) = s.peek() {
        if s.eat_if(";;") {
            s.eat_until('\n');
        } else if s.eat_if("(;") {
            skip_block_comment(&mut s);
        } else {
            s.eat();
            match c {
                '"' => skip_string(&mut s),
                '(' => {
                    depth += 1;
                    if depth > MAX_NESTING {
                        let (line, column) = position(src, s.cursor() - 1);
                        diagnostics.push(line, column, "unit source nests too deeply");
                        return Err(diagnostics);
                    }
                }
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
    }

    Ok(())
}

fn skip_block_comment(s: &mut Scanner) {
    let mut level = 1;
    while level > 0 {
        if s.eat_if("(;") {
            level += 1;
        } else if s.eat_if(";)") {
            level -= 1;
        } else if s.eat().is_none() {
            break;
        }
    }
}

fn skip_string(s: &mut Scanner) {
    loop {
        match s.eat() {
            Some('\\') => {
                s.eat();
            }
            Some('"') | None => break,
            _ => {}
        }
    }
}

/// One-based line and column of a byte offset.
fn position(src: &str, offset: usize) -> (usize, usize) {
    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let start = before.rfind('\n').map_or(0, |i| i + 1);
    (line, before[start..].chars().count() + 1)
}

/// Pull `line:column` out of a text-format parse error.
fn error_position(text: &str) -> Option<(usize, usize)> {
    let location = text.lines().find_map(|line| line.trim().strip_prefix("--> "))?;
    let mut parts = location.rsplitn(3, ':');
    let column = parts.next()?.trim().parse().ok()?;
    let line = parts.next()?.trim().parse().ok()?;
    Some((line, column))
}

fn check_contract(module: &Module, contract: &Contract) -> Result<(), Diagnostics> {
    let mut problems = Vec::new();

    for import in module.imports() {
        problems.push(format!(
            "unit imports `{}::{}`, but units may not import anything",
            import.module(),
            import.name()
        ));
    }

    if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
        problems.push("missing exported memory `memory`".into());
    }

    match module.get_export("alloc") {
        Some(ExternType::Func(ty)) => expect_signature(&mut problems, "alloc", &ty, "(i32) -> i32"),
        _ => problems.push("missing export `alloc`".into()),
    }

    let entry = &contract.entry;
    match module.get_export(entry) {
        Some(ExternType::Func(ty)) => {
            expect_signature(&mut problems, entry, &ty, "(i32, i32) -> i64")
        }
        _ => problems.push(format!(
            "missing entry point `{entry}` required by contract `{}`",
            contract.name
        )),
    }

    if problems.is_empty() {
        return Ok(());
    }

    let mut diagnostics = Diagnostics::new();
    for problem in problems {
        diagnostics.push(1, 1, problem);
    }
    Err(diagnostics)
}

fn expect_signature(problems: &mut Vec<String>, name: &str, ty: &FuncType, expected: &str) {
    let found = signature(ty);
    if found != expected {
        problems.push(format!("export `{name}` must have type `{expected}`, found `{found}`"));
    }
}

fn signature(ty: &FuncType) -> String {
    let params: Vec<_> = ty.params().map(|ty| type_name(&ty)).collect();
    let results: Vec<_> = ty.results().map(|ty| type_name(&ty)).collect();
    format!("({}) -> {}", params.join(", "), results.join(", "))
}

fn type_name(ty: &ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        _ => "ref",
    }
}

/// A compiled module, instantiated afresh for every value.
struct WasmArtifact {
    engine: Engine,
    module: Module,
    entry: String,
    fuel: u64,
}

impl Artifact for WasmArtifact {
    fn run(&self, raw: &str) -> Result<String, Fault> {
        let limits = StoreLimitsBuilder::new().memory_size(MAX_MEMORY).build();
        let mut store = Store::new(&self.engine, limits);
        store.limiter(|limits| limits as &mut dyn ResourceLimiter);
        store.set_fuel(self.fuel).map_err(trap)?;

        let instance = Instance::new(&mut store, &self.module, &[]).map_err(trap)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Fault::new("unit has no memory"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc").map_err(trap)?;
        let entry = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, &self.entry)
            .map_err(trap)?;

        let len = i32::try_from(raw.len()).map_err(|_| Fault::new("value is too large"))?;
        let ptr = alloc.call(&mut store, len).map_err(trap)?;
        memory
            .write(&mut store, ptr as u32 as usize, raw.as_bytes())
            .map_err(|err| Fault::new(format!("cannot pass the value: {err}")))?;

        let packed = entry.call(&mut store, (ptr, len)).map_err(trap)? as u64;
        let (start, len) = ((packed >> 32) as usize, (packed & 0xffff_ffff) as usize);
        if start.checked_add(len).is_none_or(|end| end > memory.data_size(&store)) {
            return Err(Fault::new("result lies outside the unit's memory"));
        }

        let mut output = vec![0; len];
        memory
            .read(&store, start, &mut output)
            .map_err(|err| Fault::new(format!("cannot read the result: {err}")))?;
        String::from_utf8(output).map_err(|_| Fault::new("result is not valid UTF-8"))
    }
}

fn trap(err: wasmtime::Error) -> Fault {
    Fault::new(format!("{err:#}"))
}

/// Wrap items in a module exporting `memory`, a bump `alloc` and a `$pack`
/// helper building the entry point's return value.
#[cfg(test)]
pub(crate) fn module(items: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 1024))
  (func (export "alloc") (param $len i32) (result i32)
    (global.get $next)
    (global.set $next (i32.add (global.get $next) (local.get $len))))
  (func $pack (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
{items})"#
    )
}

/// Upper-cases ASCII letters in place.
#[cfg(test)]
pub(crate) const UPPER: &str = r#"
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (local $i i32) (local $c i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (local.get $len)))
        (local.set $c (i32.load8_u (i32.add (local.get $ptr) (local.get $i))))
        (if (i32.and (i32.ge_u (local.get $c) (i32.const 97))
                     (i32.le_u (local.get $c) (i32.const 122)))
          (then
            (i32.store8 (i32.add (local.get $ptr) (local.get $i))
                        (i32.sub (local.get $c) (i32.const 32)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (call $pack (local.get $ptr) (local.get $len)))"#;

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    fn compile(body: &str) -> Result<Arc<dyn Artifact>, Diagnostics> {
        let descriptor = UnitDescriptor::new("demo", "Unit", Contract::converter(), body);
        WasmCompiler::new().unwrap().compile(&descriptor)
    }

    #[test]
    fn test_runs_entry_point() {
        let artifact = compile(&module(UPPER)).unwrap();
        assert_eq!(artifact.run("abc-1").as_deref(), Ok("ABC-1"));
        assert_eq!(artifact.run("").as_deref(), Ok(""));
    }

    #[test]
    fn test_invocations_do_not_share_state() {
        let counter = r#"
  (global $calls (mut i32) (i32.const 0))
  (data (i32.const 0) "0123456789")
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (global.set $calls (i32.add (global.get $calls) (i32.const 1)))
    (call $pack (global.get $calls) (i32.const 1)))"#;
        let artifact = compile(&module(counter)).unwrap();
        assert_eq!(artifact.run("a").as_deref(), Ok("1"));
        assert_eq!(artifact.run("a").as_deref(), Ok("1"));
    }

    #[test]
    fn test_contract_violations() {
        let wrong = r#"(func (export "convert") (param i32) (result i32) (local.get 0))"#;
        assert_eq!(
            compile(&module(wrong)).err().unwrap().text(),
            "1:1: export `convert` must have type `(i32, i32) -> i64`, found `(i32) -> i32`"
        );

        let importing = r#"(module
  (import "env" "log" (func))
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 0))
)"#;
        assert_eq!(
            compile(importing).err().unwrap().text(),
            "1:1: unit imports `env::log`, but units may not import anything\n\
             1:1: missing entry point `convert` required by contract `Converter`"
        );
    }

    #[test]
    fn test_syntax_error_is_located() {
        let diagnostics = compile("(module\n  (func (export \"convert\")").err().unwrap();
        assert_eq!(diagnostics.len(), 1);
        let diagnostic = diagnostics.iter().next().unwrap();
        assert!(diagnostic.line >= 1);
        assert!(!diagnostic.message.is_empty());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        for depth in [257, 10_000, 100_000] {
            let src = format!("{}{}", "(".repeat(depth), ")".repeat(depth));
            let diagnostics = compile(&src).err().unwrap();
            assert_eq!(diagnostics.text(), "1:257: unit source nests too deeply");
        }

        // Parentheses in comments and strings do not count.
        let quiet = format!(
            ";; {}\n(; {} ;)\n{}",
            "(".repeat(500),
            "(".repeat(500),
            module(&format!("(data (i32.const 0) \"{}\") {UPPER}", "(".repeat(500)))
        );
        assert!(compile(&quiet).is_ok());
    }

    #[test]
    fn test_oversized_source_is_rejected() {
        let src = format!("(module\n{})", ";; padding\n".repeat(MAX_SOURCE_LEN / 10));
        assert_eq!(
            compile(&src).err().unwrap().text(),
            format!(
                "1:1: unit source is {} bytes, more than the limit of {MAX_SOURCE_LEN}",
                src.len()
            )
        );
    }

    #[test]
    fn test_runaway_unit_runs_out_of_fuel() {
        let spin = r#"
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (loop $forever (br $forever))
    (i64.const 0))"#;
        let artifact = compile(&module(spin)).unwrap();
        let fault = artifact.run("x").unwrap_err();
        assert!(fault.0.contains("fuel"), "{fault}");
    }

    #[test]
    fn test_bad_result_is_a_fault() {
        let outside = r#"
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (call $pack (i32.const 65530) (i32.const 100)))"#;
        let artifact = compile(&module(outside)).unwrap();
        assert_eq!(
            artifact.run("x"),
            Err(Fault::new("result lies outside the unit's memory"))
        );

        let trapping = r#"
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (unreachable))"#;
        let artifact = compile(&module(trapping)).unwrap();
        assert!(artifact.run("x").is_err());
    }

    #[quickcheck]
    fn test_echo_passes_values_through(raw: String) -> bool {
        let echo = r#"
  (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
    (call $pack (local.get $ptr) (local.get $len)))"#;
        let artifact = compile(&module(echo)).unwrap();
        artifact.run(&raw).as_deref() == Ok(raw.as_str())
    }

    #[quickcheck]
    fn test_comments_never_nest(words: Vec<String>) -> bool {
        let text: String =
            words.iter().map(|word| format!(";; {}\n", word.replace('\n', " "))).collect();
        check_shape(&text).is_ok()
    }

    #[test]
    fn test_error_position() {
        let text = "expected `(`\n     --> <anon>:3:14\n      |";
        assert_eq!(error_position(text), Some((3, 14)));
        assert_eq!(error_position("type mismatch"), None);
        assert_eq!(position("ab\ncd", 4), (2, 2));
    }
}
