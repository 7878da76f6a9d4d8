//! This example renders two table columns whose cells transform raw values
//! before display. Many cells show the same value, but each distinct value is
//! transformed only once, no matter how many cells ask for it concurrently.

use std::sync::Arc;

use parking_lot::Mutex;
use transmemo::{
    Config, Contract, Coordinator, EngineSource, Sink, StaticEngine, TransformError,
    UnitDescriptor, UnitRegistry,
};

fn main() {
    let config = Config::from_toml(
        r#"
        fallback = "?"
        workers = 4
        "#,
    )
    .unwrap();

    // The status column uses logic supplied at runtime, e.g. read from a
    // settings file. The id column formats numbers as hexadecimal.
    let registry = Arc::new(UnitRegistry::new().unwrap());
    let status = UnitDescriptor::new(
        "table",
        "StatusLabel",
        Contract::converter(),
        r#"
        ;; Codes below 100 are fine, everything else needs attention.
        (module
          (memory (export "memory") 1)
          (data (i32.const 0) "ok")
          (data (i32.const 8) "check")
          (func (export "alloc") (param $len i32) (result i32)
            (i32.const 1024))
          (func (export "convert") (param $ptr i32) (param $len i32) (result i64)
            (if (result i64) (i32.lt_u (local.get $len) (i32.const 3))
              (then (i64.const 2))
              (else (i64.or (i64.shl (i64.const 8) (i64.const 32)) (i64.const 5))))))
        "#,
    );
    registry.try_compile(&status).unwrap();

    let statuses =
        Coordinator::from_config(EngineSource::unit(registry.clone(), status), config.clone())
            .unwrap();
    let ids = Coordinator::from_config(EngineSource::fixed(StaticEngine::hex()), config).unwrap();

    let rows = [("255", "12"), ("4096", "404"), ("255", "12"), ("oops", "12"), ("4096", "7")];
    let cells: Vec<_> = rows
        .iter()
        .map(|&(id, code)| {
            let id_cell = Arc::new(Cell::default());
            let status_cell = Arc::new(Cell::default());
            ids.trigger(id.to_string(), id, id_cell.clone());
            statuses.trigger(code.to_string(), code, status_cell.clone());
            (id_cell, status_cell)
        })
        .collect();

    for (id_cell, status_cell) in &cells {
        println!("{:>8} | {}", id_cell.wait(), status_cell.wait());
    }

    // Three distinct ids and three distinct codes were transformed, and the
    // status unit was compiled once.
    assert_eq!(ids.cache().len(), 3);
    assert_eq!(statuses.cache().len(), 3);
    assert_eq!(registry.compilations(), 1);
}

/// A table cell showing a transformed value.
#[derive(Default)]
struct Cell {
    text: Mutex<Option<String>>,
    done: parking_lot::Condvar,
}

impl Cell {
    /// Block until the cell has its final text.
    fn wait(&self) -> String {
        let mut text = self.text.lock();
        while text.is_none() {
            self.done.wait(&mut text);
        }
        text.clone().unwrap_or_default()
    }
}

impl Sink for Cell {
    fn set_value(&self, value: &str) {
        *self.text.lock() = Some(value.into());
    }

    fn report_error(&self, error: &TransformError) {
        eprintln!("cell failed: {error}");
    }

    fn detach(&self) {
        self.done.notify_all();
    }
}
