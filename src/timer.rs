//! C1: TimerRegistry — nested scoped timers, per-name accumulation.

use std::cell::RefCell;
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Default)]
struct TimerRecord {
    samples: Vec<Duration>,
}

struct Inner {
    names: Vec<String>,
    records: std::collections::HashMap<String, TimerRecord>,
    currently_timing: HashSet<String>,
}

/// Single-threaded-per-rank registry of named, nestable timers.
///
/// `timer(name)` returns a [`TimerHandle`] that starts on creation and
/// records its elapsed duration into the registry when dropped — including
/// on an unwinding panic, so a timed block that errors mid-way still
/// contributes a sample.
pub struct TimerRegistry {
    inner: RefCell<Inner>,
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                names: Vec::new(),
                records: std::collections::HashMap::new(),
                currently_timing: HashSet::new(),
            }),
        }
    }

    /// Starts a new scoped timer for `name`. Panics if a handle for the
    /// same name is already mid-flight through this registry (reentrant
    /// timing of the same name is an invariant violation, per
    /// SPEC_FULL.md §4.1 / §7).
    pub fn timer<'a>(&'a self, name: impl Into<String>) -> TimerHandle<'a> {
        let name = name.into();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.currently_timing.contains(&name) {
                panic!("timer {name:?} started while already timing");
            }
            inner.currently_timing.insert(name.clone());
            if !inner.records.contains_key(&name) {
                inner.names.push(name.clone());
                inner.records.insert(name.clone(), TimerRecord::default());
            }
        }
        TimerHandle {
            registry: self,
            name,
            start: Instant::now(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.borrow().names.clone()
    }

    fn finish(&self, name: &str, elapsed: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.currently_timing.remove(name);
        if let Some(record) = inner.records.get_mut(name) {
            record.samples.push(elapsed);
        }
    }

    /// Formats `{count, sum, mean, min, max}` per timer name, in
    /// first-seen order.
    pub fn report(&self) -> String {
        let inner = self.inner.borrow();
        let mut out = String::new();
        for name in &inner.names {
            let record = &inner.records[name];
            let count = record.samples.len();
            let sum: Duration = record.samples.iter().sum();
            let mean = if count > 0 {
                sum / count as u32
            } else {
                Duration::ZERO
            };
            let min = record.samples.iter().min().copied().unwrap_or_default();
            let max = record.samples.iter().max().copied().unwrap_or_default();
            out.push_str(&format!(
                "{name}: count={count} sum={sum:?} mean={mean:?} min={min:?} max={max:?}\n"
            ));
        }
        out
    }
}

/// RAII scoped timer handle. Records elapsed time into its parent
/// [`TimerRegistry`] on drop, regardless of how the scope is exited.
pub struct TimerHandle<'a> {
    registry: &'a TimerRegistry,
    name: String,
    start: Instant,
}

impl<'a> TimerHandle<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<'a> Drop for TimerHandle<'a> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.registry.finish(&self.name, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn records_one_sample_per_scope() {
        let reg = TimerRegistry::new();
        for _ in 0..5 {
            let _h = reg.timer("hello");
            sleep(Duration::from_millis(1));
        }
        assert_eq!(reg.names(), vec!["hello".to_string()]);
        assert!(reg.report().contains("count=5"));
    }

    #[test]
    fn records_sample_even_on_unwind() {
        let reg = TimerRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _h = reg.timer("risky");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(reg.report().contains("count=1"));
    }

    #[test]
    #[should_panic(expected = "already timing")]
    fn reentrant_same_name_panics() {
        let reg = TimerRegistry::new();
        let _outer = reg.timer("dup");
        let _inner = reg.timer("dup");
    }
}
