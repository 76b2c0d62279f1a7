//! Memoization of numeric functions and shared buffers.
//!
//! Functions and buffers are registered under an identifier in a `ComputationCache`
//! and reused on the next request with the same identifier, e.g. when a notebook cell
//! runs again.
//!
//! Reuse is unconditional: a second request for a known identifier returns the function
//! built by the first request, whatever outputs are passed the second time. Callers have
//! to pick one identifier per distinct function. Entries are never evicted.
//!
//! The cache is single threaded; buffers are reference counted and not `Send`.
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::rc::Rc;

use ndarray::ArrayD;
use thiserror::Error;

pub type Tensor = ArrayD<f32>;

/// A pure computation over the inputs of a function. Shared buffers are read by
/// capturing them.
pub type Expression = Rc<dyn Fn(&[Tensor]) -> Tensor>;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Function takes {expected} inputs, but {actual} were given")]
    ArityError { expected: usize, actual: usize },
}

/// Wraps a closure as an `Expression`.
pub fn expression<F>(f: F) -> Expression
where
    F: Fn(&[Tensor]) -> Tensor + 'static,
{
    Rc::new(f)
}

/// A tensor that can be read and overwritten through every clone of the handle.
#[derive(Clone)]
pub struct SharedBuffer {
    value: Rc<RefCell<Tensor>>,
}

impl SharedBuffer {
    pub fn new(value: Tensor) -> Self {
        Self {
            value: Rc::new(RefCell::new(value)),
        }
    }

    pub fn get_value(&self) -> Tensor {
        self.value.borrow().clone()
    }

    pub fn set_value(&self, value: Tensor) {
        *self.value.borrow_mut() = value;
    }

    /// Whether both handles point to the same buffer.
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("shape", &self.value.borrow().shape())
            .finish()
    }
}

/// Replaces the value of `target` each time the owning function is called.
pub struct Update {
    target: SharedBuffer,
    rule: Expression,
}

impl Update {
    pub fn new<F>(target: &SharedBuffer, rule: F) -> Self
    where
        F: Fn(&[Tensor]) -> Tensor + 'static,
    {
        Self {
            target: target.clone(),
            rule: Rc::new(rule),
        }
    }
}

/// A function with a fixed number of inputs, any number of outputs and optional
/// in-place updates of shared buffers.
pub struct CompiledFunction {
    arity: usize,
    outputs: Vec<Expression>,
    updates: Vec<Update>,
}

impl CompiledFunction {
    pub fn new(arity: usize, outputs: Vec<Expression>, updates: Vec<Update>) -> Self {
        Self {
            arity,
            outputs,
            updates,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Evaluates all outputs. Updates are computed from the values the buffers had
    /// before the call and written back afterwards.
    pub fn call(&self, inputs: &[Tensor]) -> CacheResult<Vec<Tensor>> {
        if inputs.len() != self.arity {
            return Err(CacheError::ArityError {
                expected: self.arity,
                actual: inputs.len(),
            });
        }
        let results = self.outputs.iter().map(|output| output(inputs)).collect();
        let new_values: Vec<Tensor> = self
            .updates
            .iter()
            .map(|update| (update.rule)(inputs))
            .collect();
        for (update, value) in self.updates.iter().zip(new_values) {
            update.target.set_value(value);
        }
        Ok(results)
    }
}

/// Functions and shared buffers by identifier.
pub struct ComputationCache<K> {
    functions: HashMap<K, Rc<CompiledFunction>>,
    buffers: HashMap<K, SharedBuffer>,
}

impl<K> Default for ComputationCache<K> {
    fn default() -> Self {
        Self {
            functions: HashMap::new(),
            buffers: HashMap::new(),
        }
    }
}

impl<K> ComputationCache<K>
where
    K: Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the function registered under `id`, building it with `build` on the
    /// first request.
    pub fn get_or_compile<F>(&mut self, id: K, build: F) -> Rc<CompiledFunction>
    where
        F: FnOnce() -> CompiledFunction,
    {
        match self.functions.entry(id) {
            Entry::Occupied(entry) => {
                log::trace!("Reusing function {:?}", entry.key());
                Rc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                log::debug!("Compiling function {:?}", entry.key());
                Rc::clone(entry.insert(Rc::new(build())))
            }
        }
    }

    /// Shorthand for `get_or_compile` with a function taking `arity` inputs.
    pub fn func(
        &mut self,
        id: K,
        arity: usize,
        outputs: Vec<Expression>,
        updates: Vec<Update>,
    ) -> Rc<CompiledFunction> {
        self.get_or_compile(id, move || CompiledFunction::new(arity, outputs, updates))
    }

    /// Evaluates the outputs through a cached function without inputs.
    pub fn eval(&mut self, id: K, outputs: Vec<Expression>) -> CacheResult<Vec<Tensor>> {
        self.func(id, 0, outputs, Vec::new()).call(&[])
    }

    /// Returns the buffer registered under `id`. A new buffer holding `value` is created
    /// on the first request, later requests overwrite the existing buffer with `value`.
    pub fn get_or_create_buffer(&mut self, id: K, value: Tensor) -> SharedBuffer {
        match self.buffers.entry(id) {
            Entry::Occupied(entry) => {
                entry.get().set_value(value);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                log::debug!("Allocating buffer {:?}", entry.key());
                entry.insert(SharedBuffer::new(value)).clone()
            }
        }
    }

    pub fn contains_function(&self, id: &K) -> bool {
        self.functions.contains_key(id)
    }

    pub fn contains_buffer(&self, id: &K) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, array};

    fn constant(value: f32) -> Expression {
        expression(move |_| arr0(value).into_dyn())
    }

    #[test]
    fn test_buffer_is_reused() {
        let mut cache = ComputationCache::new();

        let first = cache.get_or_create_buffer("content", array![1., 2.].into_dyn());
        let second = cache.get_or_create_buffer("content", array![3., 4., 5.].into_dyn());

        assert!(first.ptr_eq(&second));
        assert_eq!(first.get_value(), array![3., 4., 5.].into_dyn());
        assert_eq!(cache.num_buffers(), 1);
    }

    #[test]
    fn test_stale_function_on_reused_id() {
        let mut cache = ComputationCache::new();

        let first = cache.func("f", 0, vec![constant(1.)], Vec::new());
        // same identifier, different outputs: the first function is returned
        let second = cache.func("f", 0, vec![constant(2.)], Vec::new());

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(second.call(&[]).unwrap(), vec![arr0(1.).into_dyn()]);
        assert_eq!(cache.num_functions(), 1);
    }

    #[test]
    fn test_builder_runs_once() {
        let mut cache = ComputationCache::new();
        let mut builds = 0;

        for _ in 0..3 {
            cache.get_or_compile(7u32, || {
                builds += 1;
                CompiledFunction::new(1, Vec::new(), Vec::new())
            });
        }

        assert_eq!(builds, 1);
        assert!(cache.contains_function(&7));
        assert!(!cache.contains_function(&8));
    }

    #[test]
    fn test_eval() {
        let mut cache = ComputationCache::new();
        let sum = expression(|_| array![1., 2., 3.].into_dyn().sum_axis(ndarray::Axis(0)));

        let results = cache.eval("sum", vec![sum, constant(4.)]).unwrap();

        assert_eq!(results, vec![arr0(6.).into_dyn(), arr0(4.).into_dyn()]);
        assert!(cache.contains_function(&"sum"));
    }

    #[test]
    fn test_inputs_and_arity() {
        let mut cache = ComputationCache::new();
        let double = expression(|inputs| &inputs[0] * 2.);
        let f = cache.func("double", 1, vec![double], Vec::new());

        assert_eq!(
            f.call(&[array![1., -1.].into_dyn()]).unwrap(),
            vec![array![2., -2.].into_dyn()]
        );
        assert!(matches!(
            f.call(&[]),
            Err(CacheError::ArityError {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn test_updates_use_previous_values() {
        let mut cache = ComputationCache::new();
        let counter = cache.get_or_create_buffer("counter", arr0(0.).into_dyn());

        let read = counter.clone();
        let output = expression(move |_| read.get_value() * 10.);
        let step = counter.clone();
        let update = Update::new(&counter, move |_| step.get_value() + 1.);
        let tick = cache.func("tick", 0, vec![output], vec![update]);

        assert_eq!(tick.call(&[]).unwrap(), vec![arr0(0.).into_dyn()]);
        assert_eq!(tick.call(&[]).unwrap(), vec![arr0(10.).into_dyn()]);
        assert_eq!(counter.get_value(), arr0(2.).into_dyn());

        // resetting through the cache is seen by the compiled function
        cache.get_or_create_buffer("counter", arr0(5.).into_dyn());
        assert_eq!(tick.call(&[]).unwrap(), vec![arr0(50.).into_dyn()]);
    }
}
