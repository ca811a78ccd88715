use std::sync::Mutex;

/// Fixed-type free list with a provider function for fresh instances.
///
/// Pools here are an allocation optimisation, not a correctness feature;
/// the carriers drain their channels on both get and put so a reused object
/// can never leak a value across requests.
pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    pub fn new(initial: usize, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let items = (0..initial).map(|_| make()).collect();
        Self {
            items: Mutex::new(items),
            make: Box::new(make),
        }
    }

    pub fn get(&self) -> T {
        let item = self.items.lock().expect("pool lock poisoned").pop();
        item.unwrap_or_else(|| (self.make)())
    }

    pub fn put(&self, item: T) {
        self.items.lock().expect("pool lock poisoned").push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
