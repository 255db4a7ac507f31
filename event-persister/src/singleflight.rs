//! Request coalescing: concurrent calls for the same key share one in-flight future.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

pub struct Group<T: Clone> {
    calls: Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the future built by `make` unless a call for `key` is already in flight, in which
    /// case wait for that one instead. Returns the result and whether it was shared.
    pub async fn work<F, Fut>(&self, key: &str, make: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(key) {
                // A completed call left behind by a cancelled leader is not reused.
                Some(call) if call.peek().is_none() => (call.clone(), false),
                _ => {
                    let call = make().boxed().shared();
                    calls.insert(key.to_owned(), call.clone());
                    (call, true)
                }
            }
        };

        let result = call.clone().await;

        if leader {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            if calls.get(key).is_some_and(|current| current.ptr_eq(&call)) {
                calls.remove(key);
            }
        }

        (result, !leader)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
