use std::hash::Hash;
use std::sync::Arc;

use dashmap::{DashMap, Entry};
use tokio::sync::broadcast::{channel, Sender};
use tokio::sync::Mutex;

use super::Resolver;

/// A resolver layer that shares an in-flight resolution among
/// concurrent callers for the same input: the first caller performs
/// the inner resolution, everyone else awaits its broadcast result.
pub struct Shared<R: Resolver>
where
    R::Input: Sized,
{
    inner: R,
    pending: DashMap<R::Input, Arc<Mutex<Sender<Option<R::Output>>>>>,
}

impl<R> Shared<R>
where
    R: Resolver,
    R::Input: Clone + Hash + Eq,
{
    pub fn new(inner: R) -> Self {
        Self { inner, pending: DashMap::new() }
    }
}

impl<R> Resolver for Shared<R>
where
    R: Resolver + Send + Sync + 'static,
    R::Input: Clone + Hash + Eq + Send + Sync + 'static,
    R::Output: Clone + Send + Sync + 'static,
{
    type Input = R::Input;
    type Output = R::Output;
    type Error = R::Error;

    async fn resolve(&self, input: &Self::Input) -> Result<Option<Self::Output>, Self::Error> {
        match self.pending.entry(input.clone()) {
            Entry::Occupied(occupied) => {
                let tx = occupied.get().lock().await.clone();
                drop(occupied);
                let mut rx = tx.subscribe();
                // Holding a sender clone here would keep the channel
                // open if the broadcast already happened.
                drop(tx);
                match rx.recv().await {
                    Ok(shared) => Ok(shared),
                    // The in-flight call finished between the map
                    // lookup and the subscription; resolve directly.
                    Err(_) => self.inner.resolve(input).await,
                }
            }
            Entry::Vacant(vacant) => {
                let (tx, _) = channel(1);
                vacant.insert(Arc::new(Mutex::new(tx.clone())));
                let result = self.inner.resolve(input).await;
                // Waiters observe a failure as `None`; it is up to them
                // to retry or degrade.
                let _ = tx.send(result.as_ref().cloned().transpose().and_then(Result::ok));
                self.pending.remove(input);
                result
            }
        }
    }
}
