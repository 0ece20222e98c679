use std::hash::Hash;
use std::time::Duration;

use moka::future::Cache;

use super::Resolver;

/// Cache sizing. The defaults never evict, which is the right shape
/// for a key space bounded by the number of distinct actors observed.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    pub max_capacity: Option<u64>,
    pub time_to_live: Option<Duration>,
}

/// A resolver layer that remembers successful resolutions in-process.
/// Misses (`Ok(None)`) and failures are not cached, so they will be
/// retried on the next call for the same input.
pub struct Cached<R: Resolver>
where
    R::Input: Sized,
{
    inner: R,
    cache: Cache<R::Input, R::Output>,
}

impl<R> Cached<R>
where
    R: Resolver,
    R::Input: Clone + Hash + Eq + Send + Sync + 'static,
    R::Output: Clone + Send + Sync + 'static,
{
    pub fn new(inner: R, config: CacheConfig) -> Self {
        let mut builder = Cache::builder();
        if let Some(max_capacity) = config.max_capacity {
            builder = builder.max_capacity(max_capacity);
        }
        if let Some(time_to_live) = config.time_to_live {
            builder = builder.time_to_live(time_to_live);
        }
        Self { inner, cache: builder.build() }
    }
}

impl<R> Resolver for Cached<R>
where
    R: Resolver + Send + Sync + 'static,
    R::Input: Clone + Hash + Eq + Send + Sync + 'static,
    R::Output: Clone + Send + Sync + 'static,
{
    type Input = R::Input;
    type Output = R::Output;
    type Error = R::Error;

    async fn resolve(&self, input: &Self::Input) -> Result<Option<Self::Output>, Self::Error> {
        if let Some(hit) = self.cache.get(input).await {
            return Ok(Some(hit));
        }
        let found = self.inner.resolve(input).await?;
        if let Some(value) = &found {
            self.cache.insert(input.clone(), value.clone()).await;
        }
        Ok(found)
    }
}
