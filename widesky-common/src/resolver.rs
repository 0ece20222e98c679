mod cached;
mod shared;

pub use self::cached::{CacheConfig, Cached};
pub use self::shared::Shared;

use std::future::Future;

/// An async key-to-value resolution step.
///
/// `Ok(None)` means the input definitively has no value; `Err` means
/// the resolution itself failed. Layers such as [`Cached`] and
/// [`Shared`] wrap any resolver without changing its contract.
#[trait_variant::make(Send)]
pub trait Resolver {
    type Input: ?Sized;
    type Output;
    type Error;

    fn resolve(
        &self,
        input: &Self::Input,
    ) -> impl Future<Output = Result<Option<Self::Output>, Self::Error>>;
}
