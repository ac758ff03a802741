//! Fan-out of independent refits
//!
//! With the `parallel` feature the refits run on the rayon pool; without it
//! they run in order. Results come back in input order either way.

#[cfg(feature = "parallel")]
pub(crate) fn map_refits<T, R, F>(items: &[T], refit: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    use rayon::prelude::*;
    items.par_iter().map(refit).collect()
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn map_refits<T, R, F>(items: &[T], refit: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    items.iter().map(refit).collect()
}
