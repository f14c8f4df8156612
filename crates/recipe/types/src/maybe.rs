//! Maybe-async values
//!
//! Collaborators (helpers, provider factories, resume adapters, event
//! streams) may answer immediately or hand back a future. [`MaybeAsync`]
//! carries either shape behind one type so call sites never branch on
//! "is this a future": they `.await` it, or use the combinators to keep
//! the immediate path allocation-free.

use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// A value that is either available now or produced by a future.
pub struct MaybeAsync<'a, T>(Inner<'a, T>);

enum Inner<'a, T> {
    Ready(T),
    Pending(BoxFuture<'a, T>),
    /// The value was handed out by `poll`
    Done,
}

impl<'a, T: Send + 'a> MaybeAsync<'a, T> {
    /// Wrap an immediate value.
    pub fn ready(value: T) -> Self {
        Self(Inner::Ready(value))
    }

    /// Wrap a future.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'a,
    {
        Self(Inner::Pending(Box::pin(future)))
    }

    /// True when the value is available without polling.
    pub fn is_ready(&self) -> bool {
        matches!(self.0, Inner::Ready(_))
    }

    /// Take the immediate value, or give `self` back when it is pending.
    pub fn into_ready(self) -> Result<T, Self> {
        match self.0 {
            Inner::Ready(value) => Ok(value),
            other => Err(Self(other)),
        }
    }

    /// Transform the eventual value.
    pub fn map<U, F>(self, f: F) -> MaybeAsync<'a, U>
    where
        U: Send + 'a,
        F: FnOnce(T) -> U + Send + 'a,
    {
        match self.0 {
            Inner::Ready(value) => MaybeAsync::ready(f(value)),
            Inner::Pending(future) => MaybeAsync::from_future(async move { f(future.await) }),
            Inner::Done => MaybeAsync(Inner::Done),
        }
    }

    /// Chain another maybe-async computation onto the eventual value.
    pub fn and_then<U, F>(self, f: F) -> MaybeAsync<'a, U>
    where
        U: Send + 'a,
        F: FnOnce(T) -> MaybeAsync<'a, U> + Send + 'a,
    {
        match self.0 {
            Inner::Ready(value) => f(value),
            Inner::Pending(future) => MaybeAsync::from_future(async move { f(future.await).await }),
            Inner::Done => MaybeAsync(Inner::Done),
        }
    }

    /// Join values in order. Stays immediate when every input is immediate.
    pub fn all(items: Vec<MaybeAsync<'a, T>>) -> MaybeAsync<'a, Vec<T>> {
        if items.iter().all(|item| item.is_ready()) {
            let values = items
                .into_iter()
                .filter_map(|item| item.into_ready().ok())
                .collect();
            return MaybeAsync::ready(values);
        }
        MaybeAsync::from_future(futures::future::join_all(items))
    }
}

impl<'a, T, E> MaybeAsync<'a, Result<T, E>>
where
    T: Send + 'a,
    E: Send + 'a,
{
    /// Immediate success.
    pub fn ok(value: T) -> Self {
        Self::ready(Ok(value))
    }

    /// Immediate failure.
    pub fn err(error: E) -> Self {
        Self::ready(Err(error))
    }

    /// Flatten a fallible constructor of a fallible maybe-async value.
    ///
    /// This is the `try` combinator: a collaborator that fails before it
    /// even produces a future is folded into the same error channel as one
    /// whose future fails later.
    pub fn attempt<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<MaybeAsync<'a, Result<T, E>>, E>,
    {
        match f() {
            Ok(inner) => inner,
            Err(error) => Self::err(error),
        }
    }

    /// Map the success value.
    pub fn map_ok<U, F>(self, f: F) -> MaybeAsync<'a, Result<U, E>>
    where
        U: Send + 'a,
        F: FnOnce(T) -> U + Send + 'a,
    {
        self.map(|result| result.map(f))
    }

    /// Chain on success, short-circuit on failure.
    pub fn and_then_ok<U, F>(self, f: F) -> MaybeAsync<'a, Result<U, E>>
    where
        U: Send + 'a,
        F: FnOnce(T) -> MaybeAsync<'a, Result<U, E>> + Send + 'a,
    {
        self.and_then(|result| match result {
            Ok(value) => f(value),
            Err(error) => MaybeAsync::err(error),
        })
    }
}

impl<T> Unpin for MaybeAsync<'_, T> {}

impl<T> Future for MaybeAsync<'_, T> {
    type Output = T;

    /// # Panics
    ///
    /// When polled again after it returned `Poll::Ready`, which the
    /// [`Future`] contract forbids. A value that was combined with `map` or
    /// `and_then` after completing stays completed instead.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Inner::Pending(future) = &mut self.0 {
            let value = ready!(future.as_mut().poll(cx));
            self.0 = Inner::Done;
            return Poll::Ready(value);
        }
        match std::mem::replace(&mut self.0, Inner::Done) {
            Inner::Ready(value) => Poll::Ready(value),
            _ => panic!("MaybeAsync polled after completion"),
        }
    }
}

impl<T> std::fmt::Debug for MaybeAsync<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Inner::Ready(_) => f.write_str("MaybeAsync::Ready"),
            Inner::Pending(_) => f.write_str("MaybeAsync::Pending"),
            Inner::Done => f.write_str("MaybeAsync::Done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_values_stay_immediate_through_map() {
        let value = MaybeAsync::ready(2).map(|v| v * 21);
        assert!(value.is_ready());
        assert_eq!(value.into_ready().unwrap(), 42);
    }

    #[tokio::test]
    async fn pending_values_resolve_through_and_then() {
        let value = MaybeAsync::from_future(async { 1 })
            .and_then(|v| MaybeAsync::from_future(async move { v + 1 }));
        assert!(!value.is_ready());
        assert_eq!(value.await, 2);
    }

    #[tokio::test]
    async fn all_preserves_order_across_shapes() {
        let items = vec![
            MaybeAsync::ready(1),
            MaybeAsync::from_future(async { 2 }),
            MaybeAsync::ready(3),
        ];
        assert_eq!(MaybeAsync::all(items).await, vec![1, 2, 3]);
    }

    #[test]
    fn all_ready_inputs_join_immediately() {
        let joined = MaybeAsync::all(vec![MaybeAsync::ready("a"), MaybeAsync::ready("b")]);
        assert_eq!(joined.into_ready().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn completed_values_stay_completed_through_combinators() {
        let mut value = MaybeAsync::ready(7);
        assert_eq!((&mut value).await, 7);
        assert!(!value.is_ready());

        let mapped = value.map(|v| v + 1).and_then(|v| MaybeAsync::ready(v * 2));
        assert!(!mapped.is_ready());
        assert!(mapped.into_ready().is_err());

        let mut pending = MaybeAsync::from_future(async { "late" });
        assert_eq!((&mut pending).await, "late");
        assert_eq!(format!("{:?}", pending), "MaybeAsync::Done");
    }

    #[test]
    fn attempt_folds_early_failure() {
        let value: MaybeAsync<'_, Result<u8, String>> =
            MaybeAsync::attempt(|| Err("boom".to_string()));
        assert_eq!(value.into_ready().unwrap(), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn and_then_ok_short_circuits() {
        let value: MaybeAsync<'_, Result<u8, &str>> = MaybeAsync::err("first");
        let chained = value.and_then_ok(|v| MaybeAsync::ok(v + 1));
        assert_eq!(chained.await, Err("first"));
    }
}
