//! Ambient "current transaction" propagation.
//!
//! The active transaction lives in a thread-local slot. Every way of running
//! code on behalf of a request (a synchronous scope, a deferred callback, a
//! future) saves the slot, installs its own transaction and restores the saved
//! value afterwards, so interleaved requests on one thread never observe each
//! other. Work that crosses an executor boundary (`tokio::spawn`, a thread
//! pool, a timer callback) must be wrapped with [`wrap`] or [`propagate`] at
//! the point where it is scheduled.

use crate::{model::Category, span::Span, transaction::Transaction};
use std::{
    cell::RefCell,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
};

thread_local! {
    static CURRENT: RefCell<Option<Arc<Transaction>>> = RefCell::new(None);
}

/// The transaction bound to the running code, if any.
pub fn current() -> Option<Arc<Transaction>> {
    CURRENT.with(|current| current.try_borrow().ok().and_then(|txn| txn.clone()))
}

fn swap(txn: Option<Arc<Transaction>>) -> Option<Arc<Transaction>> {
    CURRENT.with(|current| match current.try_borrow_mut() {
        Ok(mut slot) => std::mem::replace(&mut *slot, txn),
        Err(_) => None,
    })
}

/// Restores the previously ambient transaction when dropped.
#[must_use = "the transaction is only ambient while the guard is alive"]
pub struct ContextGuard {
    previous: Option<Arc<Transaction>>,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        swap(self.previous.take());
    }
}

/// Make `txn` ambient on this thread until the guard drops.
///
/// Guards must be dropped in the reverse order they were created. Do not hold
/// one across an `.await`: another task polled on the same thread would run
/// under this transaction. For async code use [`bind_future`] or [`propagate`],
/// which enter and exit around every poll.
pub fn enter(txn: Option<Arc<Transaction>>) -> ContextGuard {
    ContextGuard {
        previous: swap(txn),
        _not_send: PhantomData,
    }
}

/// Run `scope` with `txn` as the current transaction.
pub fn bind<F, R>(txn: &Arc<Transaction>, scope: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = enter(Some(txn.clone()));
    scope()
}

/// Capture the current transaction for a callback that runs later.
pub fn wrap<F, R>(callback: F) -> impl FnOnce() -> R
where
    F: FnOnce() -> R,
{
    let txn = current();
    move || {
        let _guard = enter(txn);
        callback()
    }
}

/// Like [`wrap`], for callbacks invoked repeatedly (intervals, stream handlers).
pub fn wrap_mut<F, R>(mut callback: F) -> impl FnMut() -> R
where
    F: FnMut() -> R,
{
    let txn = current();
    move || {
        let _guard = enter(txn.clone());
        callback()
    }
}

/// Start a span on the current transaction. `None` outside of any request.
pub fn start_span(
    category: Category,
    name: Option<&str>,
    params: Option<serde_json::Value>,
) -> Option<Span> {
    current().map(|txn| txn.start_span(category, name, params))
}

/// A future that runs every poll with its transaction ambient.
pub struct Bound<F> {
    inner: Pin<Box<F>>,
    txn: Option<Arc<Transaction>>,
    span: tracing::Span,
}

impl<F: Future> Future for Bound<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _ctx = enter(this.txn.clone());
        let _span = this.span.enter();
        this.inner.as_mut().poll(cx)
    }
}

fn request_span(txn: Option<&Arc<Transaction>>) -> tracing::Span {
    match txn {
        Some(txn) => {
            tracing::info_span!("request", request_id = %txn.id(), route = %txn.name())
        }
        None => tracing::Span::none(),
    }
}

/// Bind `fut` to `txn` for its whole lifetime, across every suspension point.
pub fn bind_future<F: Future>(txn: Arc<Transaction>, fut: F) -> Bound<F> {
    Bound {
        span: request_span(Some(&txn)),
        inner: Box::pin(fut),
        txn: Some(txn),
    }
}

/// Bind `fut` to whatever transaction is current at the call site.
///
/// Use this when handing work to an executor:
/// `tokio::spawn(context::propagate(async { .. }))`.
pub fn propagate<F: Future>(fut: F) -> Bound<F> {
    let txn = current();
    Bound {
        span: request_span(txn.as_ref()),
        inner: Box::pin(fut),
        txn,
    }
}

pub trait FutureExt: Future + Sized {
    fn with_transaction(self, txn: Arc<Transaction>) -> Bound<Self> {
        bind_future(txn, self)
    }

    fn in_current_transaction(self) -> Bound<Self> {
        propagate(self)
    }
}

impl<F: Future> FutureExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestInfo;

    fn txn(path: &str) -> Arc<Transaction> {
        Transaction::detached(RequestInfo::new("GET", path))
    }

    fn current_name() -> Option<String> {
        current().map(|t| t.name())
    }

    #[test]
    fn test_bind_restores_previous() {
        let a = txn("/a");
        let b = txn("/b");
        assert!(current().is_none());
        bind(&a, || {
            assert_eq!(current_name().as_deref(), Some("GET:/a"));
            bind(&b, || assert_eq!(current_name().as_deref(), Some("GET:/b")));
            assert_eq!(current_name().as_deref(), Some("GET:/a"));
        });
        assert!(current().is_none());
    }

    #[test]
    fn test_enter_guards_nest() {
        let a = txn("/a");
        let b = txn("/b");
        let outer = enter(Some(a));
        {
            let _inner = enter(Some(b));
            assert_eq!(current_name().as_deref(), Some("GET:/b"));
            let _none = enter(None);
            assert!(current().is_none());
        }
        assert_eq!(current_name().as_deref(), Some("GET:/a"));
        drop(outer);
        assert!(current().is_none());
    }

    #[test]
    fn test_wrap_captures_at_schedule_time() {
        let a = txn("/a");
        let b = txn("/b");
        let deferred = bind(&a, || wrap(current_name));
        let seen = bind(&b, deferred);
        assert_eq!(seen.as_deref(), Some("GET:/a"));
        assert!(current().is_none());
    }

    #[test]
    fn test_wrap_mut_runs_repeatedly() {
        let a = txn("/tick");
        let mut names = Vec::new();
        {
            let mut tick = bind(&a, || wrap_mut(current_name));
            names.push(tick());
            names.push(tick());
        }
        assert_eq!(names, vec![Some("GET:/tick".to_string()); 2]);
    }

    #[test]
    fn test_threads_do_not_share_context() {
        let a = txn("/a");
        bind(&a, || {
            let other = std::thread::spawn(|| current().is_none()).join().unwrap();
            assert!(other);
        });
    }

    #[test]
    fn test_start_span_outside_request() {
        assert!(start_span(Category::Sql, Some("pg:SELECT 1"), None).is_none());
    }

    #[test]
    fn test_start_span_attributes_to_current() {
        let a = txn("/a");
        bind(&a, || {
            let mut span = start_span(Category::Sql, Some("pg:SELECT 1"), None).unwrap();
            span.end();
        });
        assert_eq!(a.stats().sql_calls, 1);
    }
}
