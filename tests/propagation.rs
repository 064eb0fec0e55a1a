use appenlight_apm::{
    context::{self, FutureExt},
    Category, RequestInfo, Transaction,
};
use std::{sync::Arc, time::Duration};

fn request(id: &str) -> Arc<Transaction> {
    Transaction::detached(RequestInfo::new("GET", format!("/{}", id)).with_request_id(id))
}

async fn handler(expected: &'static str, steps: u64) {
    for i in 0..steps {
        let mut span = context::start_span(Category::Remote, Some("http:GET:svc"), None)
            .expect("span outside of request");
        tokio::time::sleep(Duration::from_millis(1 + i % 3)).await;
        tokio::task::yield_now().await;
        assert_eq!(context::current().unwrap().id(), expected);
        span.end();
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_interleaved_requests_keep_their_transaction() {
    let a = request("a");
    let b = request("b");

    tokio::join!(
        handler("a", 20).with_transaction(a.clone()),
        handler("b", 15).with_transaction(b.clone()),
    );

    assert!(context::current().is_none());
    assert_eq!(a.stats().remote_calls, 20);
    assert_eq!(b.stats().remote_calls, 15);
    assert_eq!(a.open_spans(), 0);
    assert_eq!(b.open_spans(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spawned_work_follows_its_request() {
    let txns: Vec<_> = (0..8).map(|i| request(&format!("req-{}", i))).collect();

    let handles: Vec<_> = txns
        .iter()
        .cloned()
        .map(|txn| {
            tokio::spawn(
                async {
                    let child = tokio::spawn(context::propagate(async {
                        let mut span =
                            context::start_span(Category::Sql, Some("pg:SELECT 1"), None).unwrap();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        span.end();
                        context::current().map(|t| t.id().to_string())
                    }));
                    child.await.unwrap()
                }
                .with_transaction(txn),
            )
        })
        .collect();

    for (txn, handle) in txns.iter().zip(handles) {
        assert_eq!(handle.await.unwrap().as_deref(), Some(txn.id()));
        assert_eq!(txn.stats().sql_calls, 1);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_unpropagated_spawn_has_no_transaction() {
    let a = request("a");
    let seen = async { tokio::spawn(async { context::current().is_none() }).await.unwrap() }
        .with_transaction(a)
        .await;
    assert!(seen);
}

#[test]
fn test_wrapped_callback_on_another_thread() {
    let a = request("a");
    let callback = context::bind(&a, || {
        context::wrap(|| {
            let mut span = context::start_span(Category::Custom, Some("job"), None).unwrap();
            span.end();
            context::current().map(|t| t.id().to_string())
        })
    });
    let seen = std::thread::spawn(callback).join().unwrap();
    assert_eq!(seen.as_deref(), Some("a"));
    assert_eq!(a.stats().custom_calls, 1);
}
