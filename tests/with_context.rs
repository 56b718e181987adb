//! The three-case dispatch analysis of `with_context`: inline call-through,
//! same-dispatcher wrapper, and full dispatcher switch.

mod common;

use common::init_test_logging;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weft::{
    deferred, launch, with_context, Context, Dispatcher, Error, ErrorKind, InlineDispatcher,
    JoinError, PoolDispatcher, StartMode, TaskId,
};

#[derive(Debug)]
struct Label(&'static str);

#[test]
fn unchanged_context_is_an_inline_call_through() {
    init_test_logging();
    let inline = Arc::new(InlineDispatcher::new());
    let ctx = Context::new().with_dispatcher(inline.clone());

    let outer = deferred(&ctx, StartMode::Default, move |cx| {
        let outer_id = cx.task_id();
        let outer_thread = thread::current().id();
        let value = with_context(cx, Context::new(), move |inner| {
            // Same task identity, same thread: a pure call-through.
            assert_eq!(inner.task_id(), outer_id);
            assert_eq!(thread::current().id(), outer_thread);
            Ok(11)
        })
        .map_err(|e| Error::user(e.to_string()))?;
        Ok(value)
    });
    assert_eq!(outer.wait().unwrap(), 11);
    assert_eq!(
        inline.jobs_scheduled(),
        1,
        "only the outer spawn hit the dispatcher"
    );
}

#[test]
fn non_dispatcher_change_wraps_without_a_hop() {
    init_test_logging();
    let inline = Arc::new(InlineDispatcher::new());
    let ctx = Context::new().with_dispatcher(inline.clone());

    let outer = deferred(&ctx, StartMode::Default, move |cx| {
        let outer_id = cx.task_id();
        let outer_thread = thread::current().id();
        assert!(cx.context().get::<Label>().is_none());
        let delta = Context::new().with(Label("scoped"));
        let seen = with_context(cx, delta, move |inner| {
            // New task identity so the merged elements are visible, but no
            // cross-thread handoff.
            assert_ne!(inner.task_id(), outer_id);
            assert_eq!(thread::current().id(), outer_thread);
            let label = inner.context().get::<Label>().map(|l| l.0);
            Ok(label)
        })
        .map_err(|e| Error::user(e.to_string()))?;
        Ok(seen)
    });
    assert_eq!(outer.wait().unwrap(), Some("scoped"));
    assert_eq!(inline.jobs_scheduled(), 1, "the wrapper did not dispatch");
}

#[test]
fn dispatcher_switch_submits_to_the_new_dispatcher() {
    init_test_logging();
    let inline = Arc::new(InlineDispatcher::new());
    let ctx = Context::new().with_dispatcher(inline.clone());
    let pool = Arc::new(PoolDispatcher::new("ctx-pool", 2));

    let pool_for_body = pool.clone();
    let outer = deferred(&ctx, StartMode::Default, move |cx| {
        let outer_thread = thread::current().id();
        let delta = Context::new().with_dispatcher(pool_for_body.clone() as Arc<dyn Dispatcher>);
        let value = with_context(cx, delta, move |inner| {
            assert_ne!(
                thread::current().id(),
                outer_thread,
                "body ran on the pool, not the caller's thread"
            );
            assert!(!inner.is_cancel_requested());
            Ok(5 * 5)
        })
        .map_err(|e| Error::user(e.to_string()))?;
        Ok(value)
    });
    assert_eq!(outer.wait().unwrap(), 25);
    assert_eq!(pool.jobs_scheduled(), 1, "exactly one submission to the new dispatcher");
    assert_eq!(inline.jobs_scheduled(), 1);
}

#[test]
fn failure_is_reraised_to_the_caller_not_escalated() {
    init_test_logging();
    let pool = Arc::new(PoolDispatcher::new("fail-pool", 2));
    let outer = deferred(&Context::new(), StartMode::Default, move |cx| {
        let delta = Context::new().with_dispatcher(pool.clone() as Arc<dyn Dispatcher>);
        let result = with_context::<i32, _>(cx, delta, |_| Err(Error::user("scoped boom")));
        match result {
            Err(JoinError::Failed(err)) => {
                assert_eq!(err.kind(), ErrorKind::User);
                assert_eq!(err.message(), Some("scoped boom"));
            }
            other => panic!("expected re-raised failure, got {other:?}"),
        }
        // The failure did not cancel this task.
        assert!(!cx.is_cancel_requested());
        Ok(0)
    });
    assert_eq!(outer.wait().unwrap(), 0);
}

#[test]
fn panic_in_scoped_body_is_reraised_as_panic_outcome() {
    init_test_logging();
    let outer = deferred(&Context::new(), StartMode::Default, move |cx| {
        let result = with_context::<i32, _>(cx, Context::new(), |_| panic!("scoped panic"));
        match result {
            Err(JoinError::Panicked(payload)) => {
                assert!(payload.message().contains("scoped panic"));
            }
            other => panic!("expected panic to re-raise, got {other:?}"),
        }
        Ok(1)
    });
    assert_eq!(outer.wait().unwrap(), 1);
}

#[test]
fn fast_completion_never_deadlocks_or_drops_the_result() {
    init_test_logging();
    let pool = Arc::new(PoolDispatcher::new("race-pool", 4));
    let outer = deferred(&Context::new(), StartMode::Default, move |cx| {
        let mut total: u64 = 0;
        for i in 0..200u64 {
            let delta =
                Context::new().with_dispatcher(pool.clone() as Arc<dyn Dispatcher>);
            // Trivially fast bodies race the caller's suspension bookkeeping.
            let value = with_context(cx, delta, move |_| Ok(i))
                .map_err(|e| Error::user(e.to_string()))?;
            total += value;
        }
        Ok(total)
    });
    assert_eq!(outer.wait().unwrap(), (0..200u64).sum::<u64>());
}

#[test]
fn cancelling_the_caller_cancels_the_scoped_body() {
    init_test_logging();
    let pool = Arc::new(PoolDispatcher::new("cancel-pool", 2));
    let scoped_ids: Arc<parking_lot::Mutex<Vec<TaskId>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let ids = scoped_ids.clone();
    let outer = launch(&Context::new(), StartMode::Default, move |cx| {
        let delta = Context::new().with_dispatcher(pool.clone() as Arc<dyn Dispatcher>);
        let nested = with_context::<(), _>(cx, delta, move |inner| {
            ids.lock().push(inner.task_id());
            loop {
                inner.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
        });
        match nested {
            Err(JoinError::Cancelled(_)) => {
                Err(Error::new(ErrorKind::Cancelled).with_message("scope cancelled"))
            }
            other => panic!("expected cancellation to reach the scoped body, got {other:?}"),
        }
    });

    // Give the scoped body time to start spinning on the pool.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scoped_ids.lock().is_empty() {
        assert!(std::time::Instant::now() < deadline, "scoped body never started");
        thread::sleep(Duration::from_millis(1));
    }
    outer.cancel(weft::CancelReason::user("stop the scope"));
    outer.join();
    assert_eq!(outer.stage(), weft::Stage::Cancelled);
}

#[test]
fn concurrent_dispatcher_switches_from_many_tasks() {
    init_test_logging();
    let shared = Arc::new(PoolDispatcher::new("shared-pool", 4));
    let outers: Vec<_> = (0..8u64)
        .map(|task_index| {
            let shared = shared.clone();
            deferred(&Context::new(), StartMode::Default, move |cx| {
                let mut acc = 0u64;
                for i in 0..50u64 {
                    let delta = Context::new()
                        .with_dispatcher(shared.clone() as Arc<dyn Dispatcher>);
                    let value = with_context(cx, delta, move |_| {
                        if i % 2 == 0 {
                            thread::sleep(Duration::from_millis(1));
                        }
                        Ok(task_index * 1000 + i)
                    })
                    .map_err(|e| Error::user(e.to_string()))?;
                    assert_eq!(value, task_index * 1000 + i);
                    acc += value;
                }
                Ok(acc)
            })
        })
        .collect();

    for (task_index, outer) in outers.iter().enumerate() {
        let task_index = task_index as u64;
        let expected: u64 = (0..50u64).map(|i| task_index * 1000 + i).sum();
        assert_eq!(outer.wait().unwrap(), expected);
    }
}

#[test]
fn counting_dispatcher_observes_zero_hops_for_equal_contexts() {
    init_test_logging();
    // A wrapper that delegates inline but counts every hop.
    struct Counting {
        hops: AtomicUsize,
    }
    impl Dispatcher for Counting {
        fn schedule(&self, job: weft::Job) {
            self.hops.fetch_add(1, Ordering::SeqCst);
            job();
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    let counting = Arc::new(Counting {
        hops: AtomicUsize::new(0),
    });
    let ctx = Context::new().with_dispatcher(counting.clone() as Arc<dyn Dispatcher>);
    let outer = deferred(&ctx, StartMode::Default, |cx| {
        let before_equal = with_context(cx, Context::new(), |_| Ok(1))
            .map_err(|e| Error::user(e.to_string()))?;
        Ok(before_equal)
    });
    assert_eq!(outer.wait().unwrap(), 1);
    assert_eq!(
        counting.hops.load(Ordering::SeqCst),
        1,
        "the equal-context body executed without a scheduling hop"
    );
}
