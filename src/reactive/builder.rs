//! Fluent configuration of subscriptions.
//!
//! ```rust,ignore
//! let subscription = SubscriptionBuilder::new(publisher)
//!     .transform(|rows: &Vec<Row>| Ok(rows.len()))
//!     .on_error(|e: &ObserverError| eprintln!("{e}"))
//!     .only_changes()
//!     .build_fn(|count: &usize| {
//!         println!("{count} rows");
//!         Ok(())
//!     })?;
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::error::{RxResult, ValidationError};

use super::observer::{DataObserver, ErrorObserver, ObserverError, ObserverErrorKind, ObserverResult};
use super::publisher::Publisher;
use super::scheduler::Scheduler;
use super::subscription::{Subscription, SubscriptionList, SubscriptionState};

type Sink<'a, U> = &'a mut dyn FnMut(&U) -> ObserverResult;
type Pipeline<T, U> = Arc<dyn Fn(&T, Sink<'_, U>) -> ObserverResult + Send + Sync>;

/// Builds a [`Subscription`] against a [`Publisher`].
///
/// By default the subscription receives the publisher's current value (if
/// the publisher is hot) followed by every future publish.
pub struct SubscriptionBuilder<T, U = T> {
    publisher: Arc<dyn Publisher<T>>,
    pipeline: Pipeline<T, U>,
    error_handler: Option<Arc<dyn ErrorObserver>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    clone_fn: Option<fn(&U) -> U>,
    deliver_once: bool,
    single: bool,
    only_changes: bool,
    weak: bool,
    list: Option<SubscriptionList>,
}

impl<T: Send + Sync + 'static> SubscriptionBuilder<T, T> {
    /// Starts a builder for `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self {
            publisher,
            pipeline: Arc::new(|value: &T, sink: Sink<'_, T>| sink(value)),
            error_handler: None,
            scheduler: None,
            clone_fn: None,
            deliver_once: false,
            single: false,
            only_changes: false,
            weak: false,
            list: None,
        }
    }
}

impl<T, U> SubscriptionBuilder<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    /// Maps every value before delivery.
    ///
    /// Transformers run on the publishing thread, in emission order. They may
    /// be chained; an error from any stage is reported as a `Transform`
    /// failure and nothing is delivered for that value.
    ///
    /// A scheduler set before this call must be set again afterwards, since
    /// delivery now carries a different type.
    #[must_use]
    pub fn transform<V, F>(self, transformer: F) -> SubscriptionBuilder<T, V>
    where
        V: Send + Sync + 'static,
        F: Fn(&U) -> Result<V, ObserverError> + Send + Sync + 'static,
    {
        let previous = self.pipeline;
        let pipeline: Pipeline<T, V> = Arc::new(move |value: &T, sink: Sink<'_, V>| {
            previous(value, &mut |intermediate: &U| {
                let mapped = transformer(intermediate).map_err(|mut e| {
                    e.kind = ObserverErrorKind::Transform;
                    e
                })?;
                sink(&mapped)
            })
        });

        SubscriptionBuilder {
            publisher: self.publisher,
            pipeline,
            error_handler: self.error_handler,
            scheduler: self.scheduler,
            clone_fn: None,
            deliver_once: self.deliver_once,
            single: self.single,
            only_changes: self.only_changes,
            weak: self.weak,
            list: self.list,
        }
    }

    /// Receives transformer and observer failures instead of the publisher's
    /// error channel. Only one handler is kept; a later call replaces it.
    #[must_use]
    pub fn on_error(mut self, handler: impl ErrorObserver + 'static) -> Self {
        if self.error_handler.is_some() {
            warn!("subscription error handler replaced");
        }
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Adds an error observer that runs after the user's handler, if any.
    pub(crate) fn tap_errors(mut self, tap: Arc<dyn ErrorObserver>) -> Self {
        let handler: Arc<dyn ErrorObserver> = match self.error_handler.take() {
            None => tap,
            Some(existing) => Arc::new(move |error: &ObserverError| {
                existing.on_error(error);
                tap.on_error(error);
            }),
        };
        self.error_handler = Some(handler);
        self
    }

    /// Cancels the subscription right after its first successful delivery.
    ///
    /// A delivery whose observer returns an error or panics does not count:
    /// the subscription stays active and the next value is offered again.
    /// Values emitted while that failing delivery runs are skipped.
    #[must_use]
    pub fn deliver_once(mut self) -> Self {
        self.deliver_once = true;
        self
    }

    /// Delivers the latest value once (or the next one if there is none yet)
    /// and then cancels. Cannot be combined with [`only_changes`](Self::only_changes).
    #[must_use]
    pub fn single(mut self) -> Self {
        self.single = true;
        self.deliver_once = true;
        self
    }

    /// Skips the initial replay of the publisher's current value.
    #[must_use]
    pub fn only_changes(mut self) -> Self {
        self.only_changes = true;
        self
    }

    /// Holds the observer weakly. Once the caller drops its last reference,
    /// the next delivery cancels the subscription. Requires
    /// [`build_arc`](Self::build_arc).
    #[must_use]
    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }

    /// Tracks the built subscription in `list`.
    #[must_use]
    pub fn subscription_list(mut self, list: &SubscriptionList) -> Self {
        self.list = Some(list.clone());
        self
    }

    /// Delivers values (and error notifications) through `scheduler` instead
    /// of the publishing thread. Transformers still run on the publishing
    /// thread.
    #[must_use]
    pub fn on(mut self, scheduler: Arc<dyn Scheduler>) -> Self
    where
        U: Clone,
    {
        self.scheduler = Some(scheduler);
        self.clone_fn = Some(<U as Clone>::clone);
        self
    }

    /// Finalizes the subscription with a closure observer.
    pub fn build_fn<F>(self, observer: F) -> RxResult<Subscription>
    where
        F: Fn(&U) -> ObserverResult + Send + Sync + 'static,
    {
        self.build(observer)
    }

    /// Finalizes the subscription. The subscription owns `observer`.
    pub fn build(self, observer: impl DataObserver<U> + 'static) -> RxResult<Subscription> {
        if self.weak {
            return Err(ValidationError::IllegalCombination {
                reason: "weak() requires build_arc() so the caller keeps the observer alive".to_string(),
            }
            .into());
        }
        self.build_arc(Arc::new(observer))
    }

    /// Finalizes the subscription with a shared observer.
    ///
    /// With [`weak`](Self::weak) only a weak reference is kept.
    pub fn build_arc(self, observer: Arc<dyn DataObserver<U>>) -> RxResult<Subscription> {
        if self.single && self.only_changes {
            return Err(ValidationError::IllegalCombination {
                reason: "single() and only_changes()".to_string(),
            }
            .into());
        }
        if self.scheduler.is_some() && self.clone_fn.is_none() {
            return Err(ValidationError::IllegalCombination {
                reason: "on(scheduler) must be called after transform()".to_string(),
            }
            .into());
        }

        let state = SubscriptionState::new();
        let target = if self.weak {
            Target::Weak(Arc::downgrade(&observer))
        } else {
            Target::Strong(observer)
        };
        let marshal = match (self.scheduler, self.clone_fn) {
            (Some(scheduler), Some(clone)) => Some(Marshal { scheduler, clone }),
            _ => None,
        };

        let delivery: Arc<dyn DataObserver<T>> = Arc::new(DeliveryObserver {
            state: Arc::clone(&state),
            pipeline: self.pipeline,
            target,
            error_handler: self.error_handler,
            marshal,
            deliver_once: self.deliver_once,
            claimed: Arc::new(AtomicBool::new(false)),
        });
        let weak_delivery: Weak<dyn DataObserver<T>> = Arc::downgrade(&delivery);

        // A replay may already deliver (and, for deliver-once, cancel) here;
        // `arm` then runs the teardown at once.
        let observer_id = if self.only_changes {
            self.publisher.subscribe(weak_delivery)
        } else {
            self.publisher.subscribe_replaying(weak_delivery)
        };
        let publisher = Arc::clone(&self.publisher);
        state.arm(Box::new(move || publisher.unsubscribe(observer_id)));

        let subscription = Subscription::new(state, observer_id, Box::new(delivery));
        if let Some(list) = &self.list {
            list.add(&subscription);
        }
        Ok(subscription)
    }
}

enum Target<U> {
    Strong(Arc<dyn DataObserver<U>>),
    Weak(Weak<dyn DataObserver<U>>),
}

struct Marshal<U> {
    scheduler: Arc<dyn Scheduler>,
    clone: fn(&U) -> U,
}

/// The observer actually registered with the publisher. Applies the
/// pipeline, enforces cancellation and deliver-once, and routes failures.
struct DeliveryObserver<T, U> {
    state: Arc<SubscriptionState>,
    pipeline: Pipeline<T, U>,
    target: Target<U>,
    error_handler: Option<Arc<dyn ErrorObserver>>,
    marshal: Option<Marshal<U>>,
    deliver_once: bool,
    claimed: Arc<AtomicBool>,
}

impl<T, U> DeliveryObserver<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn emit(&self, value: &U) -> ObserverResult {
        if self.state.is_cancelled() {
            return Ok(());
        }
        // Claim before delivering: only one delivery can ever count as first.
        if self.deliver_once && self.claimed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let target = match &self.target {
            Target::Strong(observer) => Arc::clone(observer),
            Target::Weak(observer) => {
                let Some(observer) = observer.upgrade() else {
                    self.state.cancel();
                    return Ok(());
                };
                observer
            }
        };

        match &self.marshal {
            None => {
                let outcome = catch_unwind(AssertUnwindSafe(|| target.on_data(value)));
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(payload) => Some(ObserverError::from_panic(payload.as_ref())),
                };
                if self.deliver_once {
                    settle_once(&self.state, &self.claimed, error.is_none());
                }
                error.map_or(Ok(()), Err)
            }
            Some(marshal) => {
                let owned = (marshal.clone)(value);
                let state = Arc::clone(&self.state);
                let claimed = Arc::clone(&self.claimed);
                let handler = self.error_handler.clone();
                let once = self.deliver_once;
                let scheduled = marshal.scheduler.schedule(Box::new(move || {
                    if state.is_cancelled() {
                        return;
                    }
                    let error = match catch_unwind(AssertUnwindSafe(|| target.on_data(&owned))) {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(err),
                        Err(payload) => Some(ObserverError::from_panic(payload.as_ref())),
                    };
                    if once {
                        settle_once(&state, &claimed, error.is_none());
                    }
                    if let Some(err) = error {
                        match handler {
                            Some(handler) => handler.on_error(&err),
                            None => warn!(error = %err, "scheduled observer failed without an error handler"),
                        }
                    }
                }));
                if scheduled.is_err() && self.deliver_once {
                    self.claimed.store(false, Ordering::Release);
                }
                scheduled.map_err(|e| ObserverError::observer(format!("failed to schedule delivery: {e}")))
            }
        }
    }

    fn route_error(&self, error: ObserverError) -> ObserverResult {
        let Some(handler) = &self.error_handler else {
            return Err(error);
        };
        if self.state.is_cancelled() {
            return Ok(());
        }
        match &self.marshal {
            None => handler.on_error(&error),
            Some(marshal) => {
                let handler = Arc::clone(handler);
                let state = Arc::clone(&self.state);
                let scheduled = marshal.scheduler.schedule(Box::new(move || {
                    if !state.is_cancelled() {
                        handler.on_error(&error);
                    }
                }));
                if let Err(e) = scheduled {
                    warn!(error = %e, "failed to schedule error notification");
                }
            }
        }
        Ok(())
    }
}

/// Ends a deliver-once attempt: a success cancels, a failure releases the
/// claim for the next value.
fn settle_once(state: &SubscriptionState, claimed: &AtomicBool, delivered: bool) {
    if delivered {
        state.cancel();
    } else {
        claimed.store(false, Ordering::Release);
    }
}

impl<T, U> DataObserver<T> for DeliveryObserver<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_data(&self, data: &T) -> ObserverResult {
        if self.state.is_cancelled() {
            return Ok(());
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (self.pipeline)(data, &mut |value: &U| self.emit(value))
        }));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => self.route_error(err),
            Err(payload) => self.route_error(ObserverError::from_panic(payload.as_ref())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::error::RxError;
    use crate::reactive::publisher::ValuePublisher;
    use crate::reactive::scheduler::{InlineScheduler, SchedulerConfig, ThreadScheduler};

    fn log_observer(log: &Arc<Mutex<Vec<i32>>>) -> impl Fn(&i32) -> ObserverResult + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |v: &i32| {
            log.lock().unwrap().push(*v);
            Ok(())
        }
    }

    #[test]
    fn replays_current_then_follows_changes() {
        let publisher = Arc::new(ValuePublisher::with_initial(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .build_fn(log_observer(&log))
            .unwrap();
        publisher.publish(2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn only_changes_skips_replay() {
        let publisher = Arc::new(ValuePublisher::with_initial(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .only_changes()
            .build_fn(log_observer(&log))
            .unwrap();
        publisher.publish(2);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn transform_chain_maps_values() {
        let publisher = Arc::new(ValuePublisher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .transform(|v: &i32| Ok(v * 10))
            .transform(|v: &i32| Ok(format!("#{v}")))
            .build_fn(move |s: &String| {
                sink.lock().unwrap().push(s.clone());
                Ok(())
            })
            .unwrap();
        publisher.publish(4);
        assert_eq!(*log.lock().unwrap(), vec!["#40".to_string()]);
    }

    #[test]
    fn transform_failure_goes_to_error_handler() {
        let publisher = Arc::new(ValuePublisher::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .transform(|v: &i32| {
                if *v < 0 {
                    Err(ObserverError::observer("negative"))
                } else {
                    Ok(*v)
                }
            })
            .on_error(move |e: &ObserverError| seen.lock().unwrap().push(e.clone()))
            .build_fn(log_observer(&log))
            .unwrap();

        publisher.publish(-1);
        publisher.publish(3);

        assert_eq!(*log.lock().unwrap(), vec![3]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ObserverErrorKind::Transform);
        assert_eq!(publisher.failures(), 0);
    }

    #[test]
    fn observer_failure_without_handler_reaches_publisher_channel() {
        let publisher = Arc::new(ValuePublisher::new());
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .build_fn(|_: &i32| Err(ObserverError::observer("bad")))
            .unwrap();
        publisher.publish(1);
        assert_eq!(publisher.failures(), 1);
    }

    #[test]
    fn panicking_observer_is_reported_to_handler() {
        let publisher = Arc::new(ValuePublisher::new());
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&kinds);
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .on_error(move |e: &ObserverError| seen.lock().unwrap().push(e.kind))
            .build_fn(|_: &i32| -> ObserverResult { panic!("observer bug") })
            .unwrap();
        publisher.publish(1);
        assert_eq!(*kinds.lock().unwrap(), vec![ObserverErrorKind::Panicked]);
    }

    #[test]
    fn deliver_once_cancels_after_first_delivery() {
        let publisher = Arc::new(ValuePublisher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = SubscriptionBuilder::new(publisher.clone())
            .deliver_once()
            .build_fn(log_observer(&log))
            .unwrap();
        publisher.publish(1);
        publisher.publish(2);
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(sub.is_cancelled());
        assert_eq!(publisher.observer_count(), 0);
    }

    #[test]
    fn deliver_once_races_count_only_one_delivery() {
        for _ in 0..32 {
            let publisher = Arc::new(ValuePublisher::<i32>::cold());
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            let _sub = SubscriptionBuilder::new(publisher.clone())
                .deliver_once()
                .build_fn(move |_: &i32| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();

            std::thread::scope(|s| {
                for i in 0..4 {
                    let publisher = &publisher;
                    s.spawn(move || publisher.publish(i));
                }
            });
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn deliver_once_retries_after_a_panicking_observer() {
        let publisher = Arc::new(ValuePublisher::<i32>::cold());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = SubscriptionBuilder::new(publisher.clone())
            .deliver_once()
            .on_error(|_: &ObserverError| {})
            .build_fn(move |v: &i32| -> ObserverResult {
                if *v == 1 {
                    panic!("first delivery blows up");
                }
                sink.lock().unwrap().push(*v);
                Ok(())
            })
            .unwrap();

        publisher.publish(1);
        assert!(!sub.is_cancelled());
        assert_eq!(publisher.observer_count(), 1);

        publisher.publish(2);
        publisher.publish(3);
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert!(sub.is_cancelled());
        assert_eq!(publisher.observer_count(), 0);
    }

    #[test]
    fn deliver_once_does_not_count_a_failed_delivery() {
        let publisher = Arc::new(ValuePublisher::<i32>::cold());
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = SubscriptionBuilder::new(publisher.clone())
            .deliver_once()
            .on_error(move |_: &ObserverError| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build_fn(move |v: &i32| {
                if *v < 0 {
                    return Err(ObserverError::observer("rejected"));
                }
                sink.lock().unwrap().push(*v);
                Ok(())
            })
            .unwrap();

        publisher.publish(-1);
        assert!(!sub.is_cancelled());
        publisher.publish(4);
        publisher.publish(5);

        assert_eq!(*log.lock().unwrap(), vec![4]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(sub.is_cancelled());
    }

    #[test]
    fn replaying_subscribe_never_duplicates_racing_publishes() {
        for _ in 0..32 {
            let publisher = Arc::new(ValuePublisher::with_initial(0));
            let log = Arc::new(Mutex::new(Vec::new()));
            let producer = {
                let publisher = Arc::clone(&publisher);
                std::thread::spawn(move || {
                    for v in 1..=200 {
                        publisher.publish(v);
                    }
                })
            };
            let _sub = SubscriptionBuilder::new(publisher.clone())
                .build_fn(log_observer(&log))
                .unwrap();
            producer.join().unwrap();

            let log = log.lock().unwrap();
            assert!(!log.is_empty());
            assert!(log.windows(2).all(|w| w[0] < w[1]), "duplicate or reordered value: {log:?}");
            assert_eq!(log.last(), Some(&200));
        }
    }

    #[test]
    fn single_takes_current_value_and_cancels() {
        let publisher = Arc::new(ValuePublisher::with_initial(7));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = SubscriptionBuilder::new(publisher.clone())
            .single()
            .build_fn(log_observer(&log))
            .unwrap();
        assert!(sub.is_cancelled());
        publisher.publish(8);
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn single_with_only_changes_is_rejected() {
        let publisher: Arc<ValuePublisher<i32>> = Arc::new(ValuePublisher::new());
        let err = SubscriptionBuilder::new(publisher)
            .single()
            .only_changes()
            .build_fn(|_: &i32| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RxError::Validation(ValidationError::IllegalCombination { .. })));
    }

    #[test]
    fn weak_requires_shared_observer() {
        let publisher: Arc<ValuePublisher<i32>> = Arc::new(ValuePublisher::new());
        let err = SubscriptionBuilder::new(publisher)
            .weak()
            .build_fn(|_: &i32| Ok(()))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn weak_observer_reclaimed_cancels_subscription() {
        let publisher = Arc::new(ValuePublisher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn DataObserver<i32>> = Arc::new(log_observer(&log));
        let sub = SubscriptionBuilder::new(publisher.clone())
            .weak()
            .build_arc(Arc::clone(&observer))
            .unwrap();

        publisher.publish(1);
        drop(observer);
        publisher.publish(2);

        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(sub.is_cancelled());
    }

    #[test]
    fn cancel_inside_callback_stops_further_deliveries() {
        let publisher = Arc::new(ValuePublisher::new());
        let slot: Arc<Mutex<Option<crate::reactive::CancelHandle>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_slot = Arc::clone(&slot);
        let counter = Arc::clone(&hits);
        let sub = SubscriptionBuilder::new(publisher.clone())
            .build_fn(move |_: &i32| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = inner_slot.lock().unwrap().as_ref() {
                    handle.cancel();
                }
                Ok(())
            })
            .unwrap();
        *slot.lock().unwrap() = Some(sub.cancel_handle());

        publisher.publish(1);
        publisher.publish(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sub.is_cancelled());
    }

    #[test]
    fn inline_scheduler_delivers() {
        let publisher = Arc::new(ValuePublisher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .on(Arc::new(InlineScheduler))
            .build_fn(log_observer(&log))
            .unwrap();
        publisher.publish(5);
        assert_eq!(*log.lock().unwrap(), vec![5]);
    }

    #[test]
    fn thread_scheduler_marshals_deliveries() {
        let scheduler = Arc::new(ThreadScheduler::new(SchedulerConfig::default()).unwrap());
        let publisher = Arc::new(ValuePublisher::new());
        let threads = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&threads);
        let _sub = SubscriptionBuilder::new(publisher.clone())
            .transform(|v: &i32| Ok(*v))
            .on(scheduler.clone())
            .build_fn(move |v: &i32| {
                seen.lock().unwrap().push((*v, std::thread::current().id()));
                Ok(())
            })
            .unwrap();

        for v in 0..5 {
            publisher.publish(v);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while threads.lock().unwrap().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let threads = threads.lock().unwrap();
        assert_eq!(threads.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(threads.iter().all(|(_, id)| *id != std::thread::current().id()));
    }

    #[test]
    fn scheduler_before_transform_is_rejected() {
        let publisher: Arc<ValuePublisher<i32>> = Arc::new(ValuePublisher::new());
        let err = SubscriptionBuilder::new(publisher)
            .on(Arc::new(InlineScheduler))
            .transform(|v: &i32| Ok(*v + 1))
            .build_fn(|_: &i32| Ok(()))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn subscription_list_tracks_built_subscriptions() {
        let publisher = Arc::new(ValuePublisher::new());
        let list = SubscriptionList::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = SubscriptionBuilder::new(publisher.clone())
            .subscription_list(&list)
            .build_fn(log_observer(&log))
            .unwrap();
        let b = SubscriptionBuilder::new(publisher.clone())
            .subscription_list(&list)
            .build_fn(log_observer(&log))
            .unwrap();
        assert_eq!(list.active_count(), 2);

        list.cancel();
        publisher.publish(1);
        assert!(log.lock().unwrap().is_empty());
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
