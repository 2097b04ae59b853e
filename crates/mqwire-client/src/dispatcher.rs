//! Per-channel consumer dispatch.
//!
//! Each channel owns one dispatcher: a single ordered worker thread
//! draining an unbounded task queue. Application callbacks run only here,
//! never on the connection's reader thread, so a slow or faulty callback
//! delays only its own channel's future tasks. The shutdown task is always
//! the last one a dispatcher processes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionInner};
use crate::consumer::{Consumer, Delivery};
use crate::handler::{ConsumerFault, ExceptionHandler};
use crate::shutdown::ShutdownCause;

pub(crate) enum DispatchTask {
    ConsumeOk {
        consumer: Arc<dyn Consumer>,
        tag: String,
    },
    CancelOk {
        consumer: Arc<dyn Consumer>,
        tag: String,
    },
    Cancel {
        consumer: Arc<dyn Consumer>,
        tag: String,
    },
    RecoverOk {
        consumers: Vec<(String, Arc<dyn Consumer>)>,
    },
    Delivery {
        consumer: Arc<dyn Consumer>,
        delivery: Delivery,
    },
    ShutDown {
        cause: ShutdownCause,
        consumers: Vec<(String, Arc<dyn Consumer>)>,
    },
}

pub(crate) struct Dispatcher {
    tx: Sender<DispatchTask>,
}

impl Dispatcher {
    /// Spawn the worker for one channel.
    pub(crate) fn spawn(
        channel_id: u16,
        connection: Weak<ConnectionInner>,
        handler: Arc<dyn ExceptionHandler>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let builder = thread::Builder::new().name(format!("mqwire-dispatch-{channel_id}"));
        let _ = builder.spawn(move || worker(channel_id, rx, connection, handler))?;
        Ok(Self { tx })
    }

    /// Queue a task in arrival order. Tasks enqueued after the shutdown
    /// marker are dropped; the worker is gone.
    pub(crate) fn enqueue(&self, task: DispatchTask) {
        if self.tx.send(task).is_err() {
            trace!("dispatch task after shutdown; dropped");
        }
    }
}

fn worker(
    channel_id: u16,
    rx: Receiver<DispatchTask>,
    connection: Weak<ConnectionInner>,
    handler: Arc<dyn ExceptionHandler>,
) {
    while let Ok(task) = rx.recv() {
        match task {
            DispatchTask::ConsumeOk { consumer, tag } => {
                guarded(channel_id, &tag, "consume-ok", &connection, &handler, || {
                    consumer.on_consume_ok(&tag)
                });
            }
            DispatchTask::CancelOk { consumer, tag } => {
                guarded(channel_id, &tag, "cancel-ok", &connection, &handler, || {
                    consumer.on_cancel_ok(&tag)
                });
            }
            DispatchTask::Cancel { consumer, tag } => {
                guarded(channel_id, &tag, "cancel", &connection, &handler, || {
                    consumer.on_cancel(&tag)
                });
            }
            DispatchTask::RecoverOk { consumers } => {
                for (tag, consumer) in consumers {
                    guarded(channel_id, &tag, "recover-ok", &connection, &handler, || {
                        consumer.on_recover_ok()
                    });
                }
            }
            DispatchTask::Delivery { consumer, delivery } => {
                let tag = delivery.consumer_tag.clone();
                guarded(channel_id, &tag, "delivery", &connection, &handler, || {
                    consumer.on_delivery(delivery)
                });
            }
            DispatchTask::ShutDown { cause, consumers } => {
                for (tag, consumer) in consumers {
                    guarded(channel_id, &tag, "shutdown", &connection, &handler, || {
                        consumer.on_shutdown(&tag, &cause)
                    });
                }
                debug!(channel = channel_id, "dispatcher terminated");
                return;
            }
        }
    }
}

/// Run one callback, catching panics so application code can never unwind
/// into, or wedge, library state.
fn guarded<F: FnOnce()>(
    channel_id: u16,
    tag: &str,
    operation: &'static str,
    connection: &Weak<ConnectionInner>,
    handler: &Arc<dyn ExceptionHandler>,
    callback: F,
) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        let fault = ConsumerFault {
            channel_id,
            consumer_tag: tag.to_string(),
            operation,
            message: panic_message(payload.as_ref()),
        };
        match connection.upgrade() {
            Some(inner) => {
                handler.on_consumer_fault(&Connection::from_inner(inner), fault);
            }
            None => warn!(%fault, "consumer fault after connection teardown"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use mqwire_frame::Properties;

    use super::*;
    use crate::consumer::Envelope;
    use crate::handler::LogConsumerFault;

    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Consumer for Recording {
        fn on_consume_ok(&self, tag: &str) {
            self.events.lock().unwrap().push(format!("consume-ok {tag}"));
        }

        fn on_delivery(&self, delivery: Delivery) {
            self.events
                .lock()
                .unwrap()
                .push(format!("delivery {}", delivery.envelope.delivery_tag));
        }

        fn on_shutdown(&self, tag: &str, _cause: &ShutdownCause) {
            self.events.lock().unwrap().push(format!("shutdown {tag}"));
        }
    }

    fn delivery(tag: &str, delivery_tag: u64) -> Delivery {
        Delivery {
            consumer_tag: tag.to_string(),
            envelope: Envelope {
                delivery_tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: "q".to_string(),
            },
            properties: Properties::default(),
            body: Bytes::from_static(b"x"),
        }
    }

    fn spawn_test_dispatcher(channel_id: u16) -> Dispatcher {
        Dispatcher::spawn(channel_id, Weak::new(), Arc::new(LogConsumerFault))
            .expect("dispatcher should spawn")
    }

    fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn tasks_run_in_arrival_order() {
        let consumer = Recording::new();
        let dispatcher = spawn_test_dispatcher(1);

        dispatcher.enqueue(DispatchTask::ConsumeOk {
            consumer: consumer.clone(),
            tag: "ctag-1".to_string(),
        });
        for n in 1..=3 {
            dispatcher.enqueue(DispatchTask::Delivery {
                consumer: consumer.clone(),
                delivery: delivery("ctag-1", n),
            });
        }
        dispatcher.enqueue(DispatchTask::ShutDown {
            cause: ShutdownCause::app_initiated(200, "bye"),
            consumers: vec![("ctag-1".to_string(), consumer.clone())],
        });

        wait_until(|| consumer.events().len() == 5);
        assert_eq!(
            consumer.events(),
            vec![
                "consume-ok ctag-1",
                "delivery 1",
                "delivery 2",
                "delivery 3",
                "shutdown ctag-1",
            ]
        );
    }

    #[test]
    fn shutdown_is_the_last_task_processed() {
        let consumer = Recording::new();
        let dispatcher = spawn_test_dispatcher(2);

        dispatcher.enqueue(DispatchTask::ShutDown {
            cause: ShutdownCause::app_initiated(200, "bye"),
            consumers: vec![("ctag-2".to_string(), consumer.clone())],
        });
        // The worker has exited; this must be silently dropped.
        dispatcher.enqueue(DispatchTask::Delivery {
            consumer: consumer.clone(),
            delivery: delivery("ctag-2", 9),
        });

        wait_until(|| !consumer.events().is_empty());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(consumer.events(), vec!["shutdown ctag-2"]);
    }

    #[test]
    fn panicking_callback_does_not_kill_the_worker() {
        struct Panicker {
            delivered: AtomicUsize,
        }
        impl Consumer for Panicker {
            fn on_delivery(&self, _delivery: Delivery) {
                if self.delivered.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("I am a bad consumer");
                }
            }
        }

        let consumer = Arc::new(Panicker {
            delivered: AtomicUsize::new(0),
        });
        let dispatcher = spawn_test_dispatcher(3);

        dispatcher.enqueue(DispatchTask::Delivery {
            consumer: consumer.clone(),
            delivery: delivery("ctag-3", 1),
        });
        dispatcher.enqueue(DispatchTask::Delivery {
            consumer: consumer.clone(),
            delivery: delivery("ctag-3", 2),
        });

        wait_until(|| consumer.delivered.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn dispatchers_for_different_channels_are_independent() {
        let blocked = Recording::new();
        let free = Recording::new();

        struct Blocker;
        impl Consumer for Blocker {
            fn on_delivery(&self, _delivery: Delivery) {
                thread::sleep(Duration::from_secs(60));
            }
        }

        let slow = spawn_test_dispatcher(4);
        let fast = spawn_test_dispatcher(5);

        slow.enqueue(DispatchTask::Delivery {
            consumer: Arc::new(Blocker),
            delivery: delivery("ctag-slow", 1),
        });
        slow.enqueue(DispatchTask::Delivery {
            consumer: blocked.clone(),
            delivery: delivery("ctag-slow", 2),
        });
        fast.enqueue(DispatchTask::Delivery {
            consumer: free.clone(),
            delivery: delivery("ctag-fast", 1),
        });

        wait_until(|| free.events() == vec!["delivery 1"]);
        assert!(blocked.events().is_empty());
    }
}
