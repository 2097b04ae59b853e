use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mqwire_client::{Connection, ConsumeOptions, Consumer, Delivery, ShutdownCause};
use tracing::info;

use crate::cmd::ConsumeArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_delivery, OutputFormat};

enum Event {
    Delivery(Delivery),
    Shutdown(ShutdownCause),
}

struct ForwardingConsumer {
    tx: Sender<Event>,
}

impl Consumer for ForwardingConsumer {
    fn on_delivery(&self, delivery: Delivery) {
        let _ = self.tx.send(Event::Delivery(delivery));
    }

    fn on_shutdown(&self, _consumer_tag: &str, cause: &ShutdownCause) {
        let _ = self.tx.send(Event::Shutdown(cause.clone()));
    }
}

pub fn run(args: ConsumeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.connect.to_config()?;

    let connection =
        Connection::open(config).map_err(|err| client_error("connect failed", err))?;
    let channel = connection
        .open_channel()
        .map_err(|err| client_error("channel open failed", err))?;

    if args.prefetch > 0 {
        channel
            .qos(args.prefetch)
            .map_err(|err| client_error("qos failed", err))?;
    }

    let (tx, rx) = unbounded();
    let tag = channel
        .consume(
            &args.queue,
            ConsumeOptions {
                no_ack: args.no_ack,
                ..ConsumeOptions::default()
            },
            Arc::new(ForwardingConsumer { tx }),
        )
        .map_err(|err| client_error("consume failed", err))?;
    info!(%tag, queue = %args.queue, "consuming");

    let delivered = drain(&rx, args.count, |delivery| {
        print_delivery(delivery, format);
        if !args.no_ack {
            channel
                .ack(delivery.envelope.delivery_tag, false)
                .map_err(|err| client_error("ack failed", err))?;
        }
        Ok(())
    })?;
    info!(delivered, "consumer finished");

    if connection.is_open() {
        let _ = channel.cancel(&tag);
        connection
            .close()
            .map_err(|err| client_error("close failed", err))?;
    }

    Ok(SUCCESS)
}

fn drain<F>(rx: &Receiver<Event>, count: Option<u64>, mut each: F) -> CliResult<u64>
where
    F: FnMut(&Delivery) -> CliResult<()>,
{
    let mut delivered = 0u64;
    while count.is_none_or(|limit| delivered < limit) {
        match rx.recv() {
            Ok(Event::Delivery(delivery)) => {
                each(&delivery)?;
                delivered += 1;
            }
            Ok(Event::Shutdown(cause)) => {
                info!(%cause, "connection ended");
                break;
            }
            // Consumer dropped without a shutdown event: dispatch is done.
            Err(_) => break,
        }
    }
    Ok(delivered)
}
