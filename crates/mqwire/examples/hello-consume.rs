//! Consume the "hello" queue and print each message.

use std::sync::Arc;

use mqwire::client::{
    Connection, ConnectionConfig, ConsumeOptions, Consumer, Delivery, Result, ShutdownCause,
};

struct PrintingConsumer;

impl Consumer for PrintingConsumer {
    fn on_delivery(&self, delivery: Delivery) {
        println!(
            "({:>3}) received [{}]",
            delivery.envelope.delivery_tag,
            String::from_utf8_lossy(&delivery.body)
        );
    }

    fn on_shutdown(&self, _tag: &str, cause: &ShutdownCause) {
        println!("consumer ended: {cause}");
    }
}

fn main() -> Result<()> {
    let connection = Connection::open(ConnectionConfig::new("localhost:7712"))?;
    let channel = connection.open_channel()?;

    let options = ConsumeOptions {
        no_ack: true,
        ..ConsumeOptions::default()
    };
    channel.consume("hello", options, Arc::new(PrintingConsumer))?;
    println!("waiting for messages; press Ctrl-C to exit");

    // Deliveries arrive on the channel's dispatcher thread; park here for
    // the life of the connection.
    loop {
        std::thread::park();
    }
}
