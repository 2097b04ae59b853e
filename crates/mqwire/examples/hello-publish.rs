//! Publish one message to the "hello" queue.
//!
//! Run a broker on localhost:7712, start `hello-consume` in another
//! shell, then run this.

use mqwire::client::{Connection, ConnectionConfig, Properties, Result};

fn main() -> Result<()> {
    let connection = Connection::open(ConnectionConfig::new("localhost:7712"))?;
    let channel = connection.open_channel()?;

    channel.publish(
        "",
        "hello",
        Properties {
            content_type: Some("text/plain".to_string()),
            ..Properties::default()
        },
        b"hello there",
    )?;

    connection.close()
}
