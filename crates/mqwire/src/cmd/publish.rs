use std::fs;

use mqwire_client::{Connection, Properties};

use crate::cmd::PublishArgs;
use crate::exit::{client_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: PublishArgs) -> CliResult<i32> {
    let config = args.connect.to_config()?;
    let body = resolve_payload(&args)?;

    let connection =
        Connection::open(config).map_err(|err| client_error("connect failed", err))?;
    let channel = connection
        .open_channel()
        .map_err(|err| client_error("channel open failed", err))?;

    let properties = Properties {
        content_type: args.content_type.clone(),
        delivery_mode: args.persistent.then_some(2),
        ..Properties::default()
    };
    channel
        .publish(&args.exchange, &args.routing_key, properties, &body)
        .map_err(|err| client_error("publish failed", err))?;

    connection
        .close()
        .map_err(|err| client_error("close failed", err))?;

    Ok(SUCCESS)
}

fn resolve_payload(args: &PublishArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}
