use mqwire_client::Connection;

use crate::cmd::InfoArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_info, OutputFormat};

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.connect.to_config()?;
    let addr = config.addr.clone();

    let connection =
        Connection::open(config).map_err(|err| client_error("connect failed", err))?;

    let state = if connection.is_open() { "open" } else { "closed" };
    print_info(&addr, state, connection.tuning(), format);

    connection
        .close()
        .map_err(|err| client_error("close failed", err))?;

    Ok(SUCCESS)
}
