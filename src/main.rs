use std::process;

use pipewatch::{cli, error::Result, exchange::Exchange, run};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("pipewatch: {}", err);
        process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = cli::get_args()?;
    cli::init_logger(args.debug);

    let exchange = Exchange::new();
    cli::present(&exchange);
    run::run_with_exchange(args.config, exchange)
}
