use std::collections::HashMap;

use clap::{Parser, Subcommand};

use proxxy::{Config, run_provision, start_app};

#[derive(Parser, Debug)]
#[command(name = "proxxy", version, about = "Caching proxy that redirects to signed S3 URLs")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Default)]
enum Command {
    /// Serve requests (default)
    #[default]
    Serve,
    /// Create the cache buckets and their expiration rule, then exit
    Provision,
}

fn main() {
    let args = Args::parse();

    // Safety: `set_var()` is only safe to call in single threaded programs when using
    // non-windows targets. Calling `set_var()` in the main function, before spawning any
    // other thread makes sure that this invariant is upheld.
    unsafe { std::env::set_var("AWS_EC2_METADATA_DISABLED", "true") };

    let vars: HashMap<String, String> = std::env::vars().collect();
    let config = Config::from_env(&vars);

    // Drop ENV hashmap to free memory before we start the server.
    drop(vars);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.worker_threads)
        .thread_stack_size(2 << 20) // 2 MiB
        .build()
        .expect("can't start tokio runtime");

    let result = match args.command.unwrap_or_default() {
        Command::Serve => runtime.block_on(start_app(config)),
        Command::Provision => runtime.block_on(run_provision(config)),
    };

    if let Err(error) = result {
        eprintln!("Application error: {error:?}");
        std::process::exit(1);
    }
}
