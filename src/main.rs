mod agents;
mod android;
mod cli;
mod cpu;
mod ipc;
mod perf;
mod proc;
mod runtime;
mod shell;

use clap::Parser;

fn main() {
    env_logger::init();

    // Agent children are spawned as `capshell <agent-id>` with their IPC
    // channel on inherited fds; dispatch before option parsing.
    if let Some(first_arg) = std::env::args().nth(1) {
        if agents::child::is_agent_id(&first_arg) {
            std::process::exit(agents::child::agent_main(&first_arg));
        }
    }

    let opt = cli::Opt::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("capshell-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build the runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(shell::run(opt));
    std::process::exit(exit_code);
}
