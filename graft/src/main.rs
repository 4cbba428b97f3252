mod cli;
mod conf;
mod connections;
mod connectors;
mod events;
mod file_store;
mod graph;
mod notify;
mod runs;
mod secrets;
mod service;
mod storage;
mod task_queue;

use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    if let Err(e) = cli::init().await {
        eprintln!("Command failed; {e:?}");
        std::process::exit(1);
    }
}
