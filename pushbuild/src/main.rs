mod cli;
mod conf;
mod git;
mod gitreceive;
mod object_store;
mod scheduler;
mod sshd;

use human_panic::setup_panic;
use polyfmt::error;

#[tokio::main]
async fn main() {
    setup_panic!();

    let cli = match cli::Cli::new() {
        Ok(cli) => cli,
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1)
        }
    };

    if let Err(e) = cli.run().await {
        error!("{:?}", e);
        std::process::exit(1)
    }
}
