use anyhow::Result;
use clap::Parser;
use imdex::cli::SubCommandExtend;
use imdex::config::{Opts, SubCommand};

fn main() -> Result<()> {
    env_logger::init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Create(config) => config.run(&opts),
        SubCommand::Show(config) => config.run(&opts),
        SubCommand::Export(config) => config.run(&opts),
    }
}
