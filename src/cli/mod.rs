mod create;
mod export;
mod show;

pub use create::*;
pub use export::*;
pub use show::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}
