use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{CatalogConfig, Opts};
use crate::manager;

#[derive(Parser, Debug, Clone)]
pub struct CreateCommand {
    #[command(flatten)]
    pub config: CatalogConfig,
}

impl SubCommandExtend for CreateCommand {
    fn run(&self, _opts: &Opts) -> anyhow::Result<()> {
        let catalog = manager::create(&self.config)?;
        manager::save(&catalog)?;
        println!(
            "已创建目录库 {}，共 {} 个条目，写入 {}",
            catalog.name(),
            catalog.len(),
            catalog.root_signature_dir().display()
        );
        Ok(())
    }
}
