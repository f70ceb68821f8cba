use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::manager;
use crate::persist::CatalogPersistence;

#[derive(Parser, Debug, Clone)]
pub struct ExportCommand {
    /// 目录库根路径
    pub root: PathBuf,
    /// 描述符名称，支持大小写不敏感的子串匹配
    pub descriptor: String,
    /// 签名子目录
    #[arg(long, default_value = "signatures")]
    pub signatures: String,
}

impl SubCommandExtend for ExportCommand {
    fn run(&self, _opts: &Opts) -> anyhow::Result<()> {
        let persistence = CatalogPersistence::new(self.root.join(&self.signatures));
        let mut catalog = persistence.load_headers()?;
        catalog.set_root(&self.root);
        catalog.set_sig_dir(&self.signatures);

        let matched = catalog.find_descriptors(&self.descriptor);
        ensure!(!matched.is_empty(), "没有匹配 {} 的描述符", self.descriptor);

        for desc in matched {
            persistence.load_signatures(&catalog, &desc)?;
            let path = manager::text_dump(&catalog, &desc)?;
            println!("已导出 {}", path.display());
        }
        Ok(())
    }
}
