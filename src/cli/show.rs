use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, OutputFormat};
use crate::persist::CatalogPersistence;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 目录库根路径
    pub root: PathBuf,
    /// 签名子目录
    #[arg(long, default_value = "signatures")]
    pub signatures: String,
    /// 输出格式
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

impl SubCommandExtend for ShowCommand {
    fn run(&self, _opts: &Opts) -> anyhow::Result<()> {
        // 只读 headers，不加载任何签名
        let persistence = CatalogPersistence::new(self.root.join(&self.signatures));
        let catalog = persistence.load_headers()?;

        match self.format {
            OutputFormat::Json => {
                let value = json!({
                    "name": catalog.name(),
                    "image_dir": catalog.image_dir(),
                    "next_id": catalog.next_id(),
                    "entries": catalog.len(),
                    "global_descriptors": catalog.global_descriptors(),
                    "local_descriptors": catalog.local_descriptors(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Table => {
                println!("名称: {}", catalog.name());
                println!("图片目录: {}", catalog.image_dir());
                println!("条目数量: {}", catalog.len());
                println!("下一个 ID: {}", catalog.next_id());
                for desc in catalog.global_descriptors() {
                    println!("描述符: {desc} (global)");
                }
                for desc in catalog.local_descriptors() {
                    println!("描述符: {desc} (local)");
                }
            }
        }
        Ok(())
    }
}
