//! 目录库的磁盘布局
//!
//! 一个 headers 文件加上每个描述符一个签名文件，全部位于签名根目录：
//!
//! ```text
//! <root>/db_headers.obj
//! <root>/sigs_<descriptor>.obj
//! ```
//!
//! headers 在加载时校验格式版本串，不做任何向前/向后兼容

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use log::info;

use crate::catalog::{Catalog, Entry};
use crate::codec;
use crate::signature::Signature;

/// 当前的格式版本串，加载时逐字比对
pub const FORMAT_VERSION: &str = "1.2";

pub const HEADERS_FILE: &str = "db_headers";
pub const SIGNATURES_FILE: &str = "sigs_";
pub const EXT: &str = ".obj";

/// 目录库的持久化引擎，绑定一个签名根目录
pub struct CatalogPersistence {
    root: PathBuf,
}

impl CatalogPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn headers_path(&self) -> PathBuf {
        self.root.join(format!("{HEADERS_FILE}{EXT}"))
    }

    pub fn signatures_path(&self, desc: &str) -> PathBuf {
        self.root.join(format!("{SIGNATURES_FILE}{desc}{EXT}"))
    }

    /// headers 和全部已注册描述符的签名
    pub fn dump(&self, catalog: &Catalog) -> Result<()> {
        info!("转储目录库 {}", catalog.name());
        self.dump_headers(catalog)?;
        self.dump_all_signatures(catalog)
    }

    pub fn dump_all_signatures(&self, catalog: &Catalog) -> Result<()> {
        for desc in catalog.all_descriptors() {
            self.dump_signatures(catalog, &desc)?;
        }
        Ok(())
    }

    pub fn dump_headers(&self, catalog: &Catalog) -> Result<()> {
        info!("转储 headers: {}", catalog.name());
        let path = self.headers_path();
        let mut w = self.writer(&path)?;

        codec::dump_string(&mut w, FORMAT_VERSION)?;
        codec::dump_string(&mut w, catalog.name())?;
        codec::dump_string(&mut w, catalog.image_dir())?;
        codec::dump_i64(&mut w, catalog.next_id() as i64)?;

        catalog.update_available_descriptors();
        let descriptors = catalog.all_descriptors();
        codec::dump_i32(&mut w, descriptors.len() as i32)?;
        for desc in &descriptors {
            codec::dump_bool(&mut w, catalog.contains_local_descriptor(desc))?;
            codec::dump_string(&mut w, desc)?;
        }

        codec::dump_i32(&mut w, catalog.len() as i32)?;
        for entry in catalog.entries() {
            codec::dump_i64(&mut w, entry.id() as i64)?;
            codec::dump_string(&mut w, entry.file())?;
            let classes = entry.classes();
            codec::dump_i32(&mut w, classes.len() as i32)?;
            for (label, weight) in &classes {
                codec::dump_string(&mut w, label)?;
                codec::dump_f64(&mut w, *weight)?;
            }
        }
        w.flush().with_context(|| format!("failed to write {}", path.display()))?;
        info!("headers 转储完成");
        Ok(())
    }

    /// 单个描述符的签名文件：条目数量加上每个条目的 (id, 签名)
    ///
    /// 局部描述符写签名包，全局描述符写单个签名，缺失写 Null
    pub fn dump_signatures(&self, catalog: &Catalog, desc: &str) -> Result<()> {
        info!("转储描述符 {desc}: {}", catalog.name());
        let local = catalog.contains_local_descriptor(desc);
        let path = self.signatures_path(desc);
        let mut w = self.writer(&path)?;

        let mut count = 0;
        codec::dump_i32(&mut w, catalog.len() as i32)?;
        for entry in catalog.entries() {
            codec::dump_i64(&mut w, entry.id() as i64)?;
            if local {
                match entry.local_signature(desc) {
                    Some(bag) => {
                        count += 1;
                        codec::dump_signature(&mut w, &Signature::Bag(bag))?;
                    }
                    None => codec::dump_signature(&mut w, &Signature::Null)?,
                }
            } else {
                match entry.global_signature(desc) {
                    Some(sig) => {
                        count += 1;
                        codec::dump_signature(&mut w, &sig)?;
                    }
                    None => codec::dump_signature(&mut w, &Signature::Null)?,
                }
            }
        }
        w.flush().with_context(|| format!("failed to write {}", path.display()))?;
        info!("描述符 {desc} 转储完成 ({count} / {})", catalog.len());
        Ok(())
    }

    /// 加载整个目录库
    ///
    /// `stop_on_first_error` 为假时，单个描述符的加载失败只记录日志并跳过
    pub fn load(&self, stop_on_first_error: bool) -> Result<Catalog> {
        let catalog = self.load_headers()?;
        for desc in catalog.all_descriptors() {
            if let Err(e) = self.load_signatures(&catalog, &desc) {
                if stop_on_first_error {
                    return Err(e);
                }
                info!("{e:#}");
            }
        }
        catalog.update_available_descriptors();
        Ok(catalog)
    }

    /// 只加载 headers，得到不含签名的目录库骨架
    ///
    /// 存储的版本串与 [`FORMAT_VERSION`] 不一致时直接失败，不填充任何条目
    pub fn load_headers(&self) -> Result<Catalog> {
        info!("加载 headers");
        let path = self.headers_path();
        let mut r = reader(&path)?;

        let version = codec::load_string(&mut r)?;
        if version != FORMAT_VERSION {
            bail!("incompatible data version ({version}/{FORMAT_VERSION})");
        }

        let name = codec::load_string(&mut r)?;
        let image_dir = codec::load_string(&mut r)?;
        let mut catalog = Catalog::new(name, &self.root, image_dir, "");
        catalog.set_next_id(codec::load_i64(&mut r)? as u64);

        let nb_desc = codec::load_i32(&mut r)?;
        for _ in 0..nb_desc {
            let local = codec::load_bool(&mut r)?;
            let desc = codec::load_string(&mut r)?;
            if local {
                catalog.register_local_descriptor(desc);
            } else {
                catalog.register_global_descriptor(desc);
            }
        }

        let nb_entries = codec::load_i32(&mut r)?;
        for _ in 0..nb_entries {
            let id = codec::load_i64(&mut r)? as u64;
            let file = codec::load_string(&mut r)?;
            let entry = Entry::new(id, file);
            let nb_classes = codec::load_i32(&mut r)?;
            for _ in 0..nb_classes {
                let label = codec::load_string(&mut r)?;
                let weight = codec::load_f64(&mut r)?;
                entry.put_class(label, weight);
            }
            catalog.insert(entry);
        }
        Ok(catalog)
    }

    /// 加载单个描述符的签名
    ///
    /// 条目数量或 id 顺序与 headers 不一致时视为文件损坏，直接失败
    pub fn load_signatures(&self, catalog: &Catalog, desc: &str) -> Result<()> {
        info!("加载描述符 {desc} 的签名");
        if !catalog.all_descriptors().contains(desc) {
            bail!("descriptor {desc} not available for loading on {}", catalog.name());
        }
        let local = catalog.contains_local_descriptor(desc);
        let path = self.signatures_path(desc);
        let mut r = reader(&path)?;

        let nb = codec::load_i32(&mut r)? as usize;
        ensure!(
            nb == catalog.len(),
            "wrong number of signatures for {desc} ({nb}/{})",
            catalog.len()
        );

        let mut count = 0;
        for entry in catalog.entries() {
            count += 1;
            let id = codec::load_i64(&mut r)? as u64;
            ensure!(id == entry.id(), "wrong id of entry for {desc} ({id}/{})", entry.id());
            let sig = codec::load_signature(&mut r)
                .with_context(|| format!("corrupt signature file for {desc}"))?;
            match sig {
                Signature::Null => {}
                Signature::Bag(bag) if local => entry.put_local(desc, bag),
                other if !local => entry.put_global(desc, other),
                other => {
                    bail!("expected a signature bag for local descriptor {desc}, got {}",
                        other.kind_name())
                }
            }
            if count % 10000 == 0 {
                info!(" - {count}");
            }
        }
        Ok(())
    }

    fn writer(&self, path: &Path) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(BufWriter::new(file))
    }
}

fn reader(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}
