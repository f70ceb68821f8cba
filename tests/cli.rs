use std::fs;
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use assert_cmd::prelude::*;
use imdex::config::CatalogConfig;
use imdex::descriptor::{DecodedImage, GlobalDescriptor, ImageLoader};
use imdex::indexer::{CatalogIndexer, IndexingConfig};
use imdex::manager::{self, IndexingOptions};
use imdex::signature::Signature;
use predicates::prelude::*;

macro_rules! cargo_run {
    ($($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin("imdex")?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

fn fake_pictures(root: &std::path::Path, count: usize) -> Result<()> {
    let pictures = root.join("pictures");
    fs::create_dir_all(&pictures)?;
    for i in 0..count {
        fs::write(pictures.join(format!("img_{i:03}.jpg")), b"fake")?;
    }
    Ok(())
}

#[test]
fn create_then_show() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    fake_pictures(root.path(), 5)?;

    cargo_run!("create", "demo", "-r", root.path())
        .success()
        .stdout(predicate::str::contains("5"));

    assert!(root.path().join("signatures/db_headers.obj").exists());

    cargo_run!("show", root.path())
        .success()
        .stdout(predicate::str::contains("demo").and(predicate::str::contains("5")));

    cargo_run!("show", root.path(), "--format", "json")
        .success()
        .stdout(predicate::str::contains("\"entries\": 5"));

    Ok(())
}

#[test]
fn show_missing_catalog_fails() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    cargo_run!("show", root.path()).failure();
    Ok(())
}

struct FakeImage;

impl DecodedImage for FakeImage {
    fn width(&self) -> u32 {
        1
    }

    fn height(&self) -> u32 {
        1
    }
}

struct FakeLoader;

impl ImageLoader for FakeLoader {
    fn load(&self, _path: &std::path::Path) -> Result<Box<dyn DecodedImage>> {
        Ok(Box::new(FakeImage))
    }
}

struct ConstDescriptor;

impl GlobalDescriptor for ConstDescriptor {
    fn extract(&self, _image: Option<&dyn DecodedImage>) -> Result<Signature> {
        Ok(Signature::dense_from(vec![0.25, 0.75]))
    }
}

struct ConstConfig;

impl IndexingConfig for ConstConfig {
    fn name(&self) -> &str {
        "const"
    }

    fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()> {
        indexer.add_global_descriptor("RgbHisto", Arc::new(ConstDescriptor));
        Ok(())
    }
}

#[test]
fn export_with_substring_match() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    fake_pictures(root.path(), 3)?;

    // 用库 API 准备一个带签名的目录库，再用 CLI 导出
    let conf = CatalogConfig {
        name: "demo".to_string(),
        root: root.path().to_path_buf(),
        images: "pictures".to_string(),
        signatures: "signatures".to_string(),
        suffix: "jpg,png,webp".to_string(),
    };
    let catalog = Arc::new(manager::create(&conf)?);
    manager::index(&catalog, Arc::new(FakeLoader), &ConstConfig, &IndexingOptions::default())?;
    manager::save(&catalog)?;

    // 大小写不敏感的子串匹配
    cargo_run!("export", root.path(), "histo")
        .success()
        .stdout(predicate::str::contains("demo_RgbHisto.export"));

    let content = fs::read_to_string(root.path().join("demo_RgbHisto.export"))?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "demo");
    assert_eq!(lines[1], "RgbHisto");
    assert_eq!(lines[2], "3");
    assert_eq!(lines[3], "2");
    assert!(lines[4].ends_with("0.25 0.75"));

    cargo_run!("export", root.path(), "nothing-matches").failure();

    Ok(())
}
