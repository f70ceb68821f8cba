use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use imdex::catalog::Catalog;
use imdex::config::CatalogConfig;
use imdex::descriptor::{DecodedImage, GlobalDescriptor, ImageLoader};
use imdex::indexer::{CatalogIndexer, IndexingConfig};
use imdex::manager::{self, IndexingOptions};
use imdex::persist::{CatalogPersistence, FORMAT_VERSION};
use imdex::signature::Signature;
use rstest::*;
use tempfile::TempDir;

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// 在临时目录里摆出一个图片库：root/pictures/ 下若干伪图片文件
fn fake_pictures(root: &Path, names: &[&str]) -> CatalogConfig {
    let pictures = root.join("pictures");
    fs::create_dir_all(&pictures).unwrap();
    for name in names {
        fs::write(pictures.join(name), b"not really a jpeg").unwrap();
    }
    CatalogConfig {
        name: "testdb".to_string(),
        root: root.to_path_buf(),
        images: "pictures".to_string(),
        signatures: "signatures".to_string(),
        suffix: "jpg,png,webp".to_string(),
    }
}

struct FakeImage;

impl DecodedImage for FakeImage {
    fn width(&self) -> u32 {
        64
    }

    fn height(&self) -> u32 {
        48
    }
}

struct FakeLoader;

impl ImageLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn DecodedImage>> {
        // 与真实读取器一致：文件不可读就报 IO 错误
        fs::metadata(path)?;
        Ok(Box::new(FakeImage))
    }
}

/// 始终返回同一个向量的全局描述符
struct ConstDescriptor(Vec<f64>);

impl GlobalDescriptor for ConstDescriptor {
    fn extract(&self, _image: Option<&dyn DecodedImage>) -> Result<Signature> {
        Ok(Signature::dense_from(self.0.clone()))
    }
}

struct ConstConfig(Vec<f64>);

impl IndexingConfig for ConstConfig {
    fn name(&self) -> &str {
        "const"
    }

    fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()> {
        indexer.add_global_descriptor("const", Arc::new(ConstDescriptor(self.0.clone())));
        Ok(())
    }
}

#[rstest]
fn discovery_assigns_unique_ids(temp_dir: TempDir) {
    let conf = fake_pictures(
        temp_dir.path(),
        &["a.jpg", "b.png", "c.webp", "d.JPG", "skipped.txt", "noext"],
    );
    let catalog = manager::create(&conf).unwrap();

    // 后缀过滤大小写不敏感，不匹配的文件被忽略
    assert_eq!(catalog.len(), 4);

    let mut ids: Vec<u64> = catalog.entries().iter().map(|e| e.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert!(catalog.next_id() > *ids.last().unwrap());
}

#[rstest]
fn headers_roundtrip(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg", "c.jpg"]);
    let catalog = manager::create(&conf).unwrap();
    catalog.register_global_descriptor("histo");
    catalog.register_local_descriptor("patch");
    catalog.entries()[0].put_class("cat", 1.0);
    catalog.entries()[0].put_class("indoor", 0.25);
    catalog.entries()[2].put_class_default("dog");

    let persistence = CatalogPersistence::new(catalog.root_signature_dir());
    persistence.dump_headers(&catalog).unwrap();

    let loaded = manager::load(&conf, true).unwrap();
    assert_eq!(loaded.name(), "testdb");
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.next_id(), catalog.next_id());
    assert!(loaded.contains_global_descriptor("histo"));
    assert!(loaded.contains_local_descriptor("patch"));
    assert_eq!(loaded.all_descriptors().len(), 2);

    for (original, reloaded) in catalog.entries().iter().zip(loaded.entries()) {
        assert_eq!(original.id(), reloaded.id());
        assert_eq!(original.file(), reloaded.file());
        assert_eq!(original.classes(), reloaded.classes());
        // headers 不携带任何签名
        assert!(!reloaded.is_indexed_by("histo"));
    }
}

#[rstest]
fn version_gate_rejects_other_versions(temp_dir: TempDir) {
    let root = temp_dir.path().join("signatures");
    fs::create_dir_all(&root).unwrap();
    let mut buf = vec![];
    imdex::codec::dump_string(&mut buf, "0.0-other").unwrap();
    imdex::codec::dump_string(&mut buf, "testdb").unwrap();
    fs::write(root.join("db_headers.obj"), buf).unwrap();

    let err = CatalogPersistence::new(&root).load_headers().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("incompatible data version"));
    assert!(message.contains(FORMAT_VERSION));
}

#[rstest]
fn end_to_end_dump_and_reload(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg", "c.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let expected: Vec<u64> = vec![0, 1, 2];
    assert_eq!(catalog.entries().iter().map(|e| e.id()).collect::<Vec<_>>(), expected);

    let values = vec![0.5, -1.0, 0.0, 2.25];
    let report = manager::index(
        &catalog,
        Arc::new(FakeLoader),
        &ConstConfig(values.clone()),
        &IndexingOptions::default(),
    )
    .unwrap();
    assert_eq!(report.processed, 3);
    assert!(report.failed.is_empty());

    manager::save(&catalog).unwrap();
    let reloaded = manager::load(&conf, false).unwrap();
    assert_eq!(reloaded.len(), 3);
    for entry in reloaded.entries() {
        let sig = entry.global_signature("const").expect("signature missing after reload");
        assert_eq!(sig.size(), values.len());
        for (d, expected) in values.iter().enumerate() {
            assert_eq!(sig.get(d).unwrap(), *expected);
        }
    }
}

#[rstest]
fn corrupt_signature_file_is_detected(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    manager::index(
        &catalog,
        Arc::new(FakeLoader),
        &ConstConfig(vec![1.0, 2.0]),
        &IndexingOptions::default(),
    )
    .unwrap();
    manager::save(&catalog).unwrap();

    // 移除一个条目后重写 headers：条目数量与签名文件不再一致
    let mut truncated = Catalog::new("testdb", conf.root.clone(), "pictures", "signatures");
    truncated.insert(imdex::catalog::Entry::new(0, "a.jpg"));
    truncated.register_global_descriptor("const");
    let persistence = CatalogPersistence::new(catalog.root_signature_dir());
    persistence.dump_headers(&truncated).unwrap();

    let err = persistence.load(true).unwrap_err();
    assert!(err.to_string().contains("wrong number of signatures"));

    // 宽松模式下跳过坏文件，headers 仍然可用
    let loaded = persistence.load(false).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(!loaded.entries()[0].is_indexed_by("const"));
}

#[rstest]
fn text_dump_global_format(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    manager::index(
        &catalog,
        Arc::new(FakeLoader),
        &ConstConfig(vec![1.0, 0.5]),
        &IndexingOptions::default(),
    )
    .unwrap();

    let path = manager::text_dump(&catalog, "const").unwrap();
    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "testdb");
    assert_eq!(lines[1], "const");
    assert_eq!(lines[2], "2");
    assert_eq!(lines[3], "2");
    assert_eq!(lines[4], "0 1 0.5");
    assert_eq!(lines[5], "1 1 0.5");

    // 未注册的描述符是配置错误
    assert!(manager::text_dump(&catalog, "nope").is_err());
}

#[rstest]
fn text_dump_local_uses_region_ids(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg"]);
    let catalog = manager::create(&conf).unwrap();
    catalog.register_local_descriptor("patch");
    catalog.entries()[0].put_local(
        "patch",
        vec![Signature::dense_from(vec![1.0]), Signature::dense_from(vec![2.0])],
    );

    let path = manager::text_dump(&catalog, "patch").unwrap();
    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[2], "2");
    assert_eq!(lines[3], "1");
    // 区域行 id = 条目 id * 100000000 + 区域序号
    assert_eq!(lines[4], format!("{} 1", manager::unique_region_id(0, 0)));
    assert_eq!(lines[5], format!("{} 2", manager::unique_region_id(0, 1)));
    assert_eq!(manager::unique_region_id(3, 7), 300000007);
}
