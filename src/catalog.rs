use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, bail};

use crate::descriptor::{DecodedImage, ImageLoader};
use crate::signature::Signature;

/// 图片库中的一个条目
///
/// id 在创建时分配且不可变；两个签名表是并发边界，各自持锁，
/// 单次读写原子，但跨条目没有任何快照语义
pub struct Entry {
    id: u64,
    file: String,
    /// 类别标签 -> 权重，支持带权多标签
    classes: Mutex<BTreeMap<String, f64>>,
    global: Mutex<HashMap<String, Signature>>,
    local: Mutex<HashMap<String, Vec<Signature>>>,
    /// 解码后的图片，只在索引任务内短暂存在，不持久化
    image: Mutex<Option<Box<dyn DecodedImage>>>,
    /// 最近一次提取失败的原因，不持久化
    error: Mutex<Option<anyhow::Error>>,
}

impl Entry {
    pub fn new(id: u64, file: impl Into<String>) -> Self {
        Self {
            id,
            file: file.into(),
            classes: Mutex::new(BTreeMap::new()),
            global: Mutex::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
            image: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn put_class(&self, name: impl Into<String>, weight: f64) {
        self.classes.lock().unwrap().insert(name.into(), weight);
    }

    /// 权重缺省为 1.0
    pub fn put_class_default(&self, name: impl Into<String>) {
        self.put_class(name, 1.0);
    }

    pub fn remove_class(&self, name: &str) {
        self.classes.lock().unwrap().remove(name);
    }

    pub fn contains_class(&self, name: &str) -> bool {
        self.classes.lock().unwrap().contains_key(name)
    }

    pub fn classes(&self) -> BTreeMap<String, f64> {
        self.classes.lock().unwrap().clone()
    }

    pub fn put_global(&self, desc: impl Into<String>, sig: Signature) {
        self.global.lock().unwrap().insert(desc.into(), sig);
    }

    pub fn put_local(&self, desc: impl Into<String>, bag: Vec<Signature>) {
        self.local.lock().unwrap().insert(desc.into(), bag);
    }

    pub fn global_signature(&self, desc: &str) -> Option<Signature> {
        self.global.lock().unwrap().get(desc).cloned()
    }

    pub fn local_signature(&self, desc: &str) -> Option<Vec<Signature>> {
        self.local.lock().unwrap().get(desc).cloned()
    }

    pub fn has_global(&self, desc: &str) -> bool {
        self.global.lock().unwrap().contains_key(desc)
    }

    pub fn has_local(&self, desc: &str) -> bool {
        self.local.lock().unwrap().contains_key(desc)
    }

    pub fn is_indexed_by(&self, desc: &str) -> bool {
        self.has_global(desc) || self.has_local(desc)
    }

    pub fn global_descriptor_names(&self) -> Vec<String> {
        self.global.lock().unwrap().keys().cloned().collect()
    }

    pub fn local_descriptor_names(&self) -> Vec<String> {
        self.local.lock().unwrap().keys().cloned().collect()
    }

    /// 从两个签名表中同时删除一个描述符
    pub fn remove_signature(&self, desc: &str) {
        self.global.lock().unwrap().remove(desc);
        self.local.lock().unwrap().remove(desc);
    }

    pub fn remove_signatures(&self) {
        self.global.lock().unwrap().clear();
        self.local.lock().unwrap().clear();
    }

    /// 按需加载源图片，返回本次是否真正执行了加载
    pub fn load_image(&self, image_root: &Path, loader: &dyn ImageLoader) -> Result<bool> {
        let mut guard = self.image.lock().unwrap();
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(loader.load(&image_root.join(&self.file))?);
        Ok(true)
    }

    pub fn unload_image(&self) {
        self.image.lock().unwrap().take();
    }

    /// 持有锁访问已加载的图片；调用方负责在加载后尽快释放
    pub fn image(&self) -> MutexGuard<'_, Option<Box<dyn DecodedImage>>> {
        self.image.lock().unwrap()
    }

    pub fn set_error(&self, err: anyhow::Error) {
        self.error.lock().unwrap().replace(err);
    }

    pub fn clear_error(&self) {
        self.error.lock().unwrap().take();
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().as_ref().map(|e| format!("{e:#}"))
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").field("id", &self.id).field("file", &self.file).finish()
    }
}

#[derive(Default)]
struct Descriptors {
    global: BTreeSet<String>,
    local: BTreeSet<String>,
}

/// 图片库：一组条目、描述符注册表和单调递增的 id 计数器
pub struct Catalog {
    name: String,
    root: PathBuf,
    image_dir: String,
    sig_dir: String,
    next_id: u64,
    entries: Vec<Arc<Entry>>,
    descriptors: Mutex<Descriptors>,
}

impl Catalog {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        image_dir: impl Into<String>,
        sig_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            image_dir: image_dir.into(),
            sig_dir: sig_dir.into(),
            next_id: 0,
            entries: vec![],
            descriptors: Mutex::new(Descriptors::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = root.into();
    }

    pub fn image_dir(&self) -> &str {
        &self.image_dir
    }

    pub fn set_image_dir(&mut self, dir: impl Into<String>) {
        self.image_dir = dir.into();
    }

    pub fn sig_dir(&self) -> &str {
        &self.sig_dir
    }

    pub fn set_sig_dir(&mut self, dir: impl Into<String>) {
        self.sig_dir = dir.into();
    }

    /// 图片所在目录
    pub fn root_image_dir(&self) -> PathBuf {
        self.root.join(&self.image_dir)
    }

    /// 签名文件所在目录
    pub fn root_signature_dir(&self) -> PathBuf {
        self.root.join(&self.sig_dir)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = next_id;
    }

    /// 新建一个条目并分配 id；id 在目录库打开期间不会复用
    pub fn add(&mut self, file: impl Into<String>) -> Arc<Entry> {
        let entry = Arc::new(Entry::new(self.next_id, file));
        self.next_id += 1;
        self.entries.push(entry.clone());
        entry
    }

    /// 插入一个已经带 id 的条目（从磁盘加载时使用）
    ///
    /// 计数器只会前进，保证始终大于已有的最大 id
    pub fn insert(&mut self, entry: Entry) -> Arc<Entry> {
        self.next_id = self.next_id.max(entry.id() + 1);
        let entry = Arc::new(entry);
        self.entries.push(entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<Entry>] {
        &self.entries
    }

    pub fn register_global_descriptor(&self, name: impl Into<String>) {
        self.descriptors.lock().unwrap().global.insert(name.into());
    }

    pub fn register_local_descriptor(&self, name: impl Into<String>) {
        self.descriptors.lock().unwrap().local.insert(name.into());
    }

    pub fn contains_global_descriptor(&self, name: &str) -> bool {
        self.descriptors.lock().unwrap().global.contains(name)
    }

    pub fn contains_local_descriptor(&self, name: &str) -> bool {
        self.descriptors.lock().unwrap().local.contains(name)
    }

    pub fn global_descriptors(&self) -> BTreeSet<String> {
        self.descriptors.lock().unwrap().global.clone()
    }

    pub fn local_descriptors(&self) -> BTreeSet<String> {
        self.descriptors.lock().unwrap().local.clone()
    }

    pub fn all_descriptors(&self) -> BTreeSet<String> {
        let guard = self.descriptors.lock().unwrap();
        guard.global.union(&guard.local).cloned().collect()
    }

    /// 大小写不敏感的子串匹配，容忍描述符命名在不同运行间漂移
    pub fn find_descriptors(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_uppercase();
        self.all_descriptors()
            .into_iter()
            .filter(|d| d.to_uppercase().contains(&pattern))
            .collect()
    }

    /// 重新索引前清空描述符注册表和全部已有签名
    pub fn clear_descriptors(&self) {
        let mut guard = self.descriptors.lock().unwrap();
        guard.global.clear();
        guard.local.clear();
        drop(guard);
        for e in &self.entries {
            e.remove_signatures();
        }
    }

    /// 根据条目上实际存在的签名补全描述符注册表
    pub fn update_available_descriptors(&self) {
        let mut guard = self.descriptors.lock().unwrap();
        for e in &self.entries {
            guard.global.extend(e.global_descriptor_names());
            guard.local.extend(e.local_descriptor_names());
        }
    }

    /// 携带某个类别标签的所有条目；标签在整个库中都不存在时是配置错误
    pub fn entries_for_label(&self, label: &str) -> Result<Vec<Arc<Entry>>> {
        let matched: Vec<_> =
            self.entries.iter().filter(|e| e.contains_class(label)).cloned().collect();
        if matched.is_empty() {
            bail!("class label {label} unknown in catalog {}", self.name);
        }
        Ok(matched)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
