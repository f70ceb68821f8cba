//! 签名的二进制编解码
//!
//! 所有多字节数值固定使用小端序；字符串使用 4 字节长度前缀的 UTF-8，
//! 不带终止符。签名编码为 4 字节类型标签加类型相关的负载，
//! 未注册的类型标签是致命的格式错误。

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, LazyLock, RwLock};

use anyhow::{Context, Result, bail, ensure};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};

use crate::signature::{
    CustomSignature, DenseSignature, IndexSignature, Signature, SparseSignature,
};

pub const DENSE_TYPE: i32 = 0;
pub const SPARSE_TYPE: i32 = 1;
pub const BAG_TYPE: i32 = 2;
pub const NULL_TYPE: i32 = 3;
pub const INDEX_TYPE: i32 = 4;

/// 扩展签名类型的持久化 hook
///
/// 注册后，`dump_signature` / `load_signature` 会把对应类型标签
/// 分发给 hook 处理，内置类型无需也不允许注册
pub trait SignatureHook: Send + Sync {
    /// 类型标签，不能与内置标签或其他 hook 冲突
    fn type_code(&self) -> i32;

    /// 类型名，与 [`CustomSignature::kind`] 对应
    fn kind(&self) -> &'static str;

    fn dump(&self, w: &mut dyn Write, s: &dyn CustomSignature) -> Result<()>;

    fn load(&self, r: &mut dyn Read) -> Result<Signature>;
}

#[derive(Default)]
struct HookRegistry {
    by_type: HashMap<i32, Arc<dyn SignatureHook>>,
    by_kind: HashMap<&'static str, Arc<dyn SignatureHook>>,
}

static HOOKS: LazyLock<RwLock<HookRegistry>> = LazyLock::new(|| RwLock::new(HookRegistry::default()));

const BUILTIN_TYPES: [i32; 5] = [DENSE_TYPE, SPARSE_TYPE, BAG_TYPE, NULL_TYPE, INDEX_TYPE];

/// 注册一个扩展签名类型
///
/// 同一个 (标签, 类型名) 的重复注册是幂等的；标签或类型名与已有
/// 注册冲突时返回错误
pub fn register_signature_hook(hook: Arc<dyn SignatureHook>) -> Result<()> {
    let (code, kind) = (hook.type_code(), hook.kind());
    ensure!(!BUILTIN_TYPES.contains(&code), "signature type code {code} is reserved");

    let mut registry = HOOKS.write().unwrap();
    if let Some(existing) = registry.by_type.get(&code) {
        ensure!(existing.kind() == kind, "signature type code {code} already registered");
    }
    if let Some(existing) = registry.by_kind.get(kind) {
        ensure!(existing.type_code() == code, "signature kind {kind} already registered");
    }
    registry.by_type.insert(code, hook.clone());
    registry.by_kind.insert(kind, hook);
    Ok(())
}

fn hook_by_type(code: i32) -> Option<Arc<dyn SignatureHook>> {
    HOOKS.read().unwrap().by_type.get(&code).cloned()
}

fn hook_by_kind(kind: &str) -> Option<Arc<dyn SignatureHook>> {
    HOOKS.read().unwrap().by_kind.get(kind).cloned()
}

pub fn dump_bool(w: &mut dyn Write, b: bool) -> Result<()> {
    dump_i32(w, if b { 1 } else { 0 })
}

pub fn dump_i32(w: &mut dyn Write, v: i32) -> Result<()> {
    Ok(w.write_i32::<LE>(v)?)
}

pub fn dump_i64(w: &mut dyn Write, v: i64) -> Result<()> {
    Ok(w.write_i64::<LE>(v)?)
}

pub fn dump_f32(w: &mut dyn Write, v: f32) -> Result<()> {
    Ok(w.write_f32::<LE>(v)?)
}

pub fn dump_f64(w: &mut dyn Write, v: f64) -> Result<()> {
    Ok(w.write_f64::<LE>(v)?)
}

pub fn dump_i32_array(w: &mut dyn Write, v: &[i32]) -> Result<()> {
    for x in v {
        w.write_i32::<LE>(*x)?;
    }
    Ok(())
}

/// 带长度前缀的整型数组
pub fn dump_full_i32_array(w: &mut dyn Write, v: &[i32]) -> Result<()> {
    dump_i32(w, v.len() as i32)?;
    dump_i32_array(w, v)
}

pub fn dump_i64_array(w: &mut dyn Write, v: &[i64]) -> Result<()> {
    for x in v {
        w.write_i64::<LE>(*x)?;
    }
    Ok(())
}

pub fn dump_full_i64_array(w: &mut dyn Write, v: &[i64]) -> Result<()> {
    dump_i32(w, v.len() as i32)?;
    dump_i64_array(w, v)
}

pub fn dump_string(w: &mut dyn Write, s: &str) -> Result<()> {
    dump_i32(w, s.len() as i32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn load_bool(r: &mut dyn Read) -> Result<bool> {
    Ok(load_i32(r)? == 1)
}

pub fn load_i32(r: &mut dyn Read) -> Result<i32> {
    Ok(r.read_i32::<LE>()?)
}

pub fn load_i64(r: &mut dyn Read) -> Result<i64> {
    Ok(r.read_i64::<LE>()?)
}

pub fn load_f32(r: &mut dyn Read) -> Result<f32> {
    Ok(r.read_f32::<LE>()?)
}

pub fn load_f64(r: &mut dyn Read) -> Result<f64> {
    Ok(r.read_f64::<LE>()?)
}

pub fn load_i32_array(r: &mut dyn Read, n: usize) -> Result<Vec<i32>> {
    let mut v = vec![0; n];
    r.read_i32_into::<LE>(&mut v)?;
    Ok(v)
}

pub fn load_full_i32_array(r: &mut dyn Read) -> Result<Vec<i32>> {
    let n = load_len(r)?;
    load_i32_array(r, n)
}

pub fn load_i64_array(r: &mut dyn Read, n: usize) -> Result<Vec<i64>> {
    let mut v = vec![0; n];
    r.read_i64_into::<LE>(&mut v)?;
    Ok(v)
}

pub fn load_full_i64_array(r: &mut dyn Read) -> Result<Vec<i64>> {
    let n = load_len(r)?;
    load_i64_array(r, n)
}

pub fn load_string(r: &mut dyn Read) -> Result<String> {
    let n = load_len(r)?;
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).context("invalid utf-8 in string")
}

fn load_len(r: &mut dyn Read) -> Result<usize> {
    let n = load_i32(r)?;
    ensure!(n >= 0, "negative length prefix ({n})");
    Ok(n as usize)
}

/// 写入一个签名：4 字节类型标签 + 类型相关负载
///
/// 扩展类型分发给注册的 hook；没有注册 hook 的类型是致命错误
pub fn dump_signature(w: &mut dyn Write, s: &Signature) -> Result<()> {
    match s {
        Signature::Null => dump_i32(w, NULL_TYPE),
        Signature::Dense(s) => {
            dump_i32(w, DENSE_TYPE)?;
            dump_i32(w, s.size() as i32)?;
            for v in s.data() {
                w.write_f64::<LE>(*v)?;
            }
            Ok(())
        }
        Signature::Sparse(s) => {
            dump_i32(w, SPARSE_TYPE)?;
            dump_i32(w, s.size() as i32)?;
            dump_i32(w, s.non_zero_bins() as i32)?;
            for (i, _) in s.iter() {
                w.write_i32::<LE>(i as i32)?;
            }
            for (_, v) in s.iter() {
                w.write_f64::<LE>(v)?;
            }
            Ok(())
        }
        Signature::Index(s) => {
            dump_i32(w, INDEX_TYPE)?;
            dump_i32(w, s.size() as i32)?;
            dump_i32_array(w, s.data())
        }
        Signature::Bag(bag) => {
            dump_i32(w, BAG_TYPE)?;
            dump_i32(w, bag.len() as i32)?;
            for s in bag {
                dump_signature(w, s)?;
            }
            Ok(())
        }
        Signature::Custom(s) => match hook_by_kind(s.kind()) {
            Some(hook) => {
                dump_i32(w, hook.type_code())?;
                hook.dump(w, s.as_ref())
            }
            None => bail!("dump_signature({}) not yet implemented", s.kind()),
        },
    }
}

/// 读取一个签名，先读类型标签再分发
pub fn load_signature(r: &mut dyn Read) -> Result<Signature> {
    let code = load_i32(r)?;
    match code {
        NULL_TYPE => Ok(Signature::Null),
        DENSE_TYPE => {
            let size = load_len(r)?;
            let mut data = vec![0.0; size];
            r.read_f64_into::<LE>(&mut data)?;
            Ok(Signature::Dense(DenseSignature::from_data(data)))
        }
        SPARSE_TYPE => load_sparse(r),
        INDEX_TYPE => {
            let size = load_len(r)?;
            Ok(Signature::Index(IndexSignature::from_data(load_i32_array(r, size)?)))
        }
        BAG_TYPE => {
            let size = load_len(r)?;
            let mut bag = Vec::with_capacity(size);
            for _ in 0..size {
                bag.push(load_signature(r)?);
            }
            Ok(Signature::Bag(bag))
        }
        other => match hook_by_type(other) {
            Some(hook) => hook.load(r),
            None => bail!("unknown signature type ({other})"),
        },
    }
}

fn load_sparse(r: &mut dyn Read) -> Result<Signature> {
    let size = load_len(r)?;
    let nzb = load_len(r)?;

    let indexes = load_i32_array(r, nzb).context("sparse signature index block truncated")?;
    let mut values = vec![0.0; nzb];
    r.read_f64_into::<LE>(&mut values).context("sparse signature value block truncated")?;
    ensure!(indexes.len() == values.len(), "sparse index and value blocks size mismatch");

    let mut s = SparseSignature::new(size);
    for (i, v) in indexes.iter().zip(&values) {
        ensure!(*i >= 0, "invalid sparse index ({i})");
        s.set(*i as usize, *v)?;
    }
    Ok(Signature::Sparse(s))
}
