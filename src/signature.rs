use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail, ensure};

/// 稠密向量签名，固定长度的 f64 数组
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DenseSignature {
    data: Vec<f64>,
}

impl DenseSignature {
    /// 创建一个全零的稠密签名
    pub fn new(size: usize) -> Self {
        Self { data: vec![0.0; size] }
    }

    pub fn from_data(data: Vec<f64>) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, idx: usize) -> Result<f64> {
        match self.data.get(idx) {
            Some(v) => Ok(*v),
            None => bail!("invalid signature index ({idx})"),
        }
    }

    pub fn set(&mut self, idx: usize, val: f64) -> Result<()> {
        match self.data.get_mut(idx) {
            Some(v) => {
                *v = val;
                Ok(())
            }
            None => bail!("invalid signature index ({idx})"),
        }
    }

    pub fn non_zero_bins(&self) -> usize {
        self.data.iter().filter(|v| **v != 0.0).count()
    }
}

/// 稀疏向量签名，只存储非零分量
///
/// NOTE: 零值永远不会被物化，`set(i, 0.0)` 等价于删除该分量
#[derive(Debug, Clone, PartialEq)]
pub struct SparseSignature {
    size: usize,
    data: BTreeMap<usize, f64>,
}

impl SparseSignature {
    pub fn new(size: usize) -> Self {
        Self { size, data: BTreeMap::new() }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, idx: usize) -> Result<f64> {
        if let Some(v) = self.data.get(&idx) {
            return Ok(*v);
        }
        ensure!(idx < self.size, "invalid signature index ({idx})");
        Ok(0.0)
    }

    pub fn set(&mut self, idx: usize, val: f64) -> Result<()> {
        ensure!(idx < self.size, "invalid signature index ({idx})");
        if val == 0.0 {
            self.data.remove(&idx);
        } else {
            self.data.insert(idx, val);
        }
        Ok(())
    }

    pub fn non_zero_bins(&self) -> usize {
        self.data.len()
    }

    /// 按索引升序遍历非零分量
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.data.iter().map(|(&i, &v)| (i, v))
    }
}

/// 整数索引签名，通常是量化后的码字列表，不参与距离计算
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSignature {
    data: Vec<i32>,
}

impl IndexSignature {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn from_data(data: Vec<i32>) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn get(&self, idx: usize) -> Result<i32> {
        match self.data.get(idx) {
            Some(v) => Ok(*v),
            None => bail!("invalid signature index ({idx})"),
        }
    }

    pub fn set(&mut self, idx: usize, val: i32) -> Result<()> {
        match self.data.get_mut(idx) {
            Some(v) => {
                *v = val;
                Ok(())
            }
            None => bail!("invalid signature index ({idx})"),
        }
    }

    pub fn non_zero_bins(&self) -> usize {
        self.data.iter().filter(|v| **v != 0).count()
    }
}

/// 扩展签名类型，配合 [`crate::codec::register_signature_hook`]
/// 可以在不修改编解码器的前提下持久化新的签名种类
pub trait CustomSignature: fmt::Debug + Send + Sync {
    /// 类型名，必须与注册的 hook 一致
    fn kind(&self) -> &'static str;

    fn size(&self) -> usize;

    fn get(&self, idx: usize) -> Result<f64>;

    fn non_zero_bins(&self) -> usize;
}

/// 一个条目（或一个区域）的签名
///
/// 全局描述符每个条目产生一个签名，局部描述符产生一个 `Bag`，
/// 每个元素对应一个支持区域
#[derive(Debug, Clone)]
pub enum Signature {
    /// 空占位，持久化时写入 NULL 标签
    Null,
    Dense(DenseSignature),
    Sparse(SparseSignature),
    Index(IndexSignature),
    /// 有序签名包，元素允许为 Null
    Bag(Vec<Signature>),
    /// 已注册 hook 的扩展类型
    Custom(Arc<dyn CustomSignature>),
}

impl Signature {
    pub fn dense(size: usize) -> Self {
        Signature::Dense(DenseSignature::new(size))
    }

    pub fn dense_from(data: Vec<f64>) -> Self {
        Signature::Dense(DenseSignature::from_data(data))
    }

    pub fn sparse(size: usize) -> Self {
        Signature::Sparse(SparseSignature::new(size))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Signature::Null)
    }

    /// 是否是可以按维读取的向量类型
    pub fn is_vector(&self) -> bool {
        matches!(self, Signature::Dense(_) | Signature::Sparse(_) | Signature::Custom(_))
    }

    /// 维度；对 Bag 返回元素数量，对 Null 返回 0
    pub fn size(&self) -> usize {
        match self {
            Signature::Null => 0,
            Signature::Dense(s) => s.size(),
            Signature::Sparse(s) => s.size(),
            Signature::Index(s) => s.size(),
            Signature::Bag(b) => b.len(),
            Signature::Custom(s) => s.size(),
        }
    }

    pub fn get(&self, idx: usize) -> Result<f64> {
        match self {
            Signature::Dense(s) => s.get(idx),
            Signature::Sparse(s) => s.get(idx),
            Signature::Custom(s) => s.get(idx),
            other => bail!("signature kind {} does not support per-bin access", other.kind_name()),
        }
    }

    pub fn set(&mut self, idx: usize, val: f64) -> Result<()> {
        match self {
            Signature::Dense(s) => s.set(idx, val),
            Signature::Sparse(s) => s.set(idx, val),
            other => bail!("signature kind {} is read-only", other.kind_name()),
        }
    }

    /// 非零分量数量
    pub fn non_zero_bins(&self) -> usize {
        match self {
            Signature::Null => 0,
            Signature::Dense(s) => s.non_zero_bins(),
            Signature::Sparse(s) => s.non_zero_bins(),
            Signature::Index(s) => s.non_zero_bins(),
            Signature::Bag(b) => b.iter().map(|s| s.non_zero_bins()).sum(),
            Signature::Custom(s) => s.non_zero_bins(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Signature::Null => "null",
            Signature::Dense(_) => "dense",
            Signature::Sparse(_) => "sparse",
            Signature::Index(_) => "index",
            Signature::Bag(_) => "bag",
            Signature::Custom(s) => s.kind(),
        }
    }

    pub fn add_to(&mut self, idx: usize, val: f64) -> Result<()> {
        let v = self.get(idx)?;
        self.set(idx, v + val)
    }

    pub fn multiply(&mut self, coef: f64) -> Result<()> {
        for d in 0..self.size() {
            let v = self.get(d)?;
            self.set(d, v * coef)?;
        }
        Ok(())
    }

    pub fn set_all(&mut self, val: f64) -> Result<()> {
        for d in 0..self.size() {
            self.set(d, val)?;
        }
        Ok(())
    }

    pub fn sum(&self) -> Result<f64> {
        match self {
            Signature::Dense(s) => Ok(s.data().iter().sum()),
            Signature::Sparse(s) => Ok(s.iter().map(|(_, v)| v).sum()),
            _ => {
                let mut sum = 0.0;
                for d in 0..self.size() {
                    sum += self.get(d)?;
                }
                Ok(sum)
            }
        }
    }

    pub fn norm(&self) -> Result<f64> {
        match self {
            Signature::Dense(s) => Ok(s.data().iter().map(|v| v * v).sum::<f64>().sqrt()),
            Signature::Sparse(s) => Ok(s.iter().map(|(_, v)| v * v).sum::<f64>().sqrt()),
            _ => {
                let mut norm = 0.0;
                for d in 0..self.size() {
                    let v = self.get(d)?;
                    norm += v * v;
                }
                Ok(norm.sqrt())
            }
        }
    }

    /// 点积，稀疏 × 稀疏时只遍历两边的非零分量
    pub fn dot(&self, other: &Signature) -> Result<f64> {
        ensure!(
            self.is_vector() && other.is_vector(),
            "dot product needs vector signatures ({} / {})",
            self.kind_name(),
            other.kind_name()
        );
        ensure!(
            self.size() == other.size(),
            "signature dimensions mismatch ({} / {})",
            self.size(),
            other.size()
        );
        match (self, other) {
            (Signature::Dense(a), Signature::Dense(b)) => {
                Ok(a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum())
            }
            (Signature::Sparse(a), Signature::Sparse(b)) => {
                let mut dot = 0.0;
                let mut it1 = a.iter().peekable();
                let mut it2 = b.iter().peekable();
                while let (Some(&(i1, v1)), Some(&(i2, _))) = (it1.peek(), it2.peek()) {
                    if i1 == i2 {
                        let (_, v2) = it2.next().unwrap();
                        dot += v1 * v2;
                        it1.next();
                    } else if i1 < i2 {
                        it1.next();
                    } else {
                        it2.next();
                    }
                }
                Ok(dot)
            }
            _ => {
                let mut dot = 0.0;
                for d in 0..self.size() {
                    dot += self.get(d)? * other.get(d)?;
                }
                Ok(dot)
            }
        }
    }

    /// L2 归一化；范数为零时保持不变，除非 `force` 为真，
    /// 此时所有分量置为 1/size
    pub fn normalize_l2(&mut self, force: bool) -> Result<()> {
        let norm = self.norm()?;
        if norm != 0.0 {
            self.multiply(1.0 / norm)
        } else if force && self.size() > 0 {
            self.set_all(1.0 / self.size() as f64)
        } else {
            Ok(())
        }
    }

    /// 归一化到指定的分量和
    pub fn normalize_sum_to(&mut self, n: f64, force: bool) -> Result<()> {
        let sum = self.sum()?;
        if sum != 0.0 {
            self.multiply(n / sum)
        } else if force && self.size() > 0 {
            self.set_all(n / self.size() as f64)
        } else {
            Ok(())
        }
    }

    pub fn normalize_sum_to_one(&mut self, force: bool) -> Result<()> {
        self.normalize_sum_to(1.0, force)
    }
}
