use anyhow::{Result, ensure};

use crate::signature::Signature;

/// 签名间的距离计算
///
/// 同一个描述符下的稠密 / 稀疏表示必须给出相同的距离值
pub trait SignatureDistance: Send + Sync {
    fn compute(&self, a: &Signature, b: &Signature) -> Result<f64>;
}

fn check_vectors(a: &Signature, b: &Signature) -> Result<usize> {
    ensure!(
        a.is_vector() && b.is_vector(),
        "distance needs vector signatures ({} / {})",
        a.kind_name(),
        b.kind_name()
    );
    ensure!(
        a.size() == b.size(),
        "signature dimensions mismatch ({} / {})",
        a.size(),
        b.size()
    );
    Ok(a.size())
}

/// 欧氏距离
pub struct L2Distance;

impl SignatureDistance for L2Distance {
    fn compute(&self, a: &Signature, b: &Signature) -> Result<f64> {
        let size = check_vectors(a, b)?;
        let mut d = 0.0;
        match (a, b) {
            // 稀疏 × 稀疏：归并遍历两边的非零分量
            (Signature::Sparse(s1), Signature::Sparse(s2)) => {
                let mut it1 = s1.iter().peekable();
                let mut it2 = s2.iter().peekable();
                loop {
                    match (it1.peek().copied(), it2.peek().copied()) {
                        (Some((i1, v1)), Some((i2, v2))) => {
                            if i1 == i2 {
                                let e = v1 - v2;
                                d += e * e;
                                it1.next();
                                it2.next();
                            } else if i1 < i2 {
                                d += v1 * v1;
                                it1.next();
                            } else {
                                d += v2 * v2;
                                it2.next();
                            }
                        }
                        (Some((_, v1)), None) => {
                            d += v1 * v1;
                            it1.next();
                        }
                        (None, Some((_, v2))) => {
                            d += v2 * v2;
                            it2.next();
                        }
                        (None, None) => break,
                    }
                }
            }
            (Signature::Dense(s1), Signature::Dense(s2)) => {
                for (x, y) in s1.data().iter().zip(s2.data()) {
                    let e = x - y;
                    d += e * e;
                }
            }
            _ => {
                for i in 0..size {
                    let e = a.get(i)? - b.get(i)?;
                    d += e * e;
                }
            }
        }
        Ok(d.sqrt())
    }
}

/// 余弦距离，`similarity` 为真时直接返回相似度
///
/// 任意一边是零向量时相似度记为 0
pub struct CosineDistance {
    similarity: bool,
}

impl CosineDistance {
    pub fn new(similarity: bool) -> Self {
        Self { similarity }
    }
}

impl Default for CosineDistance {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SignatureDistance for CosineDistance {
    fn compute(&self, a: &Signature, b: &Signature) -> Result<f64> {
        check_vectors(a, b)?;
        let (na, nb) = (a.norm()?, b.norm()?);
        let dot = if na == 0.0 || nb == 0.0 { 0.0 } else { a.dot(b)? / (na * nb) };
        Ok(if self.similarity { dot } else { 1.0 - dot })
    }
}
