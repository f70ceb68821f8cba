//! 特征提取的外部协作接口
//!
//! 具体的描述符算法不在本 crate 内实现，索引管线只依赖这里的 trait

use std::path::Path;

use anyhow::Result;

use crate::catalog::{Catalog, Entry};
use crate::signature::Signature;

/// 已解码的图片，由 [`ImageLoader`] 产出
pub trait DecodedImage: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;
}

/// 图片读取器，文件不可读时返回 IO 错误
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn DecodedImage>>;
}

/// 支持区域，局部描述符的提取范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 从一张图片中提取支持区域
///
/// 多个局部描述符可以共享同一个工厂，同一个任务内的提取结果会被缓存
pub trait RegionFactory: Send + Sync {
    fn extract_regions(&self, image: &dyn DecodedImage) -> Result<Vec<Region>>;
}

/// 全局描述符：每个条目产生一个签名
pub trait GlobalDescriptor: Send + Sync {
    /// 每次索引运行前调用一次
    fn init_for_catalog(&self, _catalog: &Catalog) -> Result<()> {
        Ok(())
    }

    /// 是否需要加载源图片
    fn needs_source_image(&self) -> bool {
        true
    }

    fn pre_process(&self, _image: Option<&dyn DecodedImage>) -> Result<()> {
        Ok(())
    }

    fn extract(&self, image: Option<&dyn DecodedImage>) -> Result<Signature>;

    fn post_process(&self, _image: Option<&dyn DecodedImage>) -> Result<()> {
        Ok(())
    }
}

/// 局部描述符：每个支持区域产生一个签名，整体存成一个签名包
pub trait LocalDescriptor: Send + Sync {
    fn init_for_catalog(&self, _catalog: &Catalog) -> Result<()> {
        Ok(())
    }

    fn needs_source_image(&self) -> bool {
        true
    }

    fn pre_process(&self, _image: Option<&dyn DecodedImage>) -> Result<()> {
        Ok(())
    }

    fn extract(&self, image: Option<&dyn DecodedImage>, region: &Region) -> Result<Signature>;

    fn post_process(&self, _image: Option<&dyn DecodedImage>) -> Result<()> {
        Ok(())
    }
}

/// 条目级描述符：直接基于条目（标签、已有签名等）产生一个签名
pub trait EntryDescriptor: Send + Sync {
    fn init_for_catalog(&self, _catalog: &Catalog) -> Result<()> {
        Ok(())
    }

    fn needs_source_image(&self) -> bool {
        true
    }

    fn pre_process(&self, _entry: &Entry) -> Result<()> {
        Ok(())
    }

    fn extract(&self, entry: &Entry) -> Result<Signature>;

    fn post_process(&self, _entry: &Entry) -> Result<()> {
        Ok(())
    }
}
