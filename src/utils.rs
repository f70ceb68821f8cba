use indicatif::ProgressStyle;

/// 进度条统一样式
pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} {msg}")
        .expect("failed to build progress style")
}
