use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let settings = TruvisPath::resources_path("rg_settings.toml"); // resources/rg_settings.toml
/// ```
pub struct TruvisPath {}
// 核心路径
impl TruvisPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // 本 crate 位于工作区根目录的下一级
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
    }
}
// 根目录下
impl TruvisPath {
    /// 获取 `resources/` 目录下的文件路径
    pub fn resources_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("resources").join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_path() {
        let path = TruvisPath::resources_path("rg_settings.toml");
        assert!(path.starts_with(TruvisPath::workspace_path()));
        assert!(path.ends_with("resources/rg_settings.toml"));
        assert!(TruvisPath::workspace_path().join("truvis-crate-tools").join("Cargo.toml").exists());
    }
}
