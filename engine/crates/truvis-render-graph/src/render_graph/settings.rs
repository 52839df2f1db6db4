use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// RenderGraph 的运行参数，可从 TOML 加载
///
/// ```toml
/// fif_count = 3
/// enable_aliasing = true
/// print_execution_plan = false
/// debug_labels = true
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RgSettings {
    /// frames in flight 数量，`execute` 的 frame_index 必须小于它
    pub fif_count: usize,

    /// 为 false 时，同一帧内的瞬态资源不会共享显存
    pub enable_aliasing: bool,

    /// 每次 compile 之后打印执行计划
    pub print_execution_plan: bool,

    /// 用 debug label 包裹每个 Pass
    pub debug_labels: bool,
}

impl Default for RgSettings {
    fn default() -> Self {
        Self {
            fif_count: 3,
            enable_aliasing: true,
            print_execution_plan: false,
            debug_labels: true,
        }
    }
}

impl RgSettings {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: RgSettings = toml::from_str(content).context("解析 RenderGraph 配置失败")?;
        if settings.fif_count == 0 {
            anyhow::bail!("fif_count 必须大于 0");
        }
        Ok(settings)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| format!("加载配置文件失败: {:?}", path.as_ref()))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path.as_ref(), content).with_context(|| format!("写入配置文件失败: {:?}", path.as_ref()))?;
        Ok(())
    }
}
