//! 逻辑资源
//!
//! 一个逻辑资源代表 graph 生命周期内的一个具名 image 或 buffer。
//! 物理句柄在导入时给定（外部资源），或在执行阶段由瞬态池 / 持久资源缓存解析。

use ash::vk;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource_state::RgImageState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RgResourceKind {
    Image,
    Buffer,
}

/// 与资源类型对应的描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RgResourceDesc {
    Image(RgImageDesc),
    Buffer(RgBufferDesc),
}

impl RgResourceDesc {
    #[inline]
    pub fn kind(&self) -> RgResourceKind {
        match self {
            Self::Image(_) => RgResourceKind::Image,
            Self::Buffer(_) => RgResourceKind::Buffer,
        }
    }
}

/// 物理资源
///
/// 用带标签的枚举区分 image 和 buffer，读取错误的变体只会得到 `None`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RgPhysicalResource {
    Image { image: vk::Image, view: vk::ImageView },
    Buffer { buffer: vk::Buffer },
}

impl RgPhysicalResource {
    #[inline]
    pub fn kind(&self) -> RgResourceKind {
        match self {
            Self::Image { .. } => RgResourceKind::Image,
            Self::Buffer { .. } => RgResourceKind::Buffer,
        }
    }

    #[inline]
    pub fn image(&self) -> Option<vk::Image> {
        match self {
            Self::Image { image, .. } => Some(*image),
            Self::Buffer { .. } => None,
        }
    }

    #[inline]
    pub fn image_view(&self) -> Option<vk::ImageView> {
        match self {
            Self::Image { view, .. } => Some(*view),
            Self::Buffer { .. } => None,
        }
    }

    #[inline]
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self {
            Self::Buffer { buffer } => Some(*buffer),
            Self::Image { .. } => None,
        }
    }
}

/// 外部资源的进出约束
///
/// `initial` 是 graph 拿到资源时保证的状态，`final_state` 是交还资源时必须满足的状态。
/// buffer 的 layout 字段恒为 `UNDEFINED`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgExternalConstraints {
    pub initial: RgImageState,
    pub final_state: RgImageState,
}

impl RgExternalConstraints {
    #[inline]
    pub fn new(initial: RgImageState, final_state: RgImageState) -> Self {
        Self { initial, final_state }
    }
}

/// 资源来源
#[derive(Clone, Debug)]
pub enum RgResourceSource {
    /// 由外部拥有（例如 swapchain image），graph 只负责同步
    Imported {
        physical: RgPhysicalResource,
        constraints: RgExternalConstraints,
    },
    /// 由 graph 管理；`persistent` 为 true 时跨帧保留物理资源
    Internal { persistent: bool },
}

/// 逻辑资源条目
#[derive(Clone, Debug)]
pub struct RgLogicalResource {
    pub name: String,
    pub desc: RgResourceDesc,
    pub source: RgResourceSource,

    /// 显式标记的 graph 输出，写入它的 Pass 是终结 Pass
    pub(crate) is_output: bool,

    /// 在编译后执行顺序中的首次 / 末次使用位置，只统计可达 Pass
    pub(crate) first_use: Option<usize>,
    pub(crate) last_use: Option<usize>,
}

// new & init
impl RgLogicalResource {
    pub fn imported(
        name: impl Into<String>,
        desc: RgResourceDesc,
        physical: RgPhysicalResource,
        constraints: RgExternalConstraints,
    ) -> Self {
        // 交还时要求 PRESENT_SRC 的 image 必然是 graph 的输出
        let is_output = constraints.final_state.layout == vk::ImageLayout::PRESENT_SRC_KHR;
        Self {
            name: name.into(),
            desc,
            source: RgResourceSource::Imported { physical, constraints },
            is_output,
            first_use: None,
            last_use: None,
        }
    }

    pub fn internal(name: impl Into<String>, desc: RgResourceDesc, persistent: bool) -> Self {
        Self {
            name: name.into(),
            desc,
            source: RgResourceSource::Internal { persistent },
            is_output: false,
            first_use: None,
            last_use: None,
        }
    }
}

// getters
impl RgLogicalResource {
    #[inline]
    pub fn kind(&self) -> RgResourceKind {
        self.desc.kind()
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.source, RgResourceSource::Imported { .. })
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        matches!(self.source, RgResourceSource::Internal { persistent: true })
    }

    /// graph 内部管理且每帧重新分配的资源
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self.source, RgResourceSource::Internal { persistent: false })
    }

    #[inline]
    pub fn is_output(&self) -> bool {
        self.is_output
    }

    #[inline]
    pub fn constraints(&self) -> Option<&RgExternalConstraints> {
        match &self.source {
            RgResourceSource::Imported { constraints, .. } => Some(constraints),
            RgResourceSource::Internal { .. } => None,
        }
    }

    #[inline]
    pub fn imported_physical(&self) -> Option<RgPhysicalResource> {
        match &self.source {
            RgResourceSource::Imported { physical, .. } => Some(*physical),
            RgResourceSource::Internal { .. } => None,
        }
    }

    #[inline]
    pub fn image_desc(&self) -> Option<&RgImageDesc> {
        match &self.desc {
            RgResourceDesc::Image(desc) => Some(desc),
            RgResourceDesc::Buffer(_) => None,
        }
    }

    #[inline]
    pub fn buffer_desc(&self) -> Option<&RgBufferDesc> {
        match &self.desc {
            RgResourceDesc::Buffer(desc) => Some(desc),
            RgResourceDesc::Image(_) => None,
        }
    }

    #[inline]
    pub fn first_use(&self) -> Option<usize> {
        self.first_use
    }

    #[inline]
    pub fn last_use(&self) -> Option<usize> {
        self.last_use
    }

    /// `[first_use, last_use]`；没有可达 Pass 使用时为 `None`
    #[inline]
    pub fn lifetime(&self) -> Option<(usize, usize)> {
        self.first_use.zip(self.last_use)
    }

    /// barrier 使用的 subresource range；buffer 返回 `None`
    pub fn subresource_range(&self) -> Option<vk::ImageSubresourceRange> {
        self.image_desc().map(|desc| desc.full_subresource_range())
    }
}
