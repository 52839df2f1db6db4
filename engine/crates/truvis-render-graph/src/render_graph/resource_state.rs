//! 资源状态定义
//!
//! 封装 Vulkan 的 pipeline stage、access mask 和 image layout，
//! 提供预定义的常用状态组合，以及从 Pass 声明的用途（`RgResourceUsage`）推导状态的规则。

use ash::vk;

use crate::render_graph::pass::RgPassKind;
use crate::render_graph::resource::RgResourceKind;

/// 图像资源状态
///
/// 描述资源在某个 Pass 中的使用方式，用于自动计算 barrier。
/// buffer 的状态同样可以用该结构表示，此时 `layout` 恒为 `UNDEFINED`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RgImageState {
    /// Pipeline stage
    pub stage: vk::PipelineStageFlags2,
    /// Access mask
    pub access: vk::AccessFlags2,
    /// Image layout
    pub layout: vk::ImageLayout,
}

impl Default for RgImageState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

// new & 常量定义
impl RgImageState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }

    // ============ 预定义状态常量 ============

    /// 未定义状态（初始状态或不关心内容）
    pub const UNDEFINED: Self =
        Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED);

    /// 通用布局
    pub const GENERAL: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::from_raw(vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw()),
        vk::ImageLayout::GENERAL,
    );

    /// 颜色附件输出
    pub const COLOR_ATTACHMENT_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    /// 颜色附件只读（input attachment / 可编程 blend 读取）
    pub const COLOR_ATTACHMENT_READ: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    /// 颜色附件读写（如 blend）
    pub const COLOR_ATTACHMENT_READ_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    const DEPTH_TEST_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
    );

    /// 深度附件写入
    pub const DEPTH_ATTACHMENT_WRITE: Self = Self::new(
        Self::DEPTH_TEST_STAGES,
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );

    /// 深度附件读写
    pub const DEPTH_ATTACHMENT_READ_WRITE: Self = Self::new(
        Self::DEPTH_TEST_STAGES,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );

    /// 只读深度测试（depth pre-pass 之后的 forward pass 等）
    pub const DEPTH_ATTACHMENT_READ_ONLY: Self = Self::new(
        Self::DEPTH_TEST_STAGES,
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    );

    /// 着色器只读采样（片段着色器）
    pub const SHADER_READ_FRAGMENT: Self = Self::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    /// 着色器只读采样（计算着色器）
    pub const SHADER_READ_COMPUTE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    /// 存储图像写入（计算着色器）
    pub const STORAGE_WRITE_COMPUTE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
        vk::ImageLayout::GENERAL,
    );

    /// 存储图像读写（计算着色器）
    pub const STORAGE_READ_WRITE_COMPUTE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_STORAGE_READ.as_raw() | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    );

    /// 传输源
    pub const TRANSFER_SRC: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );

    /// 传输目标
    pub const TRANSFER_DST: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    /// 呈现（swapchain image）
    pub const PRESENT: Self =
        Self::new(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE, vk::ImageLayout::PRESENT_SRC_KHR);

    // ============ 辅助方法 ============

    /// 写操作的 access flags
    const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    );

    /// 检查是否为写操作
    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_ACCESS)
    }

    /// 检查是否为只读操作
    #[inline]
    pub fn is_read_only(&self) -> bool {
        !self.is_write()
    }

    /// 获取用于 barrier src 的 access（去掉读操作）
    #[inline]
    pub fn src_access(&self) -> vk::AccessFlags2 {
        self.access & Self::WRITE_ACCESS
    }

    /// 取出 stage/access 作为 buffer 状态
    #[inline]
    pub fn buffer_state(&self) -> RgBufferState {
        RgBufferState::new(self.stage, self.access)
    }
}

impl From<RgBufferState> for RgImageState {
    fn from(state: RgBufferState) -> Self {
        Self::new(state.stage, state.access, vk::ImageLayout::UNDEFINED)
    }
}

/// 缓冲区资源状态
///
/// 描述缓冲区在某个 Pass 中的使用方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RgBufferState {
    /// Pipeline stage
    pub stage: vk::PipelineStageFlags2,
    /// Access mask
    pub access: vk::AccessFlags2,
}

impl Default for RgBufferState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

// new & 常量定义
impl RgBufferState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    pub const UNDEFINED: Self = Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE);

    pub const VERTEX_BUFFER: Self =
        Self::new(vk::PipelineStageFlags2::VERTEX_INPUT, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);

    pub const INDEX_BUFFER: Self = Self::new(vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ);

    pub const INDIRECT_BUFFER: Self =
        Self::new(vk::PipelineStageFlags2::DRAW_INDIRECT, vk::AccessFlags2::INDIRECT_COMMAND_READ);

    pub const UNIFORM_COMPUTE: Self =
        Self::new(vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::UNIFORM_READ);

    pub const STORAGE_READ_WRITE_COMPUTE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_STORAGE_READ.as_raw() | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
        ),
    );

    pub const TRANSFER_SRC: Self = Self::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ);

    pub const TRANSFER_DST: Self = Self::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);

    /// host 端写入（上传后交给 graph 的 buffer）
    pub const HOST_WRITE: Self = Self::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_WRITE);

    /// 检查是否为写操作
    #[inline]
    pub fn is_write(&self) -> bool {
        RgImageState::from(*self).is_write()
    }
}

/// Pass 声明资源时使用的用途标签
///
/// 由用途、Pass 类型、资源类型以及读写方向共同推导出具体的 stage/access/layout。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RgResourceUsage {
    ColorAttachment,
    DepthAttachment,
    /// 采样 / 只读存储访问
    ShaderRead,
    /// storage image / storage buffer 读写
    ShaderWrite,
    TransferSrc,
    TransferDst,
    /// 交给呈现引擎；写入该用途的 Pass 是终结 Pass
    Present,
    VertexBuffer,
    IndexBuffer,
    IndirectBuffer,
    UniformBuffer,
}

impl RgResourceUsage {
    /// 该用途是否允许读
    pub fn allows_read(self) -> bool {
        !matches!(self, Self::TransferDst | Self::Present)
    }

    /// 该用途是否允许写
    pub fn allows_write(self) -> bool {
        matches!(
            self,
            Self::ColorAttachment | Self::DepthAttachment | Self::ShaderWrite | Self::TransferDst | Self::Present
        )
    }

    /// 该用途是否适用于指定的资源类型
    pub fn supports(self, kind: RgResourceKind) -> bool {
        match self {
            Self::ColorAttachment | Self::DepthAttachment | Self::Present => kind == RgResourceKind::Image,
            Self::VertexBuffer | Self::IndexBuffer | Self::IndirectBuffer | Self::UniformBuffer => {
                kind == RgResourceKind::Buffer
            }
            Self::ShaderRead | Self::ShaderWrite | Self::TransferSrc | Self::TransferDst => true,
        }
    }

    /// 着色器访问所在的 stage，取决于 Pass 类型
    fn shader_stage(pass_kind: &RgPassKind) -> vk::PipelineStageFlags2 {
        match pass_kind {
            RgPassKind::Graphics { .. } => {
                vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER
            }
            RgPassKind::Compute => vk::PipelineStageFlags2::COMPUTE_SHADER,
            RgPassKind::Transfer => vk::PipelineStageFlags2::ALL_COMMANDS,
        }
    }

    /// 推导该次访问的 stage/access/layout
    ///
    /// 同一个 Pass 对同一资源既读又写时，`read` 与 `write` 同时为 true，得到合并后的状态。
    /// buffer 的 layout 恒为 `UNDEFINED`。
    pub fn resolve(self, pass_kind: &RgPassKind, resource_kind: RgResourceKind, read: bool, write: bool) -> RgImageState {
        let is_image = resource_kind == RgResourceKind::Image;
        let layout_or_undefined = |layout: vk::ImageLayout| if is_image { layout } else { vk::ImageLayout::UNDEFINED };

        match self {
            Self::ColorAttachment => match (read, write) {
                (true, true) => RgImageState::COLOR_ATTACHMENT_READ_WRITE,
                (true, false) => RgImageState::COLOR_ATTACHMENT_READ,
                _ => RgImageState::COLOR_ATTACHMENT_WRITE,
            },
            Self::DepthAttachment => match (read, write) {
                (true, true) => RgImageState::DEPTH_ATTACHMENT_READ_WRITE,
                (true, false) => RgImageState::DEPTH_ATTACHMENT_READ_ONLY,
                _ => RgImageState::DEPTH_ATTACHMENT_WRITE,
            },
            Self::ShaderRead => RgImageState::new(
                Self::shader_stage(pass_kind),
                if is_image { vk::AccessFlags2::SHADER_SAMPLED_READ } else { vk::AccessFlags2::SHADER_STORAGE_READ },
                layout_or_undefined(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ),
            Self::ShaderWrite => {
                let mut access = vk::AccessFlags2::NONE;
                if read {
                    access |= vk::AccessFlags2::SHADER_STORAGE_READ;
                }
                if write {
                    access |= vk::AccessFlags2::SHADER_STORAGE_WRITE;
                }
                RgImageState::new(Self::shader_stage(pass_kind), access, layout_or_undefined(vk::ImageLayout::GENERAL))
            }
            Self::TransferSrc => RgImageState {
                layout: layout_or_undefined(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                ..RgImageState::TRANSFER_SRC
            },
            Self::TransferDst => RgImageState {
                layout: layout_or_undefined(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                ..RgImageState::TRANSFER_DST
            },
            Self::Present => RgImageState::PRESENT,
            Self::VertexBuffer => RgBufferState::VERTEX_BUFFER.into(),
            Self::IndexBuffer => RgBufferState::INDEX_BUFFER.into(),
            Self::IndirectBuffer => RgBufferState::INDIRECT_BUFFER.into(),
            Self::UniformBuffer => {
                RgImageState::new(Self::shader_stage(pass_kind), vk::AccessFlags2::UNIFORM_READ, vk::ImageLayout::UNDEFINED)
            }
        }
    }
}
