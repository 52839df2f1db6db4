//! Pass 定义和构建器
//!
//! Pass 可以用闭包声明（`RenderGraph::add_pass` 等），也可以实现 `RgPass` trait。
//! 两种方式最终都通过 `RgPassBuilder` 记录资源访问和执行回调。

use ash::vk;
use slotmap::SecondaryMap;

use crate::render_graph::barrier::RgPassBarriers;
use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::device::RgDevice;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource::RgPhysicalResource;
use crate::render_graph::resource_handle::RgResourceHandle;
use crate::render_graph::resource_registry::RgResourceRegistry;
use crate::render_graph::resource_state::RgResourceUsage;

/// Pass 类型
///
/// 类型集合是封闭的，执行阶段按标签分发，而不是通过 trait object。
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RgPassKind {
    /// 光栅化 Pass；`label_color` 用于调试标签
    Graphics { label_color: [f32; 4] },
    Compute,
    Transfer,
}

impl RgPassKind {
    const GRAPHICS_LABEL_COLOR: [f32; 4] = [0.2, 0.6, 1.0, 1.0];
    const COMPUTE_LABEL_COLOR: [f32; 4] = [1.0, 0.5, 0.1, 1.0];
    const TRANSFER_LABEL_COLOR: [f32; 4] = [0.5, 0.5, 0.5, 1.0];

    #[inline]
    pub fn graphics() -> Self {
        Self::Graphics {
            label_color: Self::GRAPHICS_LABEL_COLOR,
        }
    }

    #[inline]
    pub fn label_color(&self) -> [f32; 4] {
        match self {
            Self::Graphics { label_color } => *label_color,
            Self::Compute => Self::COMPUTE_LABEL_COLOR,
            Self::Transfer => Self::TRANSFER_LABEL_COLOR,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Graphics { .. } => "Graphics",
            Self::Compute => "Compute",
            Self::Transfer => "Transfer",
        }
    }
}

/// Pass 对某个资源的一次访问声明
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgResourceAccess {
    pub resource: RgResourceHandle,
    pub usage: RgResourceUsage,
    pub is_write: bool,
}

/// Pass 的执行回调
pub type RgPassExecuteFn<'a> = Box<dyn FnMut(&RgPassContext<'_>) + 'a>;

/// Pass 执行时的上下文
///
/// 提供命令缓冲区以及本帧解析出的物理资源。
pub struct RgPassContext<'c> {
    pub cmd: vk::CommandBuffer,
    pub frame_index: usize,
    pub pass_name: &'c str,
    pub pass_kind: &'c RgPassKind,
    /// 用于录制 draw / dispatch / copy 之外的辅助命令
    pub device: &'c dyn RgDevice,

    pub(crate) resources: &'c RgResourceRegistry,
    pub(crate) physical: &'c SecondaryMap<RgResourceHandle, RgPhysicalResource>,
}

impl RgPassContext<'_> {
    #[inline]
    pub fn physical(&self, handle: RgResourceHandle) -> Option<RgPhysicalResource> {
        self.physical.get(handle).copied()
    }

    #[inline]
    pub fn physical_by_name(&self, name: &str) -> Option<RgPhysicalResource> {
        self.resources.handle(name).and_then(|handle| self.physical(handle))
    }

    #[inline]
    pub fn image(&self, name: &str) -> Option<vk::Image> {
        self.physical_by_name(name).and_then(|p| p.image())
    }

    #[inline]
    pub fn image_view(&self, name: &str) -> Option<vk::ImageView> {
        self.physical_by_name(name).and_then(|p| p.image_view())
    }

    #[inline]
    pub fn buffer(&self, name: &str) -> Option<vk::Buffer> {
        self.physical_by_name(name).and_then(|p| p.buffer())
    }
}

/// Pass 构建器
///
/// 在 setup 回调中使用，声明 Pass 的资源访问和执行逻辑。
/// 引用未注册的资源、或用途与资源类型/读写方向不匹配时，记录错误并忽略该访问。
pub struct RgPassBuilder<'r, 'a> {
    pub(crate) name: String,
    pub(crate) kind: RgPassKind,
    pub(crate) accesses: Vec<RgResourceAccess>,
    pub(crate) executor: Option<RgPassExecuteFn<'a>>,

    /// 资源注册表引用（用于在 setup 中创建资源）
    pub(crate) resources: &'r mut RgResourceRegistry,
}

impl<'r, 'a> RgPassBuilder<'r, 'a> {
    pub(crate) fn new(name: String, kind: RgPassKind, resources: &'r mut RgResourceRegistry) -> Self {
        Self {
            name,
            kind,
            accesses: Vec::new(),
            executor: None,
            resources,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &RgPassKind {
        &self.kind
    }

    /// 声明读取资源；返回资源句柄，失败时为 null 句柄
    pub fn read(&mut self, name: &str, usage: RgResourceUsage) -> RgResourceHandle {
        self.access(name, usage, false)
    }

    /// 声明写入资源
    pub fn write(&mut self, name: &str, usage: RgResourceUsage) -> RgResourceHandle {
        self.access(name, usage, true)
    }

    /// 声明读写资源（累积、blend 等）
    pub fn read_write(&mut self, name: &str, usage: RgResourceUsage) -> RgResourceHandle {
        let handle = self.access(name, usage, false);
        if handle == RgResourceHandle::default() {
            return handle;
        }
        self.access(name, usage, true)
    }

    /// 设置执行回调
    pub fn execute(&mut self, callback: impl FnMut(&RgPassContext<'_>) + 'a) {
        self.executor = Some(Box::new(callback));
    }

    /// 在 setup 中创建 graph 内部图像
    pub fn create_image(&mut self, name: impl Into<String>, desc: RgImageDesc, persistent: bool) -> RgResourceHandle {
        self.resources.create_image(name, desc, persistent)
    }

    /// 在 setup 中创建 graph 内部缓冲区
    pub fn create_buffer(&mut self, name: impl Into<String>, desc: RgBufferDesc, persistent: bool) -> RgResourceHandle {
        self.resources.create_buffer(name, desc, persistent)
    }

    fn access(&mut self, name: &str, usage: RgResourceUsage, is_write: bool) -> RgResourceHandle {
        let direction = if is_write { "write" } else { "read" };

        let Some(handle) = self.resources.handle(name) else {
            log::error!(
                "RenderGraph: pass \"{}\" tries to {} unknown resource \"{}\", ignored",
                self.name,
                direction,
                name
            );
            return RgResourceHandle::default();
        };
        let Some(resource) = self.resources.get(handle) else {
            return RgResourceHandle::default();
        };

        let direction_ok = if is_write { usage.allows_write() } else { usage.allows_read() };
        if !direction_ok || !usage.supports(resource.kind()) {
            log::error!(
                "RenderGraph: pass \"{}\" cannot {} {:?} \"{}\" as {:?}, ignored",
                self.name,
                direction,
                resource.kind(),
                name,
                usage
            );
            return RgResourceHandle::default();
        }

        let access = RgResourceAccess {
            resource: handle,
            usage,
            is_write,
        };
        if !self.accesses.contains(&access) {
            self.accesses.push(access);
        }
        handle
    }
}

/// Pass 节点
pub struct RgPassNode<'a> {
    pub name: String,
    pub kind: RgPassKind,
    /// 按声明顺序排列的资源访问
    pub accesses: Vec<RgResourceAccess>,

    pub(crate) reachable: bool,
    /// 前驱 Pass（声明顺序索引），升序且去重
    pub(crate) dependencies: Vec<usize>,

    pub(crate) pre_barriers: RgPassBarriers,
    pub(crate) post_barriers: RgPassBarriers,

    pub(crate) executor: Option<RgPassExecuteFn<'a>>,
}

// new & init
impl<'a> RgPassNode<'a> {
    pub(crate) fn from_builder(builder: RgPassBuilder<'_, 'a>) -> Self {
        Self {
            name: builder.name,
            kind: builder.kind,
            accesses: builder.accesses,
            reachable: false,
            dependencies: Vec::new(),
            pre_barriers: RgPassBarriers::default(),
            post_barriers: RgPassBarriers::default(),
            executor: builder.executor,
        }
    }
}

// getters
impl RgPassNode<'_> {
    #[inline]
    pub fn reachable(&self) -> bool {
        self.reachable
    }

    #[inline]
    pub fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    #[inline]
    pub fn pre_barriers(&self) -> &RgPassBarriers {
        &self.pre_barriers
    }

    #[inline]
    pub fn post_barriers(&self) -> &RgPassBarriers {
        &self.post_barriers
    }

    #[inline]
    pub fn touches(&self, handle: RgResourceHandle) -> bool {
        self.accesses.iter().any(|a| a.resource == handle)
    }

    /// 本 Pass 访问的资源，去重
    pub fn touched_resources(&self) -> impl Iterator<Item = RgResourceHandle> + '_ {
        self.accesses
            .iter()
            .enumerate()
            .filter(|(i, a)| !self.accesses[..*i].iter().any(|prev| prev.resource == a.resource))
            .map(|(_, a)| a.resource)
    }

    /// 终结 Pass：以 Present 用途写入资源，或写入被标记为输出的资源
    pub fn is_terminal(&self, resources: &RgResourceRegistry) -> bool {
        self.accesses.iter().any(|a| {
            a.is_write
                && (a.usage == RgResourceUsage::Present || resources.get(a.resource).is_some_and(|r| r.is_output()))
        })
    }
}

/// RgPass trait
///
/// 除闭包外的另一种 Pass 定义方式，适合持有较多状态（pipeline、descriptor 等）的 Pass。
///
/// # 示例
///
/// ```ignore
/// struct BlurPass {
///     pipeline: vk::Pipeline,
/// }
///
/// impl RgPass for BlurPass {
///     fn setup(&mut self, builder: &mut RgPassBuilder<'_, '_>) {
///         builder.read("lighting", RgResourceUsage::ShaderRead);
///         builder.write("blurred", RgResourceUsage::ShaderWrite);
///     }
///
///     fn execute(&mut self, ctx: &RgPassContext<'_>) {
///         let input = ctx.image_view("lighting");
///         // 绑定 pipeline, dispatch...
///     }
/// }
/// ```
///
/// Pass 不需要 Send + Sync，graph 只在录制命令的线程上使用。
pub trait RgPass {
    /// 声明 Pass 的资源访问
    fn setup(&mut self, builder: &mut RgPassBuilder<'_, '_>);

    /// 录制 Pass 的命令，命令缓冲区已经处于录制状态
    fn execute(&mut self, ctx: &RgPassContext<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::Key;

    #[test]
    fn test_unknown_resource_is_noop() {
        let mut registry = RgResourceRegistry::new();
        registry.create_image("albedo", RgImageDesc::default(), false);

        let mut builder = RgPassBuilder::new("debug-overlay".to_string(), RgPassKind::graphics(), &mut registry);
        let missing = builder.read("does-not-exist", RgResourceUsage::ShaderRead);
        let albedo = builder.write("albedo", RgResourceUsage::ColorAttachment);

        assert!(missing.is_null());
        assert!(!albedo.is_null());
        assert_eq!(builder.accesses.len(), 1);
        assert!(builder.accesses[0].is_write);
    }

    #[test]
    fn test_invalid_usage_rejected() {
        let mut registry = RgResourceRegistry::new();
        registry.create_buffer("indirect", RgBufferDesc::new(64, vk::BufferUsageFlags::INDIRECT_BUFFER), false);
        registry.create_image("color", RgImageDesc::default(), false);

        let mut builder = RgPassBuilder::new("cull".to_string(), RgPassKind::Compute, &mut registry);
        assert!(builder.write("indirect", RgResourceUsage::IndirectBuffer).is_null());
        assert!(builder.read("color", RgResourceUsage::VertexBuffer).is_null());
        assert!(builder.write("color", RgResourceUsage::ShaderRead).is_null());
        assert!(!builder.write("indirect", RgResourceUsage::ShaderWrite).is_null());
        assert_eq!(builder.accesses.len(), 1);
    }

    #[test]
    fn test_read_write_records_both_directions() {
        let mut registry = RgResourceRegistry::new();
        registry.create_image("accum", RgImageDesc::default(), true);

        let mut builder = RgPassBuilder::new("accumulate".to_string(), RgPassKind::Compute, &mut registry);
        builder.read_write("accum", RgResourceUsage::ShaderWrite);
        builder.read_write("accum", RgResourceUsage::ShaderWrite);

        assert_eq!(builder.accesses.len(), 2);
        let node = RgPassNode::from_builder(builder);
        assert_eq!(node.touched_resources().count(), 1);
    }
}
