//! RenderGraph - 声明式渲染图调度器
//!
//! 每帧的 GPU 工作以具名 Pass 声明，每个 Pass 说明自己读写哪些逻辑资源。
//! graph 据此计算：
//!
//! - 裁剪后、满足依赖的执行顺序（只保留对输出有贡献的 Pass）
//! - Pass 之间最少的同步 barrier，外部资源按进出约束交接
//! - 瞬态资源的显存别名：生命周期不重叠的资源共享同一块显存，只在同一 frame-in-flight 内复用
//!
//! # 使用示例
//!
//! ```ignore
//! use truvis_render_graph::render_graph::*;
//!
//! let mut graph = RenderGraph::new(device, RgSettings::default());
//!
//! graph.import_image("swapchain", image, view, desc, RgImageState::PRESENT, RgImageState::PRESENT);
//! graph.create_image("hdr", RgImageDesc::new_2d(w, h, vk::Format::R16G16B16A16_SFLOAT, usage), false);
//!
//! graph.add_pass("Lighting", |builder| {
//!     builder.write("hdr", RgResourceUsage::ColorAttachment);
//!     builder.execute(|ctx| { /* draw */ });
//! });
//! graph.add_pass("Tonemap", |builder| {
//!     builder.read("hdr", RgResourceUsage::ShaderRead);
//!     builder.write("swapchain", RgResourceUsage::ColorAttachment);
//!     builder.execute(|ctx| { /* fullscreen */ });
//! });
//!
//! graph.compile();
//! // 每帧，等待该帧的 fence 之后
//! graph.execute(cmd, frame_index);
//! ```
//!
//! # 模块结构
//!
//! - `resource_registry`: 逻辑资源注册表
//! - `pass`: Pass 声明、builder 和执行上下文
//! - `graph`: 依赖图、可达性裁剪、生命周期
//! - `scheduler`: 带局部性启发式的列表调度
//! - `barrier`: barrier 生成与合并
//! - `transient_pool`: 按帧索引复用的瞬态显存池
//! - `executor`: `RenderGraph` 本体
//! - `device` / `vk_device` / `dummy_device`: 设备接口及其实现

mod barrier;
mod buffer_resource;
mod device;
mod dummy_device;
mod executor;
mod graph;
mod image_resource;
mod pass;
mod resource;
mod resource_handle;
mod resource_registry;
mod resource_state;
mod scheduler;
mod settings;
mod transient_pool;
mod vk_device;

// Re-exports
pub use barrier::{
    RgBarrierGenerator, RgBufferBarrierDesc, RgImageBarrierDesc, RgPassBarriers, RgResourceUsageInfo,
    RgResourceUsageTable,
};
pub use buffer_resource::RgBufferDesc;
pub use device::RgDevice;
pub use dummy_device::{RgDummyDevice, RgRecordedBufferBarrier, RgRecordedCommand, RgRecordedImageBarrier};
pub use executor::RenderGraph;
pub use graph::{DependencyAnalyzer, DependencyEdge, DependencyGraph, RgDependencyKind};
pub use image_resource::RgImageDesc;
pub use pass::{
    RgPass, RgPassBuilder, RgPassContext, RgPassExecuteFn, RgPassKind, RgPassNode, RgResourceAccess,
};
pub use resource::{
    RgExternalConstraints, RgLogicalResource, RgPhysicalResource, RgResourceDesc, RgResourceKind, RgResourceSource,
};
pub use resource_handle::{RgMemoryHandle, RgPassHandle, RgResourceHandle};
pub use resource_registry::RgResourceRegistry;
pub use resource_state::{RgBufferState, RgImageState, RgResourceUsage};
pub use scheduler::RgScheduler;
pub use settings::RgSettings;
pub use transient_pool::{RgAllocationBlock, RgTransientPool, RgTransientResource};
pub use vk_device::RgVkDevice;
