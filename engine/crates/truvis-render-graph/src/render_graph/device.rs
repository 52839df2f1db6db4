//! graph 与 GPU 设备之间的接口
//!
//! graph 只在瞬态池、持久资源缓存以及执行阶段的 barrier / 调试标签中调用设备。
//! `RgVkDevice` 是基于 ash + vk-mem 的实现，`RgDummyDevice` 用于无 GPU 的测试和离线分析。

use ash::vk;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource::RgPhysicalResource;
use crate::render_graph::resource_handle::RgMemoryHandle;

pub trait RgDevice {
    /// 查询按 `desc` 创建图像所需的显存大小、对齐和可用的 memory type
    fn image_memory_requirements(&self, desc: &RgImageDesc) -> vk::MemoryRequirements;

    fn buffer_memory_requirements(&self, desc: &RgBufferDesc) -> vk::MemoryRequirements;

    /// 分配一块原始显存，不绑定任何资源
    fn allocate_memory(&self, requirements: &vk::MemoryRequirements, debug_name: &str)
    -> anyhow::Result<RgMemoryHandle>;

    fn free_memory(&self, memory: RgMemoryHandle);

    /// 在已有显存块上创建别名图像及其默认视图
    fn create_aliased_image(
        &self,
        memory: RgMemoryHandle,
        desc: &RgImageDesc,
        debug_name: &str,
    ) -> anyhow::Result<(vk::Image, vk::ImageView)>;

    /// 在已有显存块上创建别名缓冲区
    fn create_aliased_buffer(
        &self,
        memory: RgMemoryHandle,
        desc: &RgBufferDesc,
        debug_name: &str,
    ) -> anyhow::Result<vk::Buffer>;

    /// 销毁图像和视图，不释放显存
    fn destroy_image(&self, image: vk::Image, view: vk::ImageView);

    /// 销毁缓冲区，不释放显存
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn destroy_physical(&self, physical: RgPhysicalResource) {
        match physical {
            RgPhysicalResource::Image { image, view } => self.destroy_image(image, view),
            RgPhysicalResource::Buffer { buffer } => self.destroy_buffer(buffer),
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    );

    fn cmd_begin_label(&self, _cmd: vk::CommandBuffer, _name: &str, _color: [f32; 4]) {}

    fn cmd_end_label(&self, _cmd: vk::CommandBuffer) {}
}
