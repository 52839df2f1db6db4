//! 不依赖 GPU 的 `RgDevice` 实现
//!
//! 伪造句柄、按格式估算显存需求，并记录所有调用，用于单元测试和 `rg_plan` 离线分析。

use std::cell::RefCell;
use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;
use slotmap::SlotMap;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::device::RgDevice;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource_handle::RgMemoryHandle;

/// 记录下来的图像 barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgRecordedImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// 记录下来的缓冲区 barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgRecordedBufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RgRecordedCommand {
    Barrier {
        images: Vec<RgRecordedImageBarrier>,
        buffers: Vec<RgRecordedBufferBarrier>,
    },
    BeginLabel(String),
    EndLabel,
}

#[derive(Default)]
struct RgDummyDeviceState {
    next_raw_handle: u64,
    allocations: SlotMap<RgMemoryHandle, vk::DeviceSize>,
    total_allocations: usize,
    images: HashMap<vk::Image, RgMemoryHandle>,
    buffers: HashMap<vk::Buffer, RgMemoryHandle>,
    commands: Vec<RgRecordedCommand>,
}

impl RgDummyDeviceState {
    fn next_raw(&mut self) -> u64 {
        self.next_raw_handle += 1;
        self.next_raw_handle
    }
}

#[derive(Default)]
pub struct RgDummyDevice {
    state: RefCell<RgDummyDeviceState>,
    /// 超出预算的分配会失败，用于模拟显存耗尽
    memory_budget: Option<vk::DeviceSize>,
}

// new & init
impl RgDummyDevice {
    const ALIGNMENT: vk::DeviceSize = 256;
    const COLOR_MEMORY_TYPES: u32 = 0b0011;
    const DEPTH_MEMORY_TYPES: u32 = 0b0010;
    const BUFFER_MEMORY_TYPES: u32 = 0b0111;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_budget(budget: vk::DeviceSize) -> Self {
        Self {
            state: RefCell::default(),
            memory_budget: Some(budget),
        }
    }

    /// 估算的每个 texel 字节数，未知格式按 4 字节处理
    fn texel_size(format: vk::Format) -> vk::DeviceSize {
        match format {
            vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
            vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
            vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            _ => 4,
        }
    }

    fn align(size: vk::DeviceSize) -> vk::DeviceSize {
        size.div_ceil(Self::ALIGNMENT).max(1) * Self::ALIGNMENT
    }
}

// getters
impl RgDummyDevice {
    /// 当前未释放的显存块数量
    pub fn allocation_count(&self) -> usize {
        self.state.borrow().allocations.len()
    }

    /// 累计分配过的显存块数量
    pub fn total_allocations(&self) -> usize {
        self.state.borrow().total_allocations
    }

    pub fn allocated_bytes(&self) -> vk::DeviceSize {
        self.state.borrow().allocations.values().sum()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.borrow().images.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    /// 图像别名到的显存块
    pub fn image_memory(&self, image: vk::Image) -> Option<RgMemoryHandle> {
        self.state.borrow().images.get(&image).copied()
    }

    pub fn buffer_memory(&self, buffer: vk::Buffer) -> Option<RgMemoryHandle> {
        self.state.borrow().buffers.get(&buffer).copied()
    }

    pub fn take_commands(&self) -> Vec<RgRecordedCommand> {
        std::mem::take(&mut self.state.borrow_mut().commands)
    }

    /// 录制过的所有图像 barrier，按录制顺序
    pub fn recorded_image_barriers(&self) -> Vec<RgRecordedImageBarrier> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                RgRecordedCommand::Barrier { images, .. } => Some(images.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn recorded_buffer_barriers(&self) -> Vec<RgRecordedBufferBarrier> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                RgRecordedCommand::Barrier { buffers, .. } => Some(buffers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn recorded_labels(&self) -> Vec<String> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                RgRecordedCommand::BeginLabel(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl RgDevice for RgDummyDevice {
    fn image_memory_requirements(&self, desc: &RgImageDesc) -> vk::MemoryRequirements {
        let texel = Self::texel_size(desc.format) * desc.samples.as_raw().max(1) as vk::DeviceSize;
        let size: vk::DeviceSize = (0..desc.mip_levels)
            .map(|mip| {
                let w = (desc.width >> mip).max(1) as vk::DeviceSize;
                let h = (desc.height >> mip).max(1) as vk::DeviceSize;
                let d = (desc.depth >> mip).max(1) as vk::DeviceSize;
                w * h * d * texel
            })
            .sum::<vk::DeviceSize>()
            * desc.array_layers as vk::DeviceSize;

        let memory_type_bits = if RgImageDesc::infer_aspect(desc.format).contains(vk::ImageAspectFlags::DEPTH) {
            Self::DEPTH_MEMORY_TYPES
        } else {
            Self::COLOR_MEMORY_TYPES
        };

        vk::MemoryRequirements {
            size: Self::align(size),
            alignment: Self::ALIGNMENT,
            memory_type_bits,
        }
    }

    fn buffer_memory_requirements(&self, desc: &RgBufferDesc) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: Self::align(desc.size),
            alignment: Self::ALIGNMENT,
            memory_type_bits: Self::BUFFER_MEMORY_TYPES,
        }
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        debug_name: &str,
    ) -> anyhow::Result<RgMemoryHandle> {
        let mut state = self.state.borrow_mut();
        let allocated: vk::DeviceSize = state.allocations.values().sum();
        if let Some(budget) = self.memory_budget {
            if allocated + requirements.size > budget {
                anyhow::bail!(
                    "out of device memory while allocating {} bytes for \"{}\" ({} of {} bytes in use)",
                    requirements.size,
                    debug_name,
                    allocated,
                    budget
                );
            }
        }

        state.total_allocations += 1;
        Ok(state.allocations.insert(requirements.size))
    }

    fn free_memory(&self, memory: RgMemoryHandle) {
        self.state.borrow_mut().allocations.remove(memory);
    }

    fn create_aliased_image(
        &self,
        memory: RgMemoryHandle,
        _desc: &RgImageDesc,
        debug_name: &str,
    ) -> anyhow::Result<(vk::Image, vk::ImageView)> {
        let mut state = self.state.borrow_mut();
        if !state.allocations.contains_key(memory) {
            anyhow::bail!("image \"{}\" aliased onto freed memory", debug_name);
        }
        let image = vk::Image::from_raw(state.next_raw());
        let view = vk::ImageView::from_raw(state.next_raw());
        state.images.insert(image, memory);
        Ok((image, view))
    }

    fn create_aliased_buffer(
        &self,
        memory: RgMemoryHandle,
        _desc: &RgBufferDesc,
        debug_name: &str,
    ) -> anyhow::Result<vk::Buffer> {
        let mut state = self.state.borrow_mut();
        if !state.allocations.contains_key(memory) {
            anyhow::bail!("buffer \"{}\" aliased onto freed memory", debug_name);
        }
        let buffer = vk::Buffer::from_raw(state.next_raw());
        state.buffers.insert(buffer, memory);
        Ok(buffer)
    }

    fn destroy_image(&self, image: vk::Image, _view: vk::ImageView) {
        self.state.borrow_mut().images.remove(&image);
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.borrow_mut().buffers.remove(&buffer);
    }

    fn cmd_pipeline_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let images = image_barriers
            .iter()
            .map(|b| RgRecordedImageBarrier {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
            })
            .collect();
        let buffers = buffer_barriers
            .iter()
            .map(|b| RgRecordedBufferBarrier {
                buffer: b.buffer,
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
            })
            .collect();
        self.state.borrow_mut().commands.push(RgRecordedCommand::Barrier { images, buffers });
    }

    fn cmd_begin_label(&self, _cmd: vk::CommandBuffer, name: &str, _color: [f32; 4]) {
        self.state.borrow_mut().commands.push(RgRecordedCommand::BeginLabel(name.to_string()));
    }

    fn cmd_end_label(&self, _cmd: vk::CommandBuffer) {
        self.state.borrow_mut().commands.push(RgRecordedCommand::EndLabel);
    }
}
