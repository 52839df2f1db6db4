//! 瞬态资源池
//!
//! 为非持久的 graph 内部资源分配显存，并让生命周期不重叠的资源别名到同一块显存上。
//!
//! 每个显存块都带有分配时的帧索引，只在同一帧索引内复用：帧 N 的显存在录制帧 N+1 时可能仍被 GPU 读取。
//! `begin_frame(frame_index)` 只销毁该帧的 image view / buffer 并把显存块标记为空闲，
//! 显存本身只在 `destroy()` 时释放。
//!
//! 复用策略是贪心的 best-fit，不做全局最优的装箱。
//!
//! 录制顺序上不重叠并不意味着 GPU 执行不重叠：复用块时返回块上的前一个占用者，
//! 新资源的第一个 barrier 必须等待它最后的访问。

use std::rc::Rc;

use ash::vk;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::device::RgDevice;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource::RgPhysicalResource;
use crate::render_graph::resource_handle::{RgMemoryHandle, RgResourceHandle};

/// 池中的一块原始显存
#[derive(Clone, Debug)]
pub struct RgAllocationBlock {
    pub memory: RgMemoryHandle,
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    /// 分配时的 memory type 要求
    pub memory_type_bits: u32,
    /// 当前占用者的 `[first_use, last_use]`
    pub first_use: usize,
    pub last_use: usize,
    pub frame_index: usize,
    pub in_use: bool,
    /// 本帧内最近一次别名到该块上的资源
    pub occupant: Option<RgResourceHandle>,
}

impl RgAllocationBlock {
    /// 能否容纳满足 `requirements` 的资源
    ///
    /// 块实际使用的 memory type 必然在分配时的 bits 中，因此要求这些 bits 全部被新资源接受。
    fn fits(&self, requirements: &vk::MemoryRequirements) -> bool {
        self.size >= requirements.size
            && self.alignment % requirements.alignment.max(1) == 0
            && self.memory_type_bits & requirements.memory_type_bits == self.memory_type_bits
    }
}

/// 池分配的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgTransientResource {
    pub physical: RgPhysicalResource,
    /// 本帧内同一显存块上的前一个占用者
    pub previous_occupant: Option<RgResourceHandle>,
}

/// 别名在池中显存上的资源
struct RgAliasedResource {
    physical: RgPhysicalResource,
    frame_index: usize,
}

pub struct RgTransientPool {
    device: Rc<dyn RgDevice>,
    blocks: Vec<RgAllocationBlock>,
    resources: Vec<RgAliasedResource>,
    /// 为 false 时同一帧内不复用显存块
    aliasing: bool,
}

// new & init
impl RgTransientPool {
    pub fn new(device: Rc<dyn RgDevice>, aliasing: bool) -> Self {
        Self {
            device,
            blocks: Vec::new(),
            resources: Vec::new(),
            aliasing,
        }
    }

    #[inline]
    pub fn set_aliasing(&mut self, aliasing: bool) {
        self.aliasing = aliasing;
    }
}

// create
impl RgTransientPool {
    /// 为 `[first_use, last_use]` 期间使用的图像分配别名资源
    ///
    /// 显存耗尽或创建失败时记录错误并返回 `None`，调用方应在本帧跳过依赖它的 Pass。
    pub fn create_image(
        &mut self,
        handle: RgResourceHandle,
        desc: &RgImageDesc,
        debug_name: &str,
        first_use: usize,
        last_use: usize,
        frame_index: usize,
    ) -> Option<RgTransientResource> {
        let requirements = self.device.image_memory_requirements(desc);
        let block_idx = self.acquire_block(&requirements, debug_name, first_use, last_use, frame_index)?;

        match self.device.create_aliased_image(self.blocks[block_idx].memory, desc, debug_name) {
            Ok((image, view)) => {
                let physical = RgPhysicalResource::Image { image, view };
                Some(self.occupy(block_idx, handle, physical, frame_index))
            }
            Err(err) => {
                log::error!("RenderGraph: failed to create transient image \"{}\": {:#}", debug_name, err);
                self.blocks[block_idx].in_use = false;
                None
            }
        }
    }

    pub fn create_buffer(
        &mut self,
        handle: RgResourceHandle,
        desc: &RgBufferDesc,
        debug_name: &str,
        first_use: usize,
        last_use: usize,
        frame_index: usize,
    ) -> Option<RgTransientResource> {
        let requirements = self.device.buffer_memory_requirements(desc);
        let block_idx = self.acquire_block(&requirements, debug_name, first_use, last_use, frame_index)?;

        match self.device.create_aliased_buffer(self.blocks[block_idx].memory, desc, debug_name) {
            Ok(buffer) => {
                let physical = RgPhysicalResource::Buffer { buffer };
                Some(self.occupy(block_idx, handle, physical, frame_index))
            }
            Err(err) => {
                log::error!("RenderGraph: failed to create transient buffer \"{}\": {:#}", debug_name, err);
                self.blocks[block_idx].in_use = false;
                None
            }
        }
    }

    /// 资源创建成功后登记为块的新占用者
    fn occupy(
        &mut self,
        block_idx: usize,
        handle: RgResourceHandle,
        physical: RgPhysicalResource,
        frame_index: usize,
    ) -> RgTransientResource {
        self.resources.push(RgAliasedResource { physical, frame_index });
        let previous_occupant = self.blocks[block_idx].occupant.replace(handle);
        if let Some(previous) = previous_occupant {
            log::trace!("RenderGraph: {:?} aliases the memory of {:?} in frame {}", handle, previous, frame_index);
        }
        RgTransientResource {
            physical,
            previous_occupant,
        }
    }

    /// 找一个可复用的显存块，没有则新分配
    ///
    /// 调用方按 `first_use` 升序发起请求。
    fn acquire_block(
        &mut self,
        requirements: &vk::MemoryRequirements,
        debug_name: &str,
        first_use: usize,
        last_use: usize,
        frame_index: usize,
    ) -> Option<usize> {
        if self.aliasing {
            // 同一帧内，占用者已经结束使用的块可以让给新资源
            for block in self.blocks.iter_mut().filter(|b| b.in_use && b.frame_index == frame_index) {
                if block.last_use < first_use {
                    block.in_use = false;
                }
            }
        }

        let reused = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.in_use && b.frame_index == frame_index && b.fits(requirements))
            .min_by_key(|(_, b)| b.size)
            .map(|(i, _)| i);

        let block_idx = match reused {
            Some(idx) => {
                log::debug!(
                    "RenderGraph: \"{}\" reuses block #{} ({} bytes) in frame {}",
                    debug_name,
                    idx,
                    self.blocks[idx].size,
                    frame_index
                );
                idx
            }
            None => match self.device.allocate_memory(requirements, debug_name) {
                Ok(memory) => {
                    self.blocks.push(RgAllocationBlock {
                        memory,
                        size: requirements.size,
                        alignment: requirements.alignment.max(1),
                        memory_type_bits: requirements.memory_type_bits,
                        first_use,
                        last_use,
                        frame_index,
                        in_use: false,
                        occupant: None,
                    });
                    self.blocks.len() - 1
                }
                Err(err) => {
                    log::error!("RenderGraph: transient pool exhausted for \"{}\": {:#}", debug_name, err);
                    return None;
                }
            },
        };

        let block = &mut self.blocks[block_idx];
        block.in_use = true;
        block.first_use = first_use;
        block.last_use = last_use;
        Some(block_idx)
    }
}

// frame & destroy
impl RgTransientPool {
    /// 开始录制 `frame_index`：调用方必须已经等待该帧上一次提交的 fence
    pub fn begin_frame(&mut self, frame_index: usize) {
        let device = &self.device;
        self.resources.retain(|res| {
            if res.frame_index != frame_index {
                return true;
            }
            device.destroy_physical(res.physical);
            false
        });

        // 该帧上一次提交已经完成，之前的占用者不再需要等待
        for block in self.blocks.iter_mut().filter(|b| b.frame_index == frame_index) {
            block.in_use = false;
            block.occupant = None;
        }
    }

    /// 销毁全部资源并释放所有显存
    pub fn destroy(&mut self) {
        for res in self.resources.drain(..) {
            self.device.destroy_physical(res.physical);
        }
        for block in self.blocks.drain(..) {
            self.device.free_memory(block.memory);
        }
    }
}

// getters
impl RgTransientPool {
    #[inline]
    pub fn blocks(&self) -> &[RgAllocationBlock] {
        &self.blocks
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_memory(&self) -> vk::DeviceSize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    #[inline]
    pub fn live_resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Drop for RgTransientPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;
    use crate::render_graph::dummy_device::RgDummyDevice;

    fn color_desc() -> RgImageDesc {
        RgImageDesc::new_2d(256, 256, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT)
    }

    fn memory_of(device: &RgDummyDevice, created: Option<RgTransientResource>) -> RgMemoryHandle {
        device.image_memory(created.unwrap().physical.image().unwrap()).unwrap()
    }

    #[test]
    fn test_disjoint_lifetimes_share_block() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);

        let a = pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 0, 1, 0);
        let b = pool.create_image(RgResourceHandle::default(), &color_desc(), "b", 2, 3, 0);

        assert_eq!(memory_of(&device, a), memory_of(&device, b));
        assert_eq!(pool.block_count(), 1);
        assert_eq!(device.total_allocations(), 1);
    }

    #[test]
    fn test_overlapping_lifetimes_never_share() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);

        let long = pool.create_image(RgResourceHandle::default(), &color_desc(), "long", 0, 5, 0);
        let short = pool.create_image(RgResourceHandle::default(), &color_desc(), "short", 1, 2, 0);
        let late = pool.create_image(RgResourceHandle::default(), &color_desc(), "late", 3, 4, 0);

        assert_ne!(memory_of(&device, long), memory_of(&device, short));
        // short 已结束，late 可以复用它的块，但不能碰仍在使用的 long
        assert_eq!(memory_of(&device, short), memory_of(&device, late));
        assert_ne!(memory_of(&device, long), memory_of(&device, late));
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_no_cross_frame_reuse() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);

        let f0 = pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 0, 0, 0);
        let f1 = pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 1, 1, 1);

        assert_ne!(memory_of(&device, f0), memory_of(&device, f1));
        assert!(pool.blocks().iter().any(|b| b.frame_index == 0));
        assert!(pool.blocks().iter().any(|b| b.frame_index == 1));
    }

    #[test]
    fn test_begin_frame_recycles_without_freeing() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);

        pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 0, 3, 0);
        pool.create_image(RgResourceHandle::default(), &color_desc(), "b", 1, 3, 0);
        pool.create_image(RgResourceHandle::default(), &color_desc(), "c", 0, 3, 1);
        assert_eq!(device.live_image_count(), 3);

        pool.begin_frame(0);
        assert_eq!(device.live_image_count(), 1);
        assert_eq!(device.allocation_count(), 3);
        assert!(pool.blocks().iter().filter(|b| b.frame_index == 0).all(|b| !b.in_use));
        assert!(pool.blocks().iter().any(|b| b.frame_index == 1 && b.in_use));

        pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 0, 3, 0);
        pool.create_image(RgResourceHandle::default(), &color_desc(), "b", 1, 3, 0);
        assert_eq!(device.total_allocations(), 3);

        pool.destroy();
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.live_image_count(), 0);
    }

    #[test]
    fn test_best_fit_and_memory_type() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);

        let big = RgImageDesc::new_2d(1024, 1024, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let depth = RgImageDesc::new_2d(64, 64, vk::Format::D32_SFLOAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        let big_image = pool.create_image(RgResourceHandle::default(), &big, "big", 0, 0, 0);
        let small_image = pool.create_image(RgResourceHandle::default(), &color_desc(), "small", 0, 0, 0);

        // 两个块都空闲，选更小的那个
        let reused = pool.create_image(RgResourceHandle::default(), &color_desc(), "reuse", 1, 1, 0);
        assert_eq!(memory_of(&device, reused), memory_of(&device, small_image));
        assert_ne!(memory_of(&device, reused), memory_of(&device, big_image));

        // 颜色块的 memory type 不一定能放深度图像
        let depth_image = pool.create_image(RgResourceHandle::default(), &depth, "depth", 2, 2, 0);
        assert_eq!(pool.block_count(), 3);
        assert!(depth_image.is_some());
    }

    #[test]
    fn test_aliasing_disabled() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), false);

        pool.create_image(RgResourceHandle::default(), &color_desc(), "a", 0, 0, 0);
        pool.create_image(RgResourceHandle::default(), &color_desc(), "b", 1, 1, 0);
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let device = Rc::new(RgDummyDevice::with_memory_budget(300 * 1024));
        let mut pool = RgTransientPool::new(device.clone(), true);

        assert!(pool.create_image(RgResourceHandle::default(), &color_desc(), "fits", 0, 1, 0).is_some());
        assert!(pool.create_image(RgResourceHandle::default(), &color_desc(), "too-much", 1, 1, 0).is_none());
        // 已结束的块仍可复用
        assert!(pool.create_image(RgResourceHandle::default(), &color_desc(), "reuse", 2, 2, 0).is_some());
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn test_reuse_reports_previous_occupant() {
        let device = Rc::new(RgDummyDevice::new());
        let mut pool = RgTransientPool::new(device.clone(), true);
        let mut keys = SlotMap::<RgResourceHandle, ()>::with_key();
        let (x, y, z) = (keys.insert(()), keys.insert(()), keys.insert(()));

        let first = pool.create_image(x, &color_desc(), "x", 0, 1, 0).unwrap();
        assert_eq!(first.previous_occupant, None);

        let second = pool.create_image(y, &color_desc(), "y", 2, 3, 0).unwrap();
        assert_eq!(second.previous_occupant, Some(x));

        let buffer_desc = RgBufferDesc::new(4096, vk::BufferUsageFlags::STORAGE_BUFFER);
        let buffer = pool.create_buffer(z, &buffer_desc, "z", 4, 4, 0).unwrap();
        assert_eq!(buffer.previous_occupant, Some(y));

        // 新的一帧：上一次提交已完成，不需要再等待旧占用者
        pool.begin_frame(0);
        let again = pool.create_image(x, &color_desc(), "x", 0, 1, 0).unwrap();
        assert_eq!(again.previous_occupant, None);
    }
}
