//! 基于 ash + vk-mem 的 `RgDevice` 实现
//!
//! 瞬态资源的显存通过 VMA 的原始分配接口获得，图像 / 缓冲区单独创建后用 `bind_image_memory` /
//! `bind_buffer_memory` 绑定到同一块显存上，从而形成别名。需要 Vulkan 1.3（synchronization2 与 maintenance4）。

use std::cell::RefCell;
use std::ffi::CString;
use std::rc::Rc;

use anyhow::Context;
use ash::vk;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::device::RgDevice;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource_handle::RgMemoryHandle;

pub struct RgVkDevice {
    device: ash::Device,
    allocator: Rc<vk_mem::Allocator>,
    /// 未启用 `VK_EXT_debug_utils` 时为 `None`，调试名称和标签会被忽略
    debug_utils: Option<ash::ext::debug_utils::Device>,

    allocations: RefCell<SlotMap<RgMemoryHandle, vk_mem::Allocation>>,
}

// new & init
impl RgVkDevice {
    pub fn new(
        device: ash::Device,
        allocator: Rc<vk_mem::Allocator>,
        debug_utils: Option<ash::ext::debug_utils::Device>,
    ) -> Self {
        Self {
            device,
            allocator,
            debug_utils,
            allocations: RefCell::new(SlotMap::with_key()),
        }
    }
}

// tools
impl RgVkDevice {
    fn set_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        unsafe {
            if let Err(err) = debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
            ) {
                log::warn!("RenderGraph: failed to set debug name {:?}: {:?}", name, err);
            }
        }
    }
}

impl RgDevice for RgVkDevice {
    fn image_memory_requirements(&self, desc: &RgImageDesc) -> vk::MemoryRequirements {
        let create_info = desc.to_create_info();
        let info = vk::DeviceImageMemoryRequirements::default().create_info(&create_info);
        let mut requirements = vk::MemoryRequirements2::default();
        unsafe {
            self.device.get_device_image_memory_requirements(&info, &mut requirements);
        }
        requirements.memory_requirements
    }

    fn buffer_memory_requirements(&self, desc: &RgBufferDesc) -> vk::MemoryRequirements {
        let create_info = desc.to_create_info();
        let info = vk::DeviceBufferMemoryRequirements::default().create_info(&create_info);
        let mut requirements = vk::MemoryRequirements2::default();
        unsafe {
            self.device.get_device_buffer_memory_requirements(&info, &mut requirements);
        }
        requirements.memory_requirements
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        debug_name: &str,
    ) -> anyhow::Result<RgMemoryHandle> {
        // 原始分配不能使用 Auto 系列的 usage，直接指定 DEVICE_LOCAL
        let create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Unknown,
            required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ..Default::default()
        };
        let allocation = unsafe { self.allocator.allocate_memory(requirements, &create_info) }
            .with_context(|| format!("allocate {} bytes for \"{}\"", requirements.size, debug_name))?;

        Ok(self.allocations.borrow_mut().insert(allocation))
    }

    fn free_memory(&self, memory: RgMemoryHandle) {
        if let Some(mut allocation) = self.allocations.borrow_mut().remove(memory) {
            unsafe {
                self.allocator.free_memory(&mut allocation);
            }
        }
    }

    fn create_aliased_image(
        &self,
        memory: RgMemoryHandle,
        desc: &RgImageDesc,
        debug_name: &str,
    ) -> anyhow::Result<(vk::Image, vk::ImageView)> {
        let allocations = self.allocations.borrow();
        let allocation = allocations.get(memory).context("memory block already freed")?;

        let image = unsafe { self.device.create_image(&desc.to_create_info(), None) }
            .with_context(|| format!("create image \"{}\"", debug_name))?;
        if let Err(err) = unsafe { self.allocator.bind_image_memory(allocation, image) } {
            unsafe { self.device.destroy_image(image, None) };
            return Err(err).with_context(|| format!("bind memory for image \"{}\"", debug_name));
        }
        let view = match unsafe { self.device.create_image_view(&desc.to_view_create_info(image), None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err).with_context(|| format!("create image view \"{}\"", debug_name));
            }
        };

        self.set_debug_name(image, &format!("RgImage::{}", debug_name));
        self.set_debug_name(view, &format!("RgImageView::{}", debug_name));
        Ok((image, view))
    }

    fn create_aliased_buffer(
        &self,
        memory: RgMemoryHandle,
        desc: &RgBufferDesc,
        debug_name: &str,
    ) -> anyhow::Result<vk::Buffer> {
        let allocations = self.allocations.borrow();
        let allocation = allocations.get(memory).context("memory block already freed")?;

        let buffer = unsafe { self.device.create_buffer(&desc.to_create_info(), None) }
            .with_context(|| format!("create buffer \"{}\"", debug_name))?;
        if let Err(err) = unsafe { self.allocator.bind_buffer_memory(allocation, buffer) } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(err).with_context(|| format!("bind memory for buffer \"{}\"", debug_name));
        }

        self.set_debug_name(buffer, &format!("RgBuffer::{}", debug_name));
        Ok(buffer)
    }

    fn destroy_image(&self, image: vk::Image, view: vk::ImageView) {
        unsafe {
            self.device.destroy_image_view(view, None);
            self.device.destroy_image(image, None);
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(image_barriers)
            .buffer_memory_barriers(buffer_barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(cmd, &dependency_info);
        }
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(
                cmd,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(color),
            );
        }
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe {
                debug_utils.cmd_end_debug_utils_label(cmd);
            }
        }
    }
}

impl Drop for RgVkDevice {
    fn drop(&mut self) {
        let leaked = self.allocations.get_mut().len();
        if leaked > 0 {
            log::warn!("RgVkDevice dropped with {} memory blocks still allocated", leaked);
            for (_, mut allocation) in self.allocations.get_mut().drain() {
                unsafe {
                    self.allocator.free_memory(&mut allocation);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rg_device<T: RgDevice>() {}

    #[test]
    fn test_vk_device_is_rg_device() {
        assert_rg_device::<RgVkDevice>();
        let _: fn(&RgVkDevice) -> &dyn RgDevice = |device| device;
    }
}
