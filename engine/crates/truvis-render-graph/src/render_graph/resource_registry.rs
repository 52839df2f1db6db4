use std::collections::HashMap;

use ash::vk;
use slotmap::SlotMap;

use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::resource::{
    RgExternalConstraints, RgLogicalResource, RgPhysicalResource, RgResourceDesc, RgResourceSource,
};
use crate::render_graph::resource_handle::RgResourceHandle;
use crate::render_graph::resource_state::{RgBufferState, RgImageState};

/// 资源注册表
///
/// 由 graph 实例持有，管理所有声明的逻辑资源。
/// 资源以名字寻址，内部存储在 SlotMap 中，提供稳定的句柄。
#[derive(Default)]
pub struct RgResourceRegistry {
    resources: SlotMap<RgResourceHandle, RgLogicalResource>,
    names: HashMap<String, RgResourceHandle>,
}

// new & init
impl RgResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

// register
impl RgResourceRegistry {
    /// 注册资源；重名时记录错误并返回 null 句柄
    fn register(&mut self, resource: RgLogicalResource) -> RgResourceHandle {
        if self.names.contains_key(&resource.name) {
            log::error!("RenderGraph: resource \"{}\" is already registered, ignored", resource.name);
            return RgResourceHandle::default();
        }

        let name = resource.name.clone();
        let handle = self.resources.insert(resource);
        self.names.insert(name, handle);
        handle
    }

    /// 导入外部图像
    ///
    /// `initial` 是 graph 拿到图像时的状态，`final_state` 是执行结束后必须交还的状态。
    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        image: vk::Image,
        view: vk::ImageView,
        desc: RgImageDesc,
        initial: RgImageState,
        final_state: RgImageState,
    ) -> RgResourceHandle {
        let name = name.into();
        if image == vk::Image::null() {
            log::error!("RenderGraph: import_image(\"{}\") with a null image, ignored", name);
            return RgResourceHandle::default();
        }

        self.register(RgLogicalResource::imported(
            name,
            RgResourceDesc::Image(desc),
            RgPhysicalResource::Image { image, view },
            RgExternalConstraints::new(initial, final_state),
        ))
    }

    /// 导入外部缓冲区
    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        buffer: vk::Buffer,
        desc: RgBufferDesc,
        initial: RgBufferState,
        final_state: RgBufferState,
    ) -> RgResourceHandle {
        let name = name.into();
        if buffer == vk::Buffer::null() {
            log::error!("RenderGraph: import_buffer(\"{}\") with a null buffer, ignored", name);
            return RgResourceHandle::default();
        }

        self.register(RgLogicalResource::imported(
            name,
            RgResourceDesc::Buffer(desc),
            RgPhysicalResource::Buffer { buffer },
            RgExternalConstraints::new(initial.into(), final_state.into()),
        ))
    }

    /// 替换导入图像的物理句柄，例如每帧 acquire 到的 swapchain image
    ///
    /// 描述与状态约束不变，已编译的执行计划继续有效。
    pub fn update_imported_image(&mut self, name: &str, image: vk::Image, view: vk::ImageView) -> bool {
        if image == vk::Image::null() {
            log::error!("RenderGraph: update_imported_image(\"{}\") with a null image, ignored", name);
            return false;
        }
        self.update_imported(name, RgPhysicalResource::Image { image, view })
    }

    /// 替换导入缓冲区的物理句柄
    pub fn update_imported_buffer(&mut self, name: &str, buffer: vk::Buffer) -> bool {
        if buffer == vk::Buffer::null() {
            log::error!("RenderGraph: update_imported_buffer(\"{}\") with a null buffer, ignored", name);
            return false;
        }
        self.update_imported(name, RgPhysicalResource::Buffer { buffer })
    }

    fn update_imported(&mut self, name: &str, new_physical: RgPhysicalResource) -> bool {
        let Some(resource) = self.names.get(name).and_then(|&handle| self.resources.get_mut(handle)) else {
            log::error!("RenderGraph: cannot update unknown imported resource \"{}\"", name);
            return false;
        };
        match &mut resource.source {
            RgResourceSource::Imported { physical, .. } if physical.kind() == new_physical.kind() => {
                *physical = new_physical;
                true
            }
            _ => {
                log::error!("RenderGraph: \"{}\" is not an imported {:?}, update ignored", name, new_physical.kind());
                false
            }
        }
    }

    /// 创建 graph 内部图像
    ///
    /// `persistent` 为 true 时物理资源跨帧保留（例如 TAA 的 history），否则每帧从瞬态池别名分配。
    pub fn create_image(&mut self, name: impl Into<String>, desc: RgImageDesc, persistent: bool) -> RgResourceHandle {
        self.register(RgLogicalResource::internal(name, RgResourceDesc::Image(desc), persistent))
    }

    /// 创建 graph 内部缓冲区
    pub fn create_buffer(&mut self, name: impl Into<String>, desc: RgBufferDesc, persistent: bool) -> RgResourceHandle {
        self.register(RgLogicalResource::internal(name, RgResourceDesc::Buffer(desc), persistent))
    }

    /// 将资源标记为 graph 输出
    pub fn mark_output(&mut self, name: &str) -> bool {
        match self.names.get(name).and_then(|&handle| self.resources.get_mut(handle)) {
            Some(resource) => {
                resource.is_output = true;
                true
            }
            None => {
                log::error!("RenderGraph: mark_output(\"{}\") refers to an unknown resource", name);
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.resources.clear();
        self.names.clear();
    }

    /// 清空所有资源的生命周期，在重新编译前调用
    pub(crate) fn reset_lifetimes(&mut self) {
        for resource in self.resources.values_mut() {
            resource.first_use = None;
            resource.last_use = None;
        }
    }
}

// getter & iter
impl RgResourceRegistry {
    #[inline]
    pub fn handle(&self, name: &str) -> Option<RgResourceHandle> {
        self.names.get(name).copied()
    }

    #[inline]
    pub fn get(&self, handle: RgResourceHandle) -> Option<&RgLogicalResource> {
        self.resources.get(handle)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: RgResourceHandle) -> Option<&mut RgLogicalResource> {
        self.resources.get_mut(handle)
    }

    #[inline]
    pub fn get_by_name(&self, name: &str) -> Option<&RgLogicalResource> {
        self.handle(name).and_then(|handle| self.resources.get(handle))
    }

    #[inline]
    pub fn name(&self, handle: RgResourceHandle) -> &str {
        self.resources.get(handle).map(|r| r.name.as_str()).unwrap_or("<unknown>")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (RgResourceHandle, &RgLogicalResource)> {
        self.resources.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use slotmap::Key;

    fn swapchain_desc() -> RgImageDesc {
        RgImageDesc::new_2d(800, 600, vk::Format::B8G8R8A8_SRGB, vk::ImageUsageFlags::COLOR_ATTACHMENT)
    }

    #[test]
    fn test_import_null_image_returns_sentinel() {
        let mut registry = RgResourceRegistry::new();
        let handle = registry.import_image(
            "swapchain",
            vk::Image::null(),
            vk::ImageView::null(),
            swapchain_desc(),
            RgImageState::PRESENT,
            RgImageState::PRESENT,
        );

        assert!(handle.is_null());
        assert!(registry.is_empty());
        assert!(registry.handle("swapchain").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = RgResourceRegistry::new();
        let first = registry.create_image("albedo", RgImageDesc::default(), false);
        let second = registry.create_buffer("albedo", RgBufferDesc::new(256, vk::BufferUsageFlags::STORAGE_BUFFER), false);

        assert!(!first.is_null());
        assert!(second.is_null());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_by_name("albedo").is_some_and(|r| r.image_desc().is_some()));
    }

    #[test]
    fn test_present_exit_marks_output() {
        let mut registry = RgResourceRegistry::new();
        let swapchain = registry.import_image(
            "swapchain",
            vk::Image::from_raw(0x10),
            vk::ImageView::from_raw(0x11),
            swapchain_desc(),
            RgImageState::PRESENT,
            RgImageState::PRESENT,
        );
        let history = registry.create_image("history", RgImageDesc::default(), true);

        let swapchain = registry.get(swapchain).unwrap();
        assert!(swapchain.is_external());
        assert!(swapchain.is_output());

        assert!(!registry.get(history).unwrap().is_output());
        assert!(registry.get(history).unwrap().is_persistent());
        assert!(registry.mark_output("history"));
        assert!(registry.get(history).unwrap().is_output());
        assert!(!registry.mark_output("missing"));
    }

    #[test]
    fn test_update_imported_physical() {
        let mut registry = RgResourceRegistry::new();
        registry.import_image(
            "swapchain",
            vk::Image::from_raw(0x10),
            vk::ImageView::from_raw(0x11),
            swapchain_desc(),
            RgImageState::PRESENT,
            RgImageState::PRESENT,
        );
        registry.create_image("albedo", RgImageDesc::default(), false);

        assert!(registry.update_imported_image("swapchain", vk::Image::from_raw(0x20), vk::ImageView::from_raw(0x21)));
        let swapchain = registry.get_by_name("swapchain").unwrap();
        assert_eq!(
            swapchain.imported_physical(),
            Some(RgPhysicalResource::Image {
                image: vk::Image::from_raw(0x20),
                view: vk::ImageView::from_raw(0x21),
            })
        );
        assert_eq!(swapchain.constraints().unwrap().initial, RgImageState::PRESENT);

        // 空句柄、未知名字、内部资源以及类型不符的更新都被忽略
        assert!(!registry.update_imported_image("swapchain", vk::Image::null(), vk::ImageView::null()));
        assert!(!registry.update_imported_image("missing", vk::Image::from_raw(0x30), vk::ImageView::null()));
        assert!(!registry.update_imported_image("albedo", vk::Image::from_raw(0x30), vk::ImageView::null()));
        assert!(!registry.update_imported_buffer("swapchain", vk::Buffer::from_raw(0x40)));
        assert_eq!(
            registry.get_by_name("swapchain").unwrap().imported_physical().and_then(|p| p.image()),
            Some(vk::Image::from_raw(0x20))
        );
    }
}
