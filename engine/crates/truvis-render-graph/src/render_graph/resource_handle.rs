//! RenderGraph 句柄定义
//!
//! 所有句柄都是 graph 实例内部的虚拟引用，由 `SlotMap` 分配，
//! 与物理的 `vk::Image` / `vk::Buffer` 以及显存块完全分离。

use slotmap::new_key_type;

new_key_type! {
    /// 逻辑资源句柄（image 或 buffer）
    ///
    /// 配置错误时返回 `RgResourceHandle::default()`（null key）作为哨兵值。
    pub struct RgResourceHandle;

    /// 由 `RgDevice` 分配的原始显存块句柄
    pub struct RgMemoryHandle;
}

/// Pass 句柄：即 Pass 在声明顺序中的索引
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RgPassHandle(pub(crate) usize);

impl RgPassHandle {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}
