//! Barrier 自动计算
//!
//! 分两步：
//! 1. `build_resource_usage_table`：按编译后的执行顺序，把每个资源的所有使用展开成一条时间线；
//! 2. `generate_barriers`：沿时间线模拟资源状态，为每个 Pass 生成 pre-barrier（invalidate），
//!    并在外部资源最后一次使用之后生成 post-barrier（flush）以满足交还约束。
//!
//! 读取之前的 barrier 会向后查找（`find_next_user`）紧随其后、layout 相同的所有读取者，
//! 一次性把写入对它们全部可见，后续读取者因此不再需要 barrier。

use ash::vk;
use slotmap::SecondaryMap;

use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::pass::RgPassNode;
use crate::render_graph::resource::RgResourceKind;
use crate::render_graph::resource_handle::RgResourceHandle;
use crate::render_graph::resource_registry::RgResourceRegistry;
use crate::render_graph::resource_state::{RgBufferState, RgImageState, RgResourceUsage};

/// 图像 Barrier 描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgImageBarrierDesc {
    pub handle: RgResourceHandle,
    pub src_state: RgImageState,
    pub dst_state: RgImageState,
    /// 图像 aspect（COLOR / DEPTH / STENCIL）
    pub aspect: vk::ImageAspectFlags,
    /// 持久资源每帧的第一个 barrier：src 是上一帧结束时的状态。
    /// 物理资源刚创建的那一帧，src layout 要替换为 `UNDEFINED`
    pub from_previous_frame: bool,
    /// 瞬态资源每帧的第一个 barrier：执行时 src 替换为同一显存块上一个占用者最后一次访问的状态
    pub aliased_entry: bool,
}

impl RgImageBarrierDesc {
    pub fn new(handle: RgResourceHandle, src_state: RgImageState, dst_state: RgImageState) -> Self {
        Self {
            handle,
            src_state,
            dst_state,
            aspect: vk::ImageAspectFlags::COLOR,
            from_previous_frame: false,
            aliased_entry: false,
        }
    }

    #[inline]
    pub fn with_aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    /// 检查是否需要 barrier
    ///
    /// layout 不同一定需要；layout 相同时，只要任意一侧有写操作就需要
    pub fn needs_barrier(&self) -> bool {
        if self.src_state.layout != self.dst_state.layout {
            return true;
        }
        self.src_state.is_write() || self.dst_state.is_write()
    }

    /// 丢弃旧内容：src layout 置为 `UNDEFINED`
    pub fn discarding(&self) -> Self {
        Self {
            src_state: RgImageState::new(self.src_state.stage, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED),
            ..self.clone()
        }
    }

    /// 等待同一显存块上的前一个占用者，旧内容丢弃
    pub fn after_alias(&self, previous: RgImageState) -> Self {
        Self {
            src_state: RgImageState::new(previous.stage, previous.access, vk::ImageLayout::UNDEFINED),
            ..self.clone()
        }
    }

    pub fn to_vk_barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_state.stage)
            .src_access_mask(self.src_state.src_access())
            .dst_stage_mask(self.dst_state.stage)
            .dst_access_mask(self.dst_state.access)
            .old_layout(self.src_state.layout)
            .new_layout(self.dst_state.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
    }
}

/// 缓冲区 Barrier 描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgBufferBarrierDesc {
    pub handle: RgResourceHandle,
    pub src_state: RgBufferState,
    pub dst_state: RgBufferState,
    pub offset: vk::DeviceSize,
    /// `WHOLE_SIZE` 表示整个缓冲区
    pub size: vk::DeviceSize,
    /// 同 `RgImageBarrierDesc::aliased_entry`
    pub aliased_entry: bool,
}

impl RgBufferBarrierDesc {
    pub fn new(handle: RgResourceHandle, src_state: RgBufferState, dst_state: RgBufferState) -> Self {
        Self {
            handle,
            src_state,
            dst_state,
            offset: 0,
            size: vk::WHOLE_SIZE,
            aliased_entry: false,
        }
    }

    /// 有写操作才需要 barrier
    pub fn needs_barrier(&self) -> bool {
        self.src_state.is_write() || self.dst_state.is_write()
    }

    pub fn after_alias(&self, previous: RgBufferState) -> Self {
        Self {
            src_state: previous,
            ..self.clone()
        }
    }

    pub fn to_vk_barrier(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src_state.stage)
            .src_access_mask(RgImageState::from(self.src_state).src_access())
            .dst_stage_mask(self.dst_state.stage)
            .dst_access_mask(self.dst_state.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// 一个 Pass 前（或后）需要的 Barrier 集合
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RgPassBarriers {
    pub image_barriers: Vec<RgImageBarrierDesc>,
    pub buffer_barriers: Vec<RgBufferBarrierDesc>,
}

impl RgPassBarriers {
    #[inline]
    pub fn add_image_barrier(&mut self, barrier: RgImageBarrierDesc) {
        self.image_barriers.push(barrier);
    }

    #[inline]
    pub fn add_buffer_barrier(&mut self, barrier: RgBufferBarrierDesc) {
        self.buffer_barriers.push(barrier);
    }

    #[inline]
    pub fn has_barriers(&self) -> bool {
        !self.image_barriers.is_empty() || !self.buffer_barriers.is_empty()
    }

    #[inline]
    pub fn image_barrier_count(&self) -> usize {
        self.image_barriers.len()
    }

    #[inline]
    pub fn buffer_barrier_count(&self) -> usize {
        self.buffer_barriers.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.image_barriers.clear();
        self.buffer_barriers.clear();
    }

    pub fn image_barrier(&self, handle: RgResourceHandle) -> Option<&RgImageBarrierDesc> {
        self.image_barriers.iter().find(|b| b.handle == handle)
    }

    pub fn buffer_barrier(&self, handle: RgResourceHandle) -> Option<&RgBufferBarrierDesc> {
        self.buffer_barriers.iter().find(|b| b.handle == handle)
    }
}

/// 资源时间线上的一次使用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgResourceUsageInfo {
    /// 在编译后执行顺序中的位置
    pub position: usize,
    /// Pass 的声明顺序索引
    pub pass: usize,
    pub usage: RgResourceUsage,
    pub is_read: bool,
    pub is_write: bool,
    /// 推导出的 stage/access/layout，同一 Pass 内的多次访问已合并
    pub state: RgImageState,
}

/// 资源 -> 按执行顺序排列的使用列表
pub type RgResourceUsageTable = SecondaryMap<RgResourceHandle, Vec<RgResourceUsageInfo>>;

/// 生成 barrier 时对单个资源的状态跟踪
struct RgResourceTrack {
    layout: vk::ImageLayout,
    /// 最近一次写入的 (stage, 写 access)，直到被下一次写入取代
    pending_write: Option<(vk::PipelineStageFlags2, vk::AccessFlags2)>,
    /// 最近一次写入（或 layout 转换）之后的读取 stage
    read_stages: vk::PipelineStageFlags2,
    /// pending_write 已经对哪些 stage/access 可见
    visible_stages: vk::PipelineStageFlags2,
    visible_access: vk::AccessFlags2,
    /// 没有任何访问需要等待时使用的 src stage
    idle_stage: vk::PipelineStageFlags2,
}

impl RgResourceTrack {
    fn entry(state: RgImageState) -> Self {
        let mut track = Self {
            layout: state.layout,
            pending_write: None,
            read_stages: vk::PipelineStageFlags2::NONE,
            visible_stages: vk::PipelineStageFlags2::NONE,
            visible_access: vk::AccessFlags2::NONE,
            idle_stage: state.stage,
        };
        if state.is_write() {
            track.pending_write = Some((state.stage, state.src_access()));
        } else if state.access != vk::AccessFlags2::NONE {
            track.read_stages = state.stage;
        }
        track
    }

    fn src_state(&self) -> RgImageState {
        let mut stage = self.read_stages;
        let mut access = vk::AccessFlags2::NONE;
        if let Some((write_stage, write_access)) = self.pending_write {
            stage |= write_stage;
            access |= write_access;
        }
        if stage.is_empty() {
            stage = self.idle_stage;
        }
        RgImageState::new(stage, access, self.layout)
    }

    fn has_hazard_for_write(&self) -> bool {
        self.pending_write.is_some() || !self.read_stages.is_empty()
    }

    fn is_visible_to(&self, state: &RgImageState) -> bool {
        self.pending_write.is_none()
            || (self.visible_stages.contains(state.stage) && self.visible_access.contains(state.access))
    }

    /// 推进到时间线上的第 `index` 个使用，返回需要的 (src, dst)
    fn advance(&mut self, timeline: &[RgResourceUsageInfo], index: usize) -> Option<(RgImageState, RgImageState)> {
        let usage = &timeline[index];
        let required = usage.state;
        let layout_change = required.layout != self.layout;

        if usage.is_write {
            let barrier = (layout_change || self.has_hazard_for_write()).then(|| (self.src_state(), required));

            self.pending_write = Some((required.stage, required.src_access()));
            self.read_stages = vk::PipelineStageFlags2::NONE;
            self.visible_stages = vk::PipelineStageFlags2::NONE;
            self.visible_access = vk::AccessFlags2::NONE;
            self.layout = required.layout;
            barrier
        } else {
            let barrier = (layout_change || !self.is_visible_to(&required)).then(|| {
                let dst = RgBarrierGenerator::find_next_user(timeline, index);
                (self.src_state(), dst)
            });

            if let Some((_, dst)) = barrier {
                self.visible_stages |= dst.stage;
                self.visible_access |= dst.access;
                if layout_change {
                    // 之前的读取已经被这次 layout 转换等待
                    self.read_stages = vk::PipelineStageFlags2::NONE;
                }
            }
            self.read_stages |= required.stage;
            self.layout = required.layout;
            barrier
        }
    }

    /// 交还给外部时需要的 (src, dst)
    fn exit(&mut self, final_state: RgImageState) -> Option<(RgImageState, RgImageState)> {
        let layout_change = final_state.layout != self.layout;
        let hazard = if final_state.is_write() {
            self.has_hazard_for_write()
        } else {
            final_state.access != vk::AccessFlags2::NONE && !self.is_visible_to(&final_state)
        };

        let barrier = (layout_change || hazard).then(|| (self.src_state(), final_state));
        *self = Self::entry(final_state);
        barrier
    }
}

/// Barrier 生成器
pub struct RgBarrierGenerator;

impl RgBarrierGenerator {
    /// 构建资源使用时间线
    ///
    /// `order` 是编译后的执行顺序（只含可达 Pass）。
    pub fn build_resource_usage_table(
        order: &[usize],
        passes: &[RgPassNode<'_>],
        resources: &RgResourceRegistry,
    ) -> RgResourceUsageTable {
        let mut table = RgResourceUsageTable::new();

        for (position, &pass_idx) in order.iter().enumerate() {
            let pass = &passes[pass_idx];
            for handle in pass.touched_resources() {
                let Some(resource) = resources.get(handle) else {
                    continue;
                };
                let kind = resource.kind();
                let accesses = pass.accesses.iter().filter(|a| a.resource == handle);

                let mut info: Option<RgResourceUsageInfo> = None;
                for access in accesses {
                    let read = !access.is_write
                        || pass.accesses.iter().any(|a| a.resource == handle && a.usage == access.usage && !a.is_write);
                    let state = access.usage.resolve(&pass.kind, kind, read, access.is_write);
                    info = Some(match info {
                        None => RgResourceUsageInfo {
                            position,
                            pass: pass_idx,
                            usage: access.usage,
                            is_read: !access.is_write,
                            is_write: access.is_write,
                            state,
                        },
                        Some(mut merged) => {
                            merged.state.stage |= state.stage;
                            merged.state.access |= state.access;
                            if access.is_write {
                                merged.usage = access.usage;
                                merged.state.layout = state.layout;
                            }
                            merged.is_read |= !access.is_write;
                            merged.is_write |= access.is_write;
                            merged
                        }
                    });
                }

                if let Some(info) = info {
                    if let Some(timeline) = table.entry(handle).map(|e| e.or_default()) {
                        timeline.push(info);
                    }
                }
            }
        }

        table
    }

    /// 从时间线的第 `index` 个使用（一次读取）开始，向后合并紧随其后、layout 相同的读取
    ///
    /// 返回合并后的目标状态，用作 barrier 的 dst。
    pub fn find_next_user(timeline: &[RgResourceUsageInfo], index: usize) -> RgImageState {
        let first = timeline[index].state;
        let mut dst = first;
        for next in timeline[index + 1..].iter().take_while(|u| !u.is_write && u.state.layout == first.layout) {
            dst.stage |= next.state.stage;
            dst.access |= next.state.access;
        }
        dst
    }

    /// 资源在一帧内最后一次访问的状态，用作下一个别名占用者的 src
    ///
    /// 末尾是读取时，合并之前 layout 相同的连续读取：它们之间可能没有 barrier，必须一起等待。
    pub fn last_access_state(timeline: &[RgResourceUsageInfo]) -> Option<RgImageState> {
        let last = timeline.last()?;
        let mut state = last.state;
        if !last.is_write {
            for prev in timeline.iter().rev().skip(1).take_while(|u| !u.is_write && u.state.layout == last.state.layout) {
                state.stage |= prev.state.stage;
                state.access |= prev.state.access;
            }
        }
        Some(state)
    }

    /// 为所有可达 Pass 生成 pre/post barrier，之前的结果会被清空
    pub fn generate_barriers(
        table: &RgResourceUsageTable,
        passes: &mut [RgPassNode<'_>],
        resources: &RgResourceRegistry,
    ) {
        for pass in passes.iter_mut() {
            pass.pre_barriers.clear();
            pass.post_barriers.clear();
        }

        for (handle, timeline) in table.iter() {
            let (Some(resource), Some(first), Some(last)) = (resources.get(handle), timeline.first(), timeline.last())
            else {
                continue;
            };

            let entry_state = if let Some(constraints) = resource.constraints() {
                constraints.initial
            } else if resource.is_persistent() {
                // 环绕：本帧开始时处于上一帧最后一次使用留下的状态
                last.state
            } else {
                if !first.is_write {
                    log::warn!(
                        "RenderGraph: \"{}\" is read by pass \"{}\" before any write, its content is undefined",
                        resource.name,
                        passes[first.pass].name
                    );
                }
                RgImageState::UNDEFINED
            };

            let aspect = resource
                .image_desc()
                .map(|desc| RgImageDesc::infer_aspect(desc.format))
                .unwrap_or(vk::ImageAspectFlags::COLOR);
            let mut track = RgResourceTrack::entry(entry_state);

            for index in 0..timeline.len() {
                let usage = &timeline[index];
                let entry_src = track.src_state();
                let mut barrier = track.advance(timeline, index);

                let from_previous_frame = index == 0 && resource.is_persistent();
                let aliased_entry = index == 0 && resource.is_transient();
                if (from_previous_frame || aliased_entry) && barrier.is_none() {
                    // 持久资源可能是本帧新建的，瞬态资源可能复用了别的资源的显存，
                    // 都必须保留一个 barrier 供执行时改写
                    let dst = if usage.is_write { usage.state } else { Self::find_next_user(timeline, index) };
                    barrier = Some((entry_src, dst));
                }

                if let Some((src, dst)) = barrier {
                    log::trace!(
                        "RenderGraph: pre-barrier \"{}\" before \"{}\": {:?} -> {:?}",
                        resource.name,
                        passes[usage.pass].name,
                        src.layout,
                        dst.layout
                    );
                    Self::push_barrier(
                        &mut passes[usage.pass].pre_barriers,
                        resource.kind(),
                        handle,
                        src,
                        dst,
                        aspect,
                        from_previous_frame,
                        aliased_entry,
                    );
                }
            }

            if let Some(constraints) = resource.constraints() {
                if let Some((src, dst)) = track.exit(constraints.final_state) {
                    log::trace!(
                        "RenderGraph: post-barrier \"{}\" after \"{}\": {:?} -> {:?}",
                        resource.name,
                        passes[last.pass].name,
                        src.layout,
                        dst.layout
                    );
                    Self::push_barrier(
                        &mut passes[last.pass].post_barriers,
                        resource.kind(),
                        handle,
                        src,
                        dst,
                        aspect,
                        false,
                        false,
                    );
                }
            }
        }
    }

    fn push_barrier(
        barriers: &mut RgPassBarriers,
        kind: RgResourceKind,
        handle: RgResourceHandle,
        src: RgImageState,
        dst: RgImageState,
        aspect: vk::ImageAspectFlags,
        from_previous_frame: bool,
        aliased_entry: bool,
    ) {
        match kind {
            RgResourceKind::Image => {
                let mut barrier = RgImageBarrierDesc::new(handle, src, dst).with_aspect(aspect);
                barrier.from_previous_frame = from_previous_frame;
                barrier.aliased_entry = aliased_entry;
                barriers.add_image_barrier(barrier);
            }
            RgResourceKind::Buffer => {
                let mut barrier = RgBufferBarrierDesc::new(handle, src.buffer_state(), dst.buffer_state());
                barrier.aliased_entry = aliased_entry;
                barriers.add_buffer_barrier(barrier);
            }
        }
    }

    /// 合并冗余 barrier，直到不动点
    ///
    /// - 同一列表中完全相同的 barrier 只保留一个
    /// - 同一列表中同一资源首尾相接的 barrier（a.dst == b.src）合并为一个
    /// - Pass i 的 flush 与紧随其后 Pass i+1 的 invalidate 首尾相接时，合并进 invalidate
    /// - 合并后既不转换 layout 也不涉及写入的 barrier 被删除
    ///
    /// 对同一输入多次调用结果相同。
    pub fn merge_barriers(order: &[usize], passes: &mut [RgPassNode<'_>]) {
        loop {
            let mut changed = false;

            for window in order.windows(2) {
                let (current, next) = (window[0], window[1]);
                let mut flushes = std::mem::take(&mut passes[current].post_barriers);
                changed |= Self::fold_flushes(&mut flushes, &mut passes[next].pre_barriers);
                passes[current].post_barriers = flushes;
            }

            for &pass_idx in order {
                let pass = &mut passes[pass_idx];
                changed |= Self::merge_list(&mut pass.pre_barriers);
                changed |= Self::merge_list(&mut pass.post_barriers);
            }

            if !changed {
                break;
            }
        }
    }

    fn fold_flushes(flushes: &mut RgPassBarriers, invalidates: &mut RgPassBarriers) -> bool {
        let mut changed = false;

        flushes.image_barriers.retain(|flush| {
            let Some(invalidate) = invalidates
                .image_barriers
                .iter_mut()
                .find(|b| {
                    b.handle == flush.handle && b.src_state == flush.dst_state && !b.from_previous_frame && !b.aliased_entry
                })
            else {
                return true;
            };
            invalidate.src_state = flush.src_state;
            changed = true;
            false
        });

        flushes.buffer_barriers.retain(|flush| {
            let Some(invalidate) = invalidates
                .buffer_barriers
                .iter_mut()
                .find(|b| b.handle == flush.handle && b.src_state == flush.dst_state && !b.aliased_entry)
            else {
                return true;
            };
            invalidate.src_state = flush.src_state;
            changed = true;
            false
        });

        changed
    }

    fn merge_list(barriers: &mut RgPassBarriers) -> bool {
        let before = barriers.clone();

        let mut images: Vec<RgImageBarrierDesc> = Vec::with_capacity(barriers.image_barriers.len());
        for barrier in barriers.image_barriers.drain(..) {
            if images.contains(&barrier) {
                continue;
            }
            if let Some(prev) = images.iter_mut().find(|b| b.handle == barrier.handle && b.dst_state == barrier.src_state) {
                prev.dst_state = barrier.dst_state;
                continue;
            }
            images.push(barrier);
        }
        images.retain(|b| b.from_previous_frame || b.aliased_entry || b.needs_barrier());
        barriers.image_barriers = images;

        let mut buffers: Vec<RgBufferBarrierDesc> = Vec::with_capacity(barriers.buffer_barriers.len());
        for barrier in barriers.buffer_barriers.drain(..) {
            if buffers.contains(&barrier) {
                continue;
            }
            if let Some(prev) = buffers.iter_mut().find(|b| b.handle == barrier.handle && b.dst_state == barrier.src_state)
            {
                prev.dst_state = barrier.dst_state;
                continue;
            }
            buffers.push(barrier);
        }
        buffers.retain(|b| b.aliased_entry || b.needs_barrier() || b.src_state.stage != b.dst_state.stage);
        barriers.buffer_barriers = buffers;

        *barriers != before
    }
}
