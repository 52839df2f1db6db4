//! RenderGraph 主体
//!
//! 使用流程：
//! 1. 注册资源（`import_image` / `create_image` ...）并声明 Pass（`add_pass` ...）
//! 2. `build()`：依赖分析、环检测、从终结 Pass 反向裁剪
//! 3. `compile()`：调度、生命周期、barrier 生成与合并
//! 4. 每帧 `execute(cmd, frame_index)`：解析物理资源，按顺序录制 barrier 和 Pass
//!
//! Pass 拓扑变化（窗口 resize、功能开关）时调用 `clear()` 后重新声明，再次 build / compile。
//! 持久资源在重新声明后，只要名字和描述不变，物理资源保持不变。

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use slotmap::SecondaryMap;

use crate::render_graph::barrier::{RgBarrierGenerator, RgPassBarriers, RgResourceUsageTable};
use crate::render_graph::buffer_resource::RgBufferDesc;
use crate::render_graph::device::RgDevice;
use crate::render_graph::graph::{DependencyAnalyzer, DependencyGraph};
use crate::render_graph::image_resource::RgImageDesc;
use crate::render_graph::pass::{RgPass, RgPassBuilder, RgPassContext, RgPassKind, RgPassNode};
use crate::render_graph::resource::{RgLogicalResource, RgPhysicalResource, RgResourceDesc};
use crate::render_graph::resource_handle::{RgMemoryHandle, RgPassHandle, RgResourceHandle};
use crate::render_graph::resource_registry::RgResourceRegistry;
use crate::render_graph::resource_state::{RgBufferState, RgImageState};
use crate::render_graph::scheduler::RgScheduler;
use crate::render_graph::settings::RgSettings;
use crate::render_graph::transient_pool::RgTransientPool;

/// 一帧内解析出的物理资源
struct RgFrameResources {
    physical: SecondaryMap<RgResourceHandle, RgPhysicalResource>,
    /// 本帧新建的持久资源，第一个 barrier 丢弃旧内容
    fresh: HashSet<RgResourceHandle>,
    /// 复用了别的资源显存的瞬态资源 -> 前一个占用者最后一次访问的状态
    aliased: SecondaryMap<RgResourceHandle, RgImageState>,
}

/// 持久资源的物理后备，跨帧、跨重建保留
struct RgPersistentBacking {
    desc: RgResourceDesc,
    physical: RgPhysicalResource,
    memory: RgMemoryHandle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RgGraphState {
    /// 正在声明资源和 Pass
    Recording,
    Built,
    Compiled,
}

pub struct RenderGraph<'a> {
    settings: RgSettings,
    device: Rc<dyn RgDevice>,

    resources: RgResourceRegistry,
    passes: Vec<RgPassNode<'a>>,

    dep_graph: Option<DependencyGraph>,
    /// 编译后的执行顺序（Pass 的声明顺序索引）
    execution_order: Vec<usize>,
    usage_table: RgResourceUsageTable,

    pool: RgTransientPool,
    persistent: HashMap<String, RgPersistentBacking>,

    /// 最近一次 execute 解析出的物理资源
    physical: SecondaryMap<RgResourceHandle, RgPhysicalResource>,
    /// 录制过程中跟踪的资源状态，execute 结束后可查询
    observed_states: SecondaryMap<RgResourceHandle, RgImageState>,

    state: RgGraphState,
}

// new & init
impl<'a> RenderGraph<'a> {
    pub fn new(device: Rc<dyn RgDevice>, settings: RgSettings) -> Self {
        let pool = RgTransientPool::new(device.clone(), settings.enable_aliasing);
        Self {
            settings,
            device,
            resources: RgResourceRegistry::new(),
            passes: Vec::new(),
            dep_graph: None,
            execution_order: Vec::new(),
            usage_table: RgResourceUsageTable::new(),
            pool,
            persistent: HashMap::new(),
            physical: SecondaryMap::new(),
            observed_states: SecondaryMap::new(),
            state: RgGraphState::Recording,
        }
    }

    /// 清空所有 Pass 和资源声明，准备重新构建
    ///
    /// 瞬态池和持久资源保留，未被重新声明的持久资源在下一次 `compile()` 时释放。
    pub fn clear(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.dep_graph = None;
        self.execution_order.clear();
        self.usage_table.clear();
        self.physical.clear();
        self.observed_states.clear();
        self.state = RgGraphState::Recording;
    }

    /// 释放所有 GPU 资源；调用方必须保证 GPU 不再使用它们
    pub fn cleanup(&mut self) {
        self.pool.destroy();
        for (_, backing) in self.persistent.drain() {
            Self::destroy_backing(self.device.as_ref(), backing);
        }
        self.physical.clear();
    }
}

// register resources
impl<'a> RenderGraph<'a> {
    /// 导入外部图像（例如 swapchain image）
    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        image: vk::Image,
        view: vk::ImageView,
        desc: RgImageDesc,
        initial: RgImageState,
        final_state: RgImageState,
    ) -> RgResourceHandle {
        self.state = RgGraphState::Recording;
        self.resources.import_image(name, image, view, desc, initial, final_state)
    }

    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        buffer: vk::Buffer,
        desc: RgBufferDesc,
        initial: RgBufferState,
        final_state: RgBufferState,
    ) -> RgResourceHandle {
        self.state = RgGraphState::Recording;
        self.resources.import_buffer(name, buffer, desc, initial, final_state)
    }

    /// 替换导入图像的物理句柄，不会使已编译的执行计划失效
    ///
    /// 典型用法是每帧把新 acquire 的 swapchain image 交给 graph。
    pub fn update_imported_image(&mut self, name: &str, image: vk::Image, view: vk::ImageView) -> bool {
        self.resources.update_imported_image(name, image, view)
    }

    pub fn update_imported_buffer(&mut self, name: &str, buffer: vk::Buffer) -> bool {
        self.resources.update_imported_buffer(name, buffer)
    }

    /// 创建 graph 内部图像；`persistent` 为 true 时物理资源跨帧保留
    pub fn create_image(&mut self, name: impl Into<String>, desc: RgImageDesc, persistent: bool) -> RgResourceHandle {
        self.state = RgGraphState::Recording;
        self.resources.create_image(name, desc, persistent)
    }

    pub fn create_buffer(&mut self, name: impl Into<String>, desc: RgBufferDesc, persistent: bool) -> RgResourceHandle {
        self.state = RgGraphState::Recording;
        self.resources.create_buffer(name, desc, persistent)
    }

    /// 标记 graph 输出，写入它的 Pass 不会被裁剪
    pub fn mark_output(&mut self, name: &str) -> bool {
        self.state = RgGraphState::Recording;
        self.resources.mark_output(name)
    }
}

// add passes
impl<'a> RenderGraph<'a> {
    /// 添加光栅化 Pass
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        setup: impl FnOnce(&mut RgPassBuilder<'_, 'a>),
    ) -> RgPassHandle {
        self.add_pass_of_kind(name, RgPassKind::graphics(), setup)
    }

    pub fn add_compute_pass(
        &mut self,
        name: impl Into<String>,
        setup: impl FnOnce(&mut RgPassBuilder<'_, 'a>),
    ) -> RgPassHandle {
        self.add_pass_of_kind(name, RgPassKind::Compute, setup)
    }

    pub fn add_transfer_pass(
        &mut self,
        name: impl Into<String>,
        setup: impl FnOnce(&mut RgPassBuilder<'_, 'a>),
    ) -> RgPassHandle {
        self.add_pass_of_kind(name, RgPassKind::Transfer, setup)
    }

    pub fn add_pass_of_kind(
        &mut self,
        name: impl Into<String>,
        kind: RgPassKind,
        setup: impl FnOnce(&mut RgPassBuilder<'_, 'a>),
    ) -> RgPassHandle {
        let mut builder = RgPassBuilder::new(name.into(), kind, &mut self.resources);
        setup(&mut builder);
        let node = RgPassNode::from_builder(builder);
        self.push_pass(node)
    }

    /// 添加实现了 `RgPass` 的 Pass；执行回调固定为 `RgPass::execute`
    pub fn add_rg_pass<P: RgPass + 'a>(&mut self, name: impl Into<String>, kind: RgPassKind, mut pass: P) -> RgPassHandle {
        let mut builder = RgPassBuilder::new(name.into(), kind, &mut self.resources);
        pass.setup(&mut builder);
        builder.execute(move |ctx| pass.execute(ctx));
        let node = RgPassNode::from_builder(builder);
        self.push_pass(node)
    }

    fn push_pass(&mut self, node: RgPassNode<'a>) -> RgPassHandle {
        if self.passes.iter().any(|p| p.name == node.name) {
            log::warn!("RenderGraph: pass name \"{}\" is used more than once", node.name);
        }
        if node.executor.is_none() {
            log::debug!("RenderGraph: pass \"{}\" has no execute callback", node.name);
        }

        self.state = RgGraphState::Recording;
        self.passes.push(node);
        RgPassHandle(self.passes.len() - 1)
    }
}

// build & compile
impl RenderGraph<'_> {
    /// 构建依赖图并裁剪不可达 Pass
    pub fn build(&mut self) {
        let _span = profile_span!("RenderGraph::build");

        let graph = DependencyAnalyzer::analyze(&self.passes);
        if let Err(cycle) = graph.topological_sort() {
            log::error!(
                "RenderGraph: dependency cycle among passes [{}]",
                cycle.iter().map(|&i| self.passes[i].name.as_str()).join(", ")
            );
        }

        let terminals = DependencyAnalyzer::find_terminals(&self.passes, &self.resources);
        if terminals.is_empty() && !self.passes.is_empty() {
            log::warn!("RenderGraph: no pass writes a presented or output resource, every pass is pruned");
        }
        let reachable = graph.mark_reachable(&terminals);

        for (idx, pass) in self.passes.iter_mut().enumerate() {
            pass.reachable = reachable[idx];
            pass.dependencies = graph.get_predecessors(idx).iter().copied().sorted().dedup().collect();
            if !pass.reachable {
                log::debug!("RenderGraph: pass \"{}\" does not contribute to any output, pruned", pass.name);
            }
        }

        log::info!(
            "RenderGraph built: {} passes, {} reachable, {} dependency edges",
            self.passes.len(),
            reachable.iter().filter(|r| **r).count(),
            graph.edges().len()
        );

        self.dep_graph = Some(graph);
        self.state = RgGraphState::Built;
    }

    /// 调度、计算生命周期并生成 barrier；尚未 build 时先 build
    pub fn compile(&mut self) {
        if self.state == RgGraphState::Recording || self.dep_graph.is_none() {
            self.build();
        }
        let _span = profile_span!("RenderGraph::compile");

        let Some(graph) = &self.dep_graph else {
            return;
        };
        let reachable = self.passes.iter().map(|p| p.reachable).collect_vec();
        let order = RgScheduler::schedule(&self.passes, graph, &reachable, &self.resources);

        DependencyAnalyzer::compute_lifetimes(&order, &self.passes, &mut self.resources);
        let table = RgBarrierGenerator::build_resource_usage_table(&order, &self.passes, &self.resources);
        RgBarrierGenerator::generate_barriers(&table, &mut self.passes, &self.resources);
        RgBarrierGenerator::merge_barriers(&order, &mut self.passes);

        let barrier_count: usize = order
            .iter()
            .map(|&i| {
                let pass = &self.passes[i];
                Self::barrier_count(&pass.pre_barriers) + Self::barrier_count(&pass.post_barriers)
            })
            .sum();
        log::info!(
            "RenderGraph compiled: [{}], {} barriers",
            order.iter().map(|&i| self.passes[i].name.as_str()).join(" → "),
            barrier_count
        );

        self.execution_order = order;
        self.usage_table = table;
        self.release_stale_backings();
        self.state = RgGraphState::Compiled;

        if self.settings.print_execution_plan {
            self.print_execution_plan();
        }
    }

    fn barrier_count(barriers: &RgPassBarriers) -> usize {
        barriers.image_barrier_count() + barriers.buffer_barrier_count()
    }

    /// 释放不再被声明（或描述已改变）的持久资源
    fn release_stale_backings(&mut self) {
        let resources = &self.resources;
        let device = self.device.as_ref();
        self.persistent.retain(|name, backing| {
            let alive = resources.get_by_name(name).is_some_and(|r| r.is_persistent() && r.desc == backing.desc);
            if !alive {
                log::debug!("RenderGraph: releasing persistent resource \"{}\"", name);
                device.destroy_physical(backing.physical);
                device.free_memory(backing.memory);
            }
            alive
        });
    }
}

// execute
impl RenderGraph<'_> {
    /// 录制一帧
    ///
    /// `cmd` 必须已经处于录制状态；调用方必须已经等待 `frame_index` 上一次提交的 fence。
    pub fn execute(&mut self, cmd: vk::CommandBuffer, frame_index: usize) {
        if frame_index >= self.settings.fif_count {
            log::error!(
                "RenderGraph: frame index {} is out of range (fif_count = {}), frame skipped",
                frame_index,
                self.settings.fif_count
            );
            return;
        }
        if self.state != RgGraphState::Compiled {
            self.compile();
        }
        let _span = profile_span!("RenderGraph::execute");

        self.pool.set_aliasing(self.settings.enable_aliasing);
        self.pool.begin_frame(frame_index);
        let frame = self.resolve_physical(frame_index);
        let physical = &frame.physical;

        // 每帧开始时的状态
        for (handle, resource) in self.resources.iter() {
            if let Some(constraints) = resource.constraints() {
                self.observed_states.insert(handle, constraints.initial);
            } else if resource.is_transient() || frame.fresh.contains(&handle) {
                self.observed_states.insert(handle, RgImageState::UNDEFINED);
            }
        }

        let device = self.device.clone();
        let mut skipped = 0;
        for (position, &pass_idx) in self.execution_order.iter().enumerate() {
            let pass = &mut self.passes[pass_idx];
            let touched = pass.touched_resources().collect_vec();
            let unbacked = touched.iter().filter(|h| !physical.contains_key(**h)).collect_vec();

            Self::record_barriers(device.as_ref(), cmd, &pass.pre_barriers, &frame, &mut self.observed_states);

            if unbacked.is_empty() {
                if self.settings.debug_labels {
                    device.cmd_begin_label(cmd, &pass.name, pass.kind.label_color());
                }
                let ctx = RgPassContext {
                    cmd,
                    frame_index,
                    pass_name: &pass.name,
                    pass_kind: &pass.kind,
                    device: device.as_ref(),
                    resources: &self.resources,
                    physical,
                };
                if let Some(executor) = pass.executor.as_mut() {
                    executor(&ctx);
                }
                if self.settings.debug_labels {
                    device.cmd_end_label(cmd);
                }
            } else {
                skipped += 1;
                log::warn!(
                    "RenderGraph: pass \"{}\" skipped in frame {}, no physical resource for [{}]",
                    pass.name,
                    frame_index,
                    unbacked.iter().map(|&&h| self.resources.name(h)).join(", ")
                );
            }

            for handle in touched {
                let state = self.usage_table.get(handle).and_then(|t| t.iter().find(|u| u.position == position));
                if let (Some(usage), true) = (state, physical.contains_key(handle)) {
                    self.observed_states.insert(handle, usage.state);
                }
            }

            Self::record_barriers(device.as_ref(), cmd, &pass.post_barriers, &frame, &mut self.observed_states);
        }

        // 没有 post-barrier 的外部资源：当前 layout 已满足交还约束，剩下的同步由交接方负责
        for (handle, resource) in self.resources.iter() {
            let Some(constraints) = resource.constraints() else {
                continue;
            };
            match self.observed_states.get(handle) {
                Some(observed) if observed.layout == constraints.final_state.layout => {
                    self.observed_states.insert(handle, constraints.final_state);
                }
                observed => log::warn!(
                    "RenderGraph: \"{}\" leaves the graph in {:?}, expected {:?}",
                    resource.name,
                    observed.map(|s| s.layout),
                    constraints.final_state.layout
                ),
            }
        }

        log::trace!(
            "RenderGraph: frame {} recorded {} passes ({} skipped), pool {} blocks / {} bytes",
            frame_index,
            self.execution_order.len() - skipped,
            skipped,
            self.pool.block_count(),
            self.pool.total_memory()
        );
        self.physical = frame.physical;
    }

    /// 为本帧所有被可达 Pass 使用的资源找到物理资源
    fn resolve_physical(&mut self, frame_index: usize) -> RgFrameResources {
        let mut physical = SecondaryMap::new();
        let mut fresh = HashSet::new();
        let mut aliased = SecondaryMap::new();

        for (handle, resource) in self.resources.iter() {
            if let Some(imported) = resource.imported_physical() {
                physical.insert(handle, imported);
            } else if resource.is_persistent() && resource.lifetime().is_some() {
                let backing =
                    Self::ensure_persistent_backing(self.device.as_ref(), &mut self.persistent, resource);
                if let Some((backing, created)) = backing {
                    physical.insert(handle, backing);
                    if created {
                        fresh.insert(handle);
                    }
                }
            }
        }

        // 按 first_use 顺序申请，池依赖这一点判断哪些块已经可以复用
        let transients = self
            .resources
            .iter()
            .filter(|(_, r)| r.is_transient())
            .filter_map(|(handle, r)| r.lifetime().map(|lifetime| (handle, lifetime)))
            .sorted_by_key(|(_, lifetime)| *lifetime)
            .collect_vec();
        for (handle, (first_use, last_use)) in transients {
            let Some(resource) = self.resources.get(handle) else {
                continue;
            };
            let created = match &resource.desc {
                RgResourceDesc::Image(desc) => {
                    self.pool.create_image(handle, desc, &resource.name, first_use, last_use, frame_index)
                }
                RgResourceDesc::Buffer(desc) => {
                    self.pool.create_buffer(handle, desc, &resource.name, first_use, last_use, frame_index)
                }
            };
            let Some(created) = created else {
                continue;
            };
            physical.insert(handle, created.physical);

            // GPU 上前一个占用者的访问可能还没结束，第一次使用前要等待它
            let previous_state = created
                .previous_occupant
                .and_then(|previous| self.usage_table.get(previous))
                .and_then(|timeline| RgBarrierGenerator::last_access_state(timeline));
            if let Some(state) = previous_state {
                aliased.insert(handle, state);
            }
        }

        RgFrameResources {
            physical,
            fresh,
            aliased,
        }
    }

    /// 返回持久资源的物理资源，以及它是否为本次新建
    fn ensure_persistent_backing(
        device: &dyn RgDevice,
        persistent: &mut HashMap<String, RgPersistentBacking>,
        resource: &RgLogicalResource,
    ) -> Option<(RgPhysicalResource, bool)> {
        if let Some(backing) = persistent.get(&resource.name) {
            if backing.desc == resource.desc {
                return Some((backing.physical, false));
            }
            if let Some(stale) = persistent.remove(&resource.name) {
                Self::destroy_backing(device, stale);
            }
        }

        match Self::create_backing(device, &resource.name, &resource.desc) {
            Ok(backing) => {
                log::debug!("RenderGraph: created persistent resource \"{}\"", resource.name);
                let created = backing.physical;
                persistent.insert(resource.name.clone(), backing);
                Some((created, true))
            }
            Err(err) => {
                log::error!("RenderGraph: failed to create persistent resource \"{}\": {:#}", resource.name, err);
                None
            }
        }
    }

    fn create_backing(device: &dyn RgDevice, name: &str, desc: &RgResourceDesc) -> anyhow::Result<RgPersistentBacking> {
        let requirements = match desc {
            RgResourceDesc::Image(desc) => device.image_memory_requirements(desc),
            RgResourceDesc::Buffer(desc) => device.buffer_memory_requirements(desc),
        };
        let memory = device.allocate_memory(&requirements, name)?;

        let physical = match desc {
            RgResourceDesc::Image(desc) => {
                device.create_aliased_image(memory, desc, name).map(|(image, view)| RgPhysicalResource::Image { image, view })
            }
            RgResourceDesc::Buffer(desc) => {
                device.create_aliased_buffer(memory, desc, name).map(|buffer| RgPhysicalResource::Buffer { buffer })
            }
        };
        match physical {
            Ok(physical) => Ok(RgPersistentBacking {
                desc: desc.clone(),
                physical,
                memory,
            }),
            Err(err) => {
                device.free_memory(memory);
                Err(err)
            }
        }
    }

    fn destroy_backing(device: &dyn RgDevice, backing: RgPersistentBacking) {
        device.destroy_physical(backing.physical);
        device.free_memory(backing.memory);
    }

    /// 把 barrier 描述解析为物理句柄并录制
    ///
    /// 物理资源缺失的 barrier 被跳过；持久资源本帧新建时，第一个 barrier 丢弃旧内容；
    /// 瞬态资源复用了别的资源的显存时，第一个 barrier 等待前一个占用者。
    fn record_barriers(
        device: &dyn RgDevice,
        cmd: vk::CommandBuffer,
        barriers: &RgPassBarriers,
        frame: &RgFrameResources,
        observed: &mut SecondaryMap<RgResourceHandle, RgImageState>,
    ) {
        let physical = &frame.physical;
        if !barriers.has_barriers() {
            return;
        }

        let mut image_barriers = Vec::with_capacity(barriers.image_barrier_count());
        for desc in &barriers.image_barriers {
            let Some(image) = physical.get(desc.handle).and_then(|p| p.image()) else {
                continue;
            };
            let desc = if desc.from_previous_frame && frame.fresh.contains(&desc.handle) {
                desc.discarding()
            } else if desc.from_previous_frame && !desc.needs_barrier() {
                observed.insert(desc.handle, desc.dst_state);
                continue;
            } else if let (true, Some(previous)) = (desc.aliased_entry, frame.aliased.get(desc.handle)) {
                desc.after_alias(*previous)
            } else {
                desc.clone()
            };
            image_barriers.push(desc.to_vk_barrier(image));
            observed.insert(desc.handle, desc.dst_state);
        }

        let mut buffer_barriers = Vec::with_capacity(barriers.buffer_barrier_count());
        for desc in &barriers.buffer_barriers {
            let Some(buffer) = physical.get(desc.handle).and_then(|p| p.buffer()) else {
                continue;
            };
            let desc = match (desc.aliased_entry, frame.aliased.get(desc.handle)) {
                (true, Some(previous)) => desc.after_alias(previous.buffer_state()),
                // 独占显存块的 buffer 没有需要等待的访问
                (true, None) => continue,
                _ => desc.clone(),
            };
            // buffer 没有 layout，两侧都只读时不需要同步
            if !desc.needs_barrier() {
                continue;
            }
            buffer_barriers.push(desc.to_vk_barrier(buffer));
            observed.insert(desc.handle, desc.dst_state.into());
        }

        if !image_barriers.is_empty() || !buffer_barriers.is_empty() {
            device.cmd_pipeline_barrier(cmd, &image_barriers, &buffer_barriers);
        }
    }
}

// getters
impl<'a> RenderGraph<'a> {
    #[inline]
    pub fn settings(&self) -> &RgSettings {
        &self.settings
    }

    #[inline]
    pub fn resources(&self) -> &RgResourceRegistry {
        &self.resources
    }

    #[inline]
    pub fn resource(&self, name: &str) -> Option<&RgLogicalResource> {
        self.resources.get_by_name(name)
    }

    #[inline]
    pub fn passes(&self) -> &[RgPassNode<'a>] {
        &self.passes
    }

    /// 按名字查找 Pass，重名时返回最先声明的
    pub fn pass(&self, name: &str) -> Option<&RgPassNode<'a>> {
        self.passes.iter().find(|p| p.name == name)
    }

    #[inline]
    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    pub fn compiled_pass_names(&self) -> Vec<&str> {
        self.execution_order.iter().map(|&i| self.passes[i].name.as_str()).collect()
    }

    /// 执行计划是否与当前声明一致
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.state == RgGraphState::Compiled
    }

    pub fn reachable_pass_count(&self) -> usize {
        self.passes.iter().filter(|p| p.reachable).count()
    }

    #[inline]
    pub fn dependency_graph(&self) -> Option<&DependencyGraph> {
        self.dep_graph.as_ref()
    }

    #[inline]
    pub fn pool(&self) -> &RgTransientPool {
        &self.pool
    }

    #[inline]
    pub fn persistent_resource_count(&self) -> usize {
        self.persistent.len()
    }

    /// 最近一次 execute 中资源对应的物理资源
    pub fn physical(&self, name: &str) -> Option<RgPhysicalResource> {
        self.resources.handle(name).and_then(|h| self.physical.get(h).copied())
    }

    /// 最近一次 execute 结束时资源所处的状态
    pub fn observed_state(&self, name: &str) -> Option<RgImageState> {
        self.resources.handle(name).and_then(|h| self.observed_states.get(h).copied())
    }
}

// debug
impl RenderGraph<'_> {
    /// 打印执行计划：每个 Pass 的资源访问和 pre / post barrier
    pub fn print_execution_plan(&self) {
        log::info!("╔══════════════════════════════════════════════════════════════════╗");
        log::info!("║              RenderGraph Execution Plan                          ║");
        log::info!("╠══════════════════════════════════════════════════════════════════╣");
        log::info!(
            "║ Passes: {} declared, {} scheduled  |  Resources: {}",
            self.passes.len(),
            self.execution_order.len(),
            self.resources.len()
        );
        log::info!("╚══════════════════════════════════════════════════════════════════╝");

        for (position, &pass_idx) in self.execution_order.iter().enumerate() {
            let pass = &self.passes[pass_idx];

            log::info!("");
            log::info!("┌─────────────────────────────────────────────────────────────────┐");
            log::info!(
                "│ [{}/{}] {} Pass: \"{}\"",
                position + 1,
                self.execution_order.len(),
                pass.kind.name(),
                pass.name
            );
            if !pass.dependencies.is_empty() {
                log::info!(
                    "│ Depends on: {}",
                    pass.dependencies.iter().map(|&d| format!("\"{}\"", self.passes[d].name)).join(", ")
                );
            }
            log::info!("├─────────────────────────────────────────────────────────────────┤");

            for handle in pass.touched_resources() {
                let Some(usage) =
                    self.usage_table.get(handle).and_then(|t| t.iter().find(|u| u.position == position))
                else {
                    continue;
                };
                let (first, last) = self.resources.get(handle).and_then(|r| r.lifetime()).unwrap_or_default();
                let icon = match (usage.is_read, usage.is_write) {
                    (true, true) => "🔁",
                    (false, true) => "✏️ ",
                    _ => "📖",
                };
                log::info!(
                    "│   {} \"{}\" as {:?} @ {:?} (stage: {}, access: {}) lifetime [{}, {}]",
                    icon,
                    self.resources.name(handle),
                    usage.usage,
                    usage.state.layout,
                    Self::format_pipeline_stage(usage.state.stage),
                    Self::format_access_flags(usage.state.access),
                    first,
                    last
                );
            }

            self.print_barriers("Pre-barriers", &pass.pre_barriers);
            if pass.post_barriers.has_barriers() {
                self.print_barriers("Post-barriers", &pass.post_barriers);
            }
            log::info!("└─────────────────────────────────────────────────────────────────┘");
        }

        let pruned = self.passes.iter().filter(|p| !p.reachable).map(|p| p.name.as_str()).collect_vec();
        if !pruned.is_empty() {
            log::info!("");
            log::info!("Pruned: {}", pruned.join(", "));
        }
        log::info!("");
        log::info!("═══════════════════════ End of Execution Plan ═══════════════════════");
    }

    fn print_barriers(&self, title: &str, barriers: &RgPassBarriers) {
        log::info!("├─────────────────────────────────────────────────────────────────┤");
        if !barriers.has_barriers() {
            log::info!("│ {}: none", title);
            return;
        }
        log::info!(
            "│ {}: {} image, {} buffer",
            title,
            barriers.image_barrier_count(),
            barriers.buffer_barrier_count()
        );

        for barrier in &barriers.image_barriers {
            let layout_change = if barrier.src_state.layout != barrier.dst_state.layout {
                format!("{:?} → {:?}", barrier.src_state.layout, barrier.dst_state.layout)
            } else {
                format!("{:?} (no layout change)", barrier.src_state.layout)
            };
            log::info!(
                "│   🔒 Image \"{}\"{}",
                self.resources.name(barrier.handle),
                if barrier.from_previous_frame { " (from previous frame)" } else { "" }
            );
            log::info!("│       Layout: {}", layout_change);
            log::info!(
                "│       Stage:  {} → {}",
                Self::format_pipeline_stage(barrier.src_state.stage),
                Self::format_pipeline_stage(barrier.dst_state.stage)
            );
            log::info!(
                "│       Access: {} → {}",
                Self::format_access_flags(barrier.src_state.src_access()),
                Self::format_access_flags(barrier.dst_state.access)
            );
        }

        for barrier in &barriers.buffer_barriers {
            log::info!("│   🔒 Buffer \"{}\"", self.resources.name(barrier.handle));
            log::info!(
                "│       Stage:  {} → {}",
                Self::format_pipeline_stage(barrier.src_state.stage),
                Self::format_pipeline_stage(barrier.dst_state.stage)
            );
            log::info!(
                "│       Access: {} → {}",
                Self::format_access_flags(barrier.src_state.access),
                Self::format_access_flags(barrier.dst_state.access)
            );
        }
    }

    fn format_pipeline_stage(stage: vk::PipelineStageFlags2) -> String {
        const STAGES: &[(vk::PipelineStageFlags2, &str)] = &[
            (vk::PipelineStageFlags2::TOP_OF_PIPE, "TOP_OF_PIPE"),
            (vk::PipelineStageFlags2::DRAW_INDIRECT, "DRAW_INDIRECT"),
            (vk::PipelineStageFlags2::VERTEX_INPUT, "VERTEX_INPUT"),
            (vk::PipelineStageFlags2::VERTEX_SHADER, "VERTEX_SHADER"),
            (vk::PipelineStageFlags2::FRAGMENT_SHADER, "FRAGMENT_SHADER"),
            (vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS, "EARLY_FRAGMENT_TESTS"),
            (vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS, "LATE_FRAGMENT_TESTS"),
            (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, "COLOR_ATTACHMENT_OUTPUT"),
            (vk::PipelineStageFlags2::COMPUTE_SHADER, "COMPUTE_SHADER"),
            (vk::PipelineStageFlags2::TRANSFER, "TRANSFER"),
            (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, "BOTTOM_OF_PIPE"),
            (vk::PipelineStageFlags2::HOST, "HOST"),
            (vk::PipelineStageFlags2::ALL_GRAPHICS, "ALL_GRAPHICS"),
            (vk::PipelineStageFlags2::ALL_COMMANDS, "ALL_COMMANDS"),
        ];
        if stage == vk::PipelineStageFlags2::NONE {
            return "NONE".to_string();
        }
        let names = STAGES.iter().filter(|(flag, _)| stage.contains(*flag)).map(|(_, name)| *name).collect_vec();
        if names.is_empty() { format!("{:?}", stage) } else { names.join(" | ") }
    }

    fn format_access_flags(access: vk::AccessFlags2) -> String {
        const ACCESSES: &[(vk::AccessFlags2, &str)] = &[
            (vk::AccessFlags2::INDIRECT_COMMAND_READ, "INDIRECT_CMD_READ"),
            (vk::AccessFlags2::INDEX_READ, "INDEX_READ"),
            (vk::AccessFlags2::VERTEX_ATTRIBUTE_READ, "VERTEX_ATTR_READ"),
            (vk::AccessFlags2::UNIFORM_READ, "UNIFORM_READ"),
            (vk::AccessFlags2::SHADER_SAMPLED_READ, "SHADER_SAMPLED_READ"),
            (vk::AccessFlags2::SHADER_STORAGE_READ, "STORAGE_READ"),
            (vk::AccessFlags2::SHADER_STORAGE_WRITE, "STORAGE_WRITE"),
            (vk::AccessFlags2::COLOR_ATTACHMENT_READ, "COLOR_ATTACH_READ"),
            (vk::AccessFlags2::COLOR_ATTACHMENT_WRITE, "COLOR_ATTACH_WRITE"),
            (vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ, "DEPTH_ATTACH_READ"),
            (vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE, "DEPTH_ATTACH_WRITE"),
            (vk::AccessFlags2::TRANSFER_READ, "TRANSFER_READ"),
            (vk::AccessFlags2::TRANSFER_WRITE, "TRANSFER_WRITE"),
            (vk::AccessFlags2::HOST_WRITE, "HOST_WRITE"),
            (vk::AccessFlags2::MEMORY_READ, "MEMORY_READ"),
            (vk::AccessFlags2::MEMORY_WRITE, "MEMORY_WRITE"),
        ];
        if access == vk::AccessFlags2::NONE {
            return "NONE".to_string();
        }
        let names = ACCESSES.iter().filter(|(flag, _)| access.contains(*flag)).map(|(_, name)| *name).collect_vec();
        if names.is_empty() { format!("{:?}", access) } else { names.join(" | ") }
    }
}

impl Drop for RenderGraph<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use ash::vk::Handle;

    use super::*;
    use crate::render_graph::dummy_device::RgDummyDevice;
    use crate::render_graph::resource_state::RgResourceUsage;

    const WIDTH: u32 = 128;
    const HEIGHT: u32 = 128;

    fn color_desc() -> RgImageDesc {
        RgImageDesc::new_2d(
            WIDTH,
            HEIGHT,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )
    }

    fn swapchain_image() -> vk::Image {
        vk::Image::from_raw(0x5C00)
    }

    fn import_swapchain(graph: &mut RenderGraph<'_>) -> RgResourceHandle {
        graph.import_image(
            "swapchain",
            swapchain_image(),
            vk::ImageView::from_raw(0x5C01),
            RgImageDesc::new_2d(WIDTH, HEIGHT, vk::Format::B8G8R8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT),
            RgImageState::PRESENT,
            RgImageState::PRESENT,
        )
    }

    fn log_execution<'a>(builder: &mut RgPassBuilder<'_, 'a>, log: &'a RefCell<Vec<String>>) {
        builder.execute(move |ctx| log.borrow_mut().push(ctx.pass_name.to_string()));
    }

    fn depth_desc() -> RgImageDesc {
        RgImageDesc::new_2d(
            WIDTH,
            HEIGHT,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )
    }

    /// GBuffer → Lighting → PostFX → Present，外加一个没有消费者的 Debug Pass
    fn build_deferred<'a>(graph: &mut RenderGraph<'a>, log: &'a RefCell<Vec<String>>) {
        import_swapchain(graph);
        graph.create_image("gbuffer_albedo", color_desc(), false);
        graph.create_image("gbuffer_normal", color_desc(), false);
        graph.create_image("depth", depth_desc(), false);
        graph.create_image("lighting", color_desc(), false);
        graph.create_image("post", color_desc(), false);
        graph.create_image("debug_view", color_desc(), false);

        graph.add_pass("GBuffer", |builder| {
            builder.write("gbuffer_albedo", RgResourceUsage::ColorAttachment);
            builder.write("gbuffer_normal", RgResourceUsage::ColorAttachment);
            builder.write("depth", RgResourceUsage::DepthAttachment);
            log_execution(builder, log);
        });
        graph.add_pass("Lighting", |builder| {
            builder.read("gbuffer_albedo", RgResourceUsage::ShaderRead);
            builder.read("gbuffer_normal", RgResourceUsage::ShaderRead);
            builder.read("depth", RgResourceUsage::ShaderRead);
            builder.write("lighting", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
        graph.add_pass("Debug", |builder| {
            builder.read("gbuffer_normal", RgResourceUsage::ShaderRead);
            builder.write("debug_view", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
        graph.add_pass("PostFX", |builder| {
            builder.read("lighting", RgResourceUsage::ShaderRead);
            builder.write("post", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
        graph.add_pass("Present", |builder| {
            builder.read("post", RgResourceUsage::ShaderRead);
            builder.write("swapchain", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
    }

    fn image_memory(device: &RgDummyDevice, graph: &RenderGraph<'_>, name: &str) -> RgMemoryHandle {
        device.image_memory(graph.physical(name).unwrap().image().unwrap()).unwrap()
    }

    #[test]
    fn test_deferred_pipeline() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_deferred(&mut graph, &log);

        graph.build();
        assert_eq!(graph.reachable_pass_count(), 4);
        assert!(!graph.pass("Debug").unwrap().reachable());
        assert_eq!(graph.pass("Lighting").unwrap().dependencies(), &[0]);
        assert_eq!(graph.pass("PostFX").unwrap().dependencies(), &[1]);
        assert_eq!(graph.pass("Present").unwrap().dependencies(), &[3]);

        graph.compile();
        assert_eq!(graph.compiled_pass_names(), vec!["GBuffer", "Lighting", "PostFX", "Present"]);
        assert_eq!(graph.resource("gbuffer_albedo").unwrap().lifetime(), Some((0, 1)));
        assert_eq!(graph.resource("post").unwrap().lifetime(), Some((2, 3)));
        assert_eq!(graph.resource("debug_view").unwrap().lifetime(), None);

        let swapchain = graph.resources().handle("swapchain").unwrap();
        let present = graph.pass("Present").unwrap();
        let pre = present.pre_barriers().image_barrier(swapchain).unwrap();
        assert_eq!(pre.src_state.layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(pre.dst_state.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let post = present.post_barriers().image_barrier(swapchain).unwrap();
        assert_eq!(post.dst_state, RgImageState::PRESENT);

        for frame in 0..4 {
            graph.execute(vk::CommandBuffer::null(), frame % 3);
            assert_eq!(graph.observed_state("swapchain"), Some(RgImageState::PRESENT));
        }

        assert_eq!(log.borrow().len(), 16);
        assert!(!log.borrow().iter().any(|name| name == "Debug"));
        assert_eq!(&log.borrow()[..4], &["GBuffer", "Lighting", "PostFX", "Present"]);
        assert_eq!(device.recorded_labels().len(), 16);
    }

    #[test]
    fn test_transient_aliasing() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_deferred(&mut graph, &log);
        graph.compile();

        graph.execute(vk::CommandBuffer::null(), 0);
        let albedo = image_memory(&device, &graph, "gbuffer_albedo");
        let normal = image_memory(&device, &graph, "gbuffer_normal");
        let lighting = image_memory(&device, &graph, "lighting");
        let post = image_memory(&device, &graph, "post");

        // 生命周期重叠的资源必须使用不同的显存
        assert_ne!(albedo, normal);
        assert_ne!(lighting, albedo);
        assert_ne!(lighting, normal);
        assert_ne!(post, lighting);
        // post 在 GBuffer 结果不再使用之后才开始
        assert!(post == albedo || post == normal);
        assert_eq!(graph.pool().block_count(), 4);

        graph.execute(vk::CommandBuffer::null(), 1);
        graph.execute(vk::CommandBuffer::null(), 2);
        assert_eq!(graph.pool().block_count(), 12);

        // 回到帧 0：复用原来的块，不再分配
        graph.execute(vk::CommandBuffer::null(), 0);
        assert_eq!(device.total_allocations(), 12);
        assert_eq!(device.live_image_count(), 15);
    }

    #[test]
    fn test_depth_read_after_attachment_write() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_deferred(&mut graph, &log);
        graph.compile();

        let depth = graph.resources().handle("depth").unwrap();
        assert_eq!(graph.resource("depth").unwrap().lifetime(), Some((0, 1)));
        let barrier = graph.pass("Lighting").unwrap().pre_barriers().image_barrier(depth).unwrap();
        assert_eq!(barrier.src_state.layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.dst_state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(barrier.src_state.access.contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(barrier.dst_state.stage.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));

        graph.execute(vk::CommandBuffer::null(), 0);
        let depth_image = graph.physical("depth").unwrap().image().unwrap();
        let recorded = device.recorded_image_barriers().into_iter().filter(|b| b.image == depth_image).collect_vec();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].new_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(recorded[1].old_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(recorded[1].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // 深度与颜色的显存类型不兼容，不会共享显存块
        let depth_memory = image_memory(&device, &graph, "depth");
        for name in ["gbuffer_albedo", "gbuffer_normal", "lighting", "post"] {
            assert_ne!(image_memory(&device, &graph, name), depth_memory, "{name}");
        }
    }

    /// A 写 x、w、z；B（graphics）读 x、w 写 b；C（compute）读 z 写 y；D 读 b、y 写 swapchain
    fn build_alias_chain<'a>(graph: &mut RenderGraph<'a>, log: &'a RefCell<Vec<String>>) {
        import_swapchain(graph);
        for name in ["x", "w", "z", "b"] {
            graph.create_image(name, color_desc(), false);
        }
        graph.create_image("y", color_desc().with_usage(vk::ImageUsageFlags::STORAGE), false);

        graph.add_pass("A", |builder| {
            builder.write("x", RgResourceUsage::ColorAttachment);
            builder.write("w", RgResourceUsage::ColorAttachment);
            builder.write("z", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
        graph.add_pass("B", |builder| {
            builder.read("x", RgResourceUsage::ShaderRead);
            builder.read("w", RgResourceUsage::ShaderRead);
            builder.write("b", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
        graph.add_compute_pass("C", |builder| {
            builder.read("z", RgResourceUsage::ShaderRead);
            builder.write("y", RgResourceUsage::ShaderWrite);
            log_execution(builder, log);
        });
        graph.add_pass("D", |builder| {
            builder.read("b", RgResourceUsage::ShaderRead);
            builder.read("y", RgResourceUsage::ShaderRead);
            builder.write("swapchain", RgResourceUsage::ColorAttachment);
            log_execution(builder, log);
        });
    }

    #[test]
    fn test_aliased_image_waits_for_previous_occupant() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_alias_chain(&mut graph, &log);
        graph.compile();
        assert_eq!(graph.compiled_pass_names(), vec!["A", "B", "C", "D"]);

        graph.execute(vk::CommandBuffer::null(), 0);
        let y = image_memory(&device, &graph, "y");
        assert!(y == image_memory(&device, &graph, "x") || y == image_memory(&device, &graph, "w"));

        // y 的第一次写入必须等 B 在 fragment shader 中读完同一块显存
        let y_image = graph.physical("y").unwrap().image().unwrap();
        let first = device.recorded_image_barriers().into_iter().find(|b| b.image == y_image).unwrap();
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);
        assert!(first.src_stage.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert!(first.dst_stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));

        // 独占显存块的资源仍从 TOP_OF_PIPE 开始
        let z_image = graph.physical("z").unwrap().image().unwrap();
        let z_first = device.recorded_image_barriers().into_iter().find(|b| b.image == z_image).unwrap();
        assert_eq!(z_first.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
    }

    #[test]
    fn test_aliased_buffer_waits_for_previous_occupant() {
        let device = Rc::new(RgDummyDevice::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        import_swapchain(&mut graph);
        for name in ["p", "q", "r"] {
            graph.create_buffer(name, RgBufferDesc::new(4096, vk::BufferUsageFlags::STORAGE_BUFFER), false);
        }
        graph.add_compute_pass("Seed", |builder| {
            builder.write("p", RgResourceUsage::ShaderWrite);
        });
        graph.add_compute_pass("Expand", |builder| {
            builder.read("p", RgResourceUsage::ShaderRead);
            builder.write("q", RgResourceUsage::ShaderWrite);
        });
        graph.add_compute_pass("Resolve", |builder| {
            builder.read("q", RgResourceUsage::ShaderRead);
            builder.write("r", RgResourceUsage::ShaderWrite);
        });
        graph.add_pass("Present", |builder| {
            builder.read("r", RgResourceUsage::ShaderRead);
            builder.write("swapchain", RgResourceUsage::ColorAttachment);
        });

        graph.execute(vk::CommandBuffer::null(), 0);
        let buffer = |name: &str| graph.physical(name).unwrap().buffer().unwrap();
        assert_eq!(device.buffer_memory(buffer("r")), device.buffer_memory(buffer("p")));
        assert_ne!(device.buffer_memory(buffer("q")), device.buffer_memory(buffer("p")));

        // r 复用 p 的显存：写入前等待 Expand 对 p 的读取
        let barriers = device.recorded_buffer_barriers();
        let r_entry = barriers.iter().find(|b| b.buffer == buffer("r")).unwrap();
        assert!(r_entry.src_stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert!(r_entry.dst_access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));

        // p 独占显存块，第一次写入前没有需要等待的访问
        assert!(!barriers.iter().any(|b| b.buffer == buffer("p") && b.dst_access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE)));
    }

    #[test]
    fn test_update_imported_image_between_frames() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_deferred(&mut graph, &log);
        graph.compile();

        graph.execute(vk::CommandBuffer::null(), 0);
        assert!(device.recorded_image_barriers().iter().any(|b| b.image == swapchain_image()));

        let next_image = vk::Image::from_raw(0x6C00);
        assert!(graph.update_imported_image("swapchain", next_image, vk::ImageView::from_raw(0x6C01)));
        assert!(graph.is_compiled());

        device.take_commands();
        graph.execute(vk::CommandBuffer::null(), 1);
        let barriers = device.recorded_image_barriers();
        assert_eq!(barriers.iter().filter(|b| b.image == next_image).count(), 2);
        assert!(!barriers.iter().any(|b| b.image == swapchain_image()));
        assert_eq!(graph.physical("swapchain").unwrap().image(), Some(next_image));
        assert_eq!(graph.observed_state("swapchain"), Some(RgImageState::PRESENT));

        assert!(!graph.update_imported_image("post", next_image, vk::ImageView::null()));
        assert!(!graph.update_imported_buffer("swapchain", vk::Buffer::from_raw(0x7000)));
    }

    #[test]
    fn test_aliasing_disabled() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let settings = RgSettings {
            enable_aliasing: false,
            ..Default::default()
        };
        let mut graph = RenderGraph::new(device.clone(), settings);
        build_deferred(&mut graph, &log);
        graph.execute(vk::CommandBuffer::null(), 0);
        assert_eq!(graph.pool().block_count(), 5);
    }

    #[test]
    fn test_frame_index_out_of_range() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        build_deferred(&mut graph, &log);
        graph.compile();

        graph.execute(vk::CommandBuffer::null(), 3);
        assert!(log.borrow().is_empty());
        assert!(device.take_commands().is_empty());
        assert_eq!(graph.pool().block_count(), 0);
    }

    #[test]
    fn test_configuration_errors_are_ignored() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());

        let null = graph.import_image(
            "null_import",
            vk::Image::null(),
            vk::ImageView::null(),
            color_desc(),
            RgImageState::UNDEFINED,
            RgImageState::SHADER_READ_FRAGMENT,
        );
        assert_eq!(null, RgResourceHandle::default());
        assert!(graph.resource("null_import").is_none());

        import_swapchain(&mut graph);
        assert_eq!(import_swapchain(&mut graph), RgResourceHandle::default());

        graph.add_pass("Blit", |builder| {
            assert_eq!(builder.read("missing", RgResourceUsage::ShaderRead), RgResourceHandle::default());
            assert_eq!(builder.read("swapchain", RgResourceUsage::Present), RgResourceHandle::default());
            assert_eq!(builder.write("swapchain", RgResourceUsage::VertexBuffer), RgResourceHandle::default());
            builder.write("swapchain", RgResourceUsage::ColorAttachment);
            log_execution(builder, &log);
        });
        assert!(!graph.mark_output("missing"));

        graph.execute(vk::CommandBuffer::null(), 0);
        assert_eq!(graph.pass("Blit").unwrap().accesses.len(), 1);
        assert_eq!(*log.borrow(), vec!["Blit".to_string()]);
        assert_eq!(graph.observed_state("swapchain"), Some(RgImageState::PRESENT));
    }

    #[test]
    fn test_exhaustion_skips_dependent_passes() {
        let device = Rc::new(RgDummyDevice::with_memory_budget(1024 * 1024));
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());

        import_swapchain(&mut graph);
        graph.create_image("small", RgImageDesc::new_2d(64, 64, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::STORAGE), false);
        graph.create_image("huge", RgImageDesc::new_2d(4096, 4096, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::STORAGE), false);

        graph.add_compute_pass("Small", |builder| {
            builder.write("small", RgResourceUsage::ShaderWrite);
            log_execution(builder, &log);
        });
        graph.add_compute_pass("Huge", |builder| {
            builder.read("small", RgResourceUsage::ShaderRead);
            builder.write("huge", RgResourceUsage::ShaderWrite);
            log_execution(builder, &log);
        });
        graph.add_pass("Present", |builder| {
            builder.read("huge", RgResourceUsage::ShaderRead);
            builder.write("swapchain", RgResourceUsage::ColorAttachment);
            log_execution(builder, &log);
        });

        graph.execute(vk::CommandBuffer::null(), 0);
        assert_eq!(*log.borrow(), vec!["Small".to_string()]);
        assert!(graph.physical("small").is_some());
        assert!(graph.physical("huge").is_none());
        assert_eq!(device.recorded_labels(), vec!["Small".to_string()]);
    }

    #[test]
    fn test_persistent_resource_survives_rebuild() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());

        let declare = |graph: &mut RenderGraph<'_>| {
            import_swapchain(graph);
            graph.create_image("history", color_desc().with_usage(vk::ImageUsageFlags::STORAGE), true);
            graph.add_compute_pass("Accumulate", |builder| {
                builder.read_write("history", RgResourceUsage::ShaderWrite);
            });
            graph.add_pass("Present", |builder| {
                builder.read("history", RgResourceUsage::ShaderRead);
                builder.write("swapchain", RgResourceUsage::ColorAttachment);
            });
        };
        declare(&mut graph);
        graph.compile();

        let history_barrier = |device: &RgDummyDevice, image: vk::Image| {
            device.recorded_image_barriers().into_iter().find(|b| b.image == image).unwrap()
        };

        // 第一帧：物理资源刚创建，内容被丢弃
        graph.execute(vk::CommandBuffer::null(), 0);
        let history = graph.physical("history").unwrap().image().unwrap();
        let first = history_barrier(&device, history);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);

        // 之后的帧：从上一帧最后一次使用的 layout 转换
        device.take_commands();
        graph.execute(vk::CommandBuffer::null(), 1);
        let second = history_barrier(&device, history);
        assert_eq!(second.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(graph.observed_state("history").unwrap().layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // 重建后物理资源不变
        let allocations = device.total_allocations();
        graph.clear();
        declare(&mut graph);
        graph.compile();
        device.take_commands();
        graph.execute(vk::CommandBuffer::null(), 2);
        assert_eq!(graph.physical("history").unwrap().image(), Some(history));
        assert_eq!(device.total_allocations(), allocations);
        assert_eq!(history_barrier(&device, history).old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // 不再声明时在下一次 compile 释放
        graph.clear();
        import_swapchain(&mut graph);
        graph.add_pass("Clear", |builder| {
            builder.write("swapchain", RgResourceUsage::TransferDst);
            log_execution(builder, &log);
        });
        assert_eq!(graph.persistent_resource_count(), 1);
        graph.compile();
        assert_eq!(graph.persistent_resource_count(), 0);
        assert_eq!(device.image_memory(history), None);
    }

    #[test]
    fn test_rg_pass_trait() {
        struct FillPass<'l> {
            log: &'l RefCell<Vec<String>>,
        }

        impl RgPass for FillPass<'_> {
            fn setup(&mut self, builder: &mut RgPassBuilder<'_, '_>) {
                builder.write("swapchain", RgResourceUsage::TransferDst);
            }

            fn execute(&mut self, ctx: &RgPassContext<'_>) {
                assert_eq!(ctx.image("swapchain"), Some(swapchain_image()));
                assert_eq!(*ctx.pass_kind, RgPassKind::Transfer);
                self.log.borrow_mut().push(ctx.pass_name.to_string());
            }
        }

        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
        import_swapchain(&mut graph);
        graph.add_rg_pass("Fill", RgPassKind::Transfer, FillPass { log: &log });

        graph.execute(vk::CommandBuffer::null(), 0);
        assert_eq!(*log.borrow(), vec!["Fill".to_string()]);

        let barriers = device.recorded_image_barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[1].new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(graph.observed_state("swapchain"), Some(RgImageState::PRESENT));
    }

    #[test]
    fn test_debug_labels_disabled() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        let settings = RgSettings {
            debug_labels: false,
            ..Default::default()
        };
        let mut graph = RenderGraph::new(device.clone(), settings);
        build_deferred(&mut graph, &log);
        graph.execute(vk::CommandBuffer::null(), 0);

        assert_eq!(log.borrow().len(), 4);
        assert!(device.recorded_labels().is_empty());
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let device = Rc::new(RgDummyDevice::new());
        let log = RefCell::new(Vec::new());
        {
            let mut graph = RenderGraph::new(device.clone(), RgSettings::default());
            build_deferred(&mut graph, &log);
            graph.create_image("persistent", color_desc(), true);
            graph.add_compute_pass("Touch", |builder| {
                builder.write("persistent", RgResourceUsage::ShaderWrite);
            });
            graph.mark_output("persistent");
            graph.execute(vk::CommandBuffer::null(), 0);
            graph.execute(vk::CommandBuffer::null(), 1);
            assert!(device.allocation_count() > 0);
        }
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.live_image_count(), 0);
    }
}
