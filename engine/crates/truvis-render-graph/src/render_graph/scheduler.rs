//! Pass 调度
//!
//! 贪心的列表调度：维护一个就绪队列（依赖均已调度的 Pass），每一步按局部性启发式挑选一个。
//! 结果只保证依赖顺序正确，不保证全局最优；复杂度 O(P² · R)，每帧 Pass 数量在几十量级，可以接受。

use std::cmp::Reverse;
use std::collections::VecDeque;

use ash::vk;
use itertools::Itertools;
use slotmap::SecondaryMap;

use crate::render_graph::graph::DependencyGraph;
use crate::render_graph::pass::RgPassNode;
use crate::render_graph::resource::RgResourceKind;
use crate::render_graph::resource_handle::RgResourceHandle;
use crate::render_graph::resource_registry::RgResourceRegistry;

pub struct RgScheduler;

impl RgScheduler {
    /// 为可达 Pass 生成执行顺序
    ///
    /// 就绪队列中的候选按以下优先级比较：
    /// 1. 与上一个已调度 Pass 共享的资源数，越多越好
    /// 2. 相对模拟的当前 layout 需要的 image layout 转换数，越少越好
    /// 3. 到最近一个访问外部资源的 Pass 的距离，越近越好
    /// 4. 声明顺序
    pub fn schedule(
        passes: &[RgPassNode<'_>],
        graph: &DependencyGraph,
        reachable: &[bool],
        resources: &RgResourceRegistry,
    ) -> Vec<usize> {
        let reachable_count = reachable.iter().filter(|r| **r).count();
        let external_distance = Self::external_distance(passes, graph, reachable, resources);

        let mut remaining_deps = (0..passes.len())
            .map(|i| graph.get_predecessors(i).iter().filter(|&&p| reachable[p]).count())
            .collect_vec();
        let mut ready = (0..passes.len()).filter(|&i| reachable[i] && remaining_deps[i] == 0).collect_vec();

        // 模拟执行过程中每个 image 的 layout
        let mut layouts: SecondaryMap<RgResourceHandle, vk::ImageLayout> = SecondaryMap::new();
        for (handle, resource) in resources.iter() {
            let layout = resource.constraints().map(|c| c.initial.layout).unwrap_or(vk::ImageLayout::UNDEFINED);
            layouts.insert(handle, layout);
        }

        let mut order = Vec::with_capacity(reachable_count);
        let mut previous: Option<usize> = None;

        loop {
            let Some((slot, &next)) = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, candidate)| {
                    let candidate = **candidate;
                    let shared = previous.map(|prev| Self::shared_resource_count(&passes[prev], &passes[candidate]));
                    (
                        Reverse(shared.unwrap_or(0)),
                        Self::layout_transition_count(&passes[candidate], resources, &layouts),
                        external_distance[candidate],
                        candidate,
                    )
                })
            else {
                break;
            };
            ready.swap_remove(slot);

            for access in &passes[next].accesses {
                if let Some(layout) = Self::required_layout(&passes[next], access.resource, resources) {
                    layouts.insert(access.resource, layout);
                }
            }

            for &succ in graph.get_successors(next) {
                if !reachable[succ] {
                    continue;
                }
                remaining_deps[succ] -= 1;
                if remaining_deps[succ] == 0 {
                    ready.push(succ);
                }
            }

            order.push(next);
            previous = Some(next);
        }

        if order.len() != reachable_count {
            // 边只指向后声明的 Pass，正常情况下不会出现
            log::error!(
                "RenderGraph: scheduler stalled after {} of {} passes, appending the rest in declaration order",
                order.len(),
                reachable_count
            );
            let scheduled = order.clone();
            order.extend((0..passes.len()).filter(|i| reachable[*i] && !scheduled.contains(i)));
        }

        order
    }

    fn shared_resource_count(a: &RgPassNode<'_>, b: &RgPassNode<'_>) -> usize {
        a.touched_resources().filter(|&handle| b.touches(handle)).count()
    }

    fn layout_transition_count(
        pass: &RgPassNode<'_>,
        resources: &RgResourceRegistry,
        layouts: &SecondaryMap<RgResourceHandle, vk::ImageLayout>,
    ) -> usize {
        pass.touched_resources()
            .filter(|&handle| {
                Self::required_layout(pass, handle, resources)
                    .is_some_and(|layout| layouts.get(handle).copied() != Some(layout))
            })
            .count()
    }

    /// Pass 对某个 image 要求的 layout；buffer 返回 `None`
    fn required_layout(
        pass: &RgPassNode<'_>,
        handle: RgResourceHandle,
        resources: &RgResourceRegistry,
    ) -> Option<vk::ImageLayout> {
        let resource = resources.get(handle)?;
        if resource.kind() != RgResourceKind::Image {
            return None;
        }
        let read = pass.accesses.iter().any(|a| a.resource == handle && !a.is_write);
        let write = pass.accesses.iter().any(|a| a.resource == handle && a.is_write);
        let usage = pass.accesses.iter().find(|a| a.resource == handle)?.usage;
        Some(usage.resolve(&pass.kind, RgResourceKind::Image, read, write).layout)
    }

    /// 每个 Pass 沿依赖边向后到达最近一个访问外部资源的 Pass 的跳数
    fn external_distance(
        passes: &[RgPassNode<'_>],
        graph: &DependencyGraph,
        reachable: &[bool],
        resources: &RgResourceRegistry,
    ) -> Vec<usize> {
        let mut distance = vec![usize::MAX; passes.len()];
        let mut queue = VecDeque::new();

        for (i, pass) in passes.iter().enumerate() {
            let touches_external = pass.touched_resources().any(|h| resources.get(h).is_some_and(|r| r.is_external()));
            if reachable[i] && touches_external {
                distance[i] = 0;
                queue.push_back(i);
            }
        }

        while let Some(node) = queue.pop_front() {
            for &pred in graph.get_predecessors(node) {
                if distance[pred] == usize::MAX {
                    distance[pred] = distance[node] + 1;
                    queue.push_back(pred);
                }
            }
        }

        distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::graph::DependencyAnalyzer;
    use crate::render_graph::graph::tests::{import_swapchain, make_pass};

    fn schedule(passes: &[RgPassNode<'_>], registry: &RgResourceRegistry) -> Vec<usize> {
        let graph = DependencyAnalyzer::analyze(passes);
        let reachable = graph.mark_reachable(&DependencyAnalyzer::find_terminals(passes, registry));
        RgScheduler::schedule(passes, &graph, &reachable, registry)
    }

    fn position(order: &[usize], pass: usize) -> usize {
        order.iter().position(|&p| p == pass).unwrap()
    }

    #[test]
    fn test_diamond_order() {
        let mut registry = RgResourceRegistry::new();
        import_swapchain(&mut registry);
        let passes = vec![
            make_pass(&mut registry, "A", &[], &["a"]),
            make_pass(&mut registry, "B", &["a"], &["b"]),
            make_pass(&mut registry, "C", &["a"], &["c"]),
            make_pass(&mut registry, "D", &["b", "c"], &["d"]),
            make_pass(&mut registry, "Present", &["d"], &["swapchain"]),
        ];

        let order = schedule(&passes, &registry);
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], 0);
        assert!(position(&order, 3) > position(&order, 1));
        assert!(position(&order, 3) > position(&order, 2));
        assert_eq!(*order.last().unwrap(), 4);
    }

    #[test]
    fn test_unreachable_not_scheduled() {
        let mut registry = RgResourceRegistry::new();
        import_swapchain(&mut registry);
        let passes = vec![
            make_pass(&mut registry, "A", &[], &["a"]),
            make_pass(&mut registry, "Unused", &["a"], &["u"]),
            make_pass(&mut registry, "Present", &["a"], &["swapchain"]),
        ];

        assert_eq!(schedule(&passes, &registry), vec![0, 2]);
    }

    #[test]
    fn test_locality_prefers_consumer_of_previous_pass() {
        let mut registry = RgResourceRegistry::new();
        import_swapchain(&mut registry);
        // 两条互不相关的分支；Y2 与 Y 共享资源，应紧跟在 Y 之后，而不是按声明顺序先调度 X
        let passes = vec![
            make_pass(&mut registry, "Y", &[], &["y"]),
            make_pass(&mut registry, "X", &[], &["x"]),
            make_pass(&mut registry, "X2", &["x"], &["x2"]),
            make_pass(&mut registry, "Y2", &["y"], &["y2"]),
            make_pass(&mut registry, "Present", &["x2", "y2"], &["swapchain"]),
        ];

        let order = schedule(&passes, &registry);
        assert_eq!(order, vec![0, 3, 1, 2, 4]);
    }
}
