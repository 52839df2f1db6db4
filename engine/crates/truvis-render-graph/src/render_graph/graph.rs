//! 依赖图构建
//!
//! 从 Pass 的资源访问推导依赖边，从终结 Pass 反向遍历做可达性裁剪，
//! 并在调度完成后计算资源的生命周期。

use std::collections::VecDeque;

use slotmap::SecondaryMap;

use crate::render_graph::pass::RgPassNode;
use crate::render_graph::resource_handle::RgResourceHandle;
use crate::render_graph::resource_registry::RgResourceRegistry;

/// 依赖类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RgDependencyKind {
    /// 读取最近一次写入的结果
    ReadAfterWrite,
    /// 覆盖上一次写入
    WriteAfterWrite,
    /// 覆盖之前必须等待读取完成
    WriteAfterRead,
}

/// 依赖边：从 producer 到 consumer
#[derive(Clone, Debug)]
pub struct DependencyEdge {
    /// 先执行的 Pass
    pub producer: usize,
    /// 后执行的 Pass
    pub consumer: usize,
    pub resource: RgResourceHandle,
    pub kind: RgDependencyKind,
}

/// 依赖图
///
/// 节点是 Pass 的声明顺序索引。边总是从先声明的 Pass 指向后声明的 Pass，因此一定无环。
pub struct DependencyGraph {
    pass_count: usize,
    /// 出边邻接表
    adjacency: Vec<Vec<usize>>,
    /// 入边邻接表
    predecessors: Vec<Vec<usize>>,
    in_degrees: Vec<usize>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            adjacency: vec![Vec::new(); pass_count],
            predecessors: vec![Vec::new(); pass_count],
            in_degrees: vec![0; pass_count],
            edges: Vec::new(),
        }
    }

    /// 添加依赖边；自环被忽略，重复的 (producer, consumer) 只计一次入度
    pub fn add_edge(&mut self, producer: usize, consumer: usize, resource: RgResourceHandle, kind: RgDependencyKind) {
        if producer == consumer {
            return;
        }

        if !self.adjacency[producer].contains(&consumer) {
            self.adjacency[producer].push(consumer);
            self.predecessors[consumer].push(producer);
            self.in_degrees[consumer] += 1;
        }

        self.edges.push(DependencyEdge {
            producer,
            consumer,
            resource,
            kind,
        });
    }

    /// Kahn 拓扑排序
    ///
    /// # 返回
    /// - `Ok(order)`: 拓扑排序后的 Pass 索引列表
    /// - `Err(cycle)`: 检测到循环依赖，返回参与循环的 Pass 索引
    pub fn topological_sort(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degrees = self.in_degrees.clone();
        let mut queue: VecDeque<usize> = (0..self.pass_count).filter(|&i| in_degrees[i] == 0).collect();
        let mut result = Vec::with_capacity(self.pass_count);

        while let Some(node) = queue.pop_front() {
            result.push(node);

            for &neighbor in &self.adjacency[node] {
                in_degrees[neighbor] -= 1;
                if in_degrees[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        if result.len() != self.pass_count {
            Err((0..self.pass_count).filter(|&i| in_degrees[i] > 0).collect())
        } else {
            Ok(result)
        }
    }

    /// 从终结 Pass 出发沿入边反向遍历，标记所有祖先
    pub fn mark_reachable(&self, terminals: &[usize]) -> Vec<bool> {
        let mut reachable = vec![false; self.pass_count];
        let mut queue = VecDeque::new();

        for &terminal in terminals {
            if !reachable[terminal] {
                reachable[terminal] = true;
                queue.push_back(terminal);
            }
        }

        while let Some(node) = queue.pop_front() {
            for &pred in &self.predecessors[node] {
                if !reachable[pred] {
                    reachable[pred] = true;
                    queue.push_back(pred);
                }
            }
        }

        reachable
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.pass_count
    }

    /// Pass 的直接前驱
    #[inline]
    pub fn get_predecessors(&self, pass_index: usize) -> &[usize] {
        &self.predecessors[pass_index]
    }

    /// Pass 的直接后继
    #[inline]
    pub fn get_successors(&self, pass_index: usize) -> &[usize] {
        &self.adjacency[pass_index]
    }

    #[inline]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }
}

/// 依赖分析器
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    /// 按声明顺序扫描所有 Pass 的资源访问，构建依赖图
    ///
    /// 规则：
    /// - 读：依赖该资源最近一次的写入者（RAW）
    /// - 写：依赖上一次的写入者（WAW），以及上一次写入之后的所有读取者（WAR）
    pub fn analyze(passes: &[RgPassNode<'_>]) -> DependencyGraph {
        let mut graph = DependencyGraph::new(passes.len());

        let mut last_writer: SecondaryMap<RgResourceHandle, usize> = SecondaryMap::new();
        let mut readers_since_write: SecondaryMap<RgResourceHandle, Vec<usize>> = SecondaryMap::new();

        for (pass_idx, pass) in passes.iter().enumerate() {
            // 先处理读，同一 Pass 的读写按 read-modify-write 处理
            for access in pass.accesses.iter().filter(|a| !a.is_write) {
                if let Some(&writer) = last_writer.get(access.resource) {
                    graph.add_edge(writer, pass_idx, access.resource, RgDependencyKind::ReadAfterWrite);
                }
                if let Some(readers) = readers_since_write.entry(access.resource).map(|e| e.or_default()) {
                    if !readers.contains(&pass_idx) {
                        readers.push(pass_idx);
                    }
                }
            }

            for access in pass.accesses.iter().filter(|a| a.is_write) {
                if let Some(&prev_writer) = last_writer.get(access.resource) {
                    graph.add_edge(prev_writer, pass_idx, access.resource, RgDependencyKind::WriteAfterWrite);
                }
                if let Some(readers) = readers_since_write.remove(access.resource) {
                    for reader in readers {
                        graph.add_edge(reader, pass_idx, access.resource, RgDependencyKind::WriteAfterRead);
                    }
                }
                last_writer.insert(access.resource, pass_idx);
            }
        }

        graph
    }

    /// 终结 Pass 的索引
    pub fn find_terminals(passes: &[RgPassNode<'_>], resources: &RgResourceRegistry) -> Vec<usize> {
        passes
            .iter()
            .enumerate()
            .filter(|(_, pass)| pass.is_terminal(resources))
            .map(|(i, _)| i)
            .collect()
    }

    /// 根据执行顺序计算资源生命周期
    ///
    /// `order` 中只包含可达 Pass，生命周期用其在 `order` 中的位置表示。
    pub fn compute_lifetimes(order: &[usize], passes: &[RgPassNode<'_>], resources: &mut RgResourceRegistry) {
        resources.reset_lifetimes();

        for (position, &pass_idx) in order.iter().enumerate() {
            for access in &passes[pass_idx].accesses {
                let Some(resource) = resources.get_mut(access.resource) else {
                    continue;
                };
                resource.first_use.get_or_insert(position);
                resource.last_use = Some(position);
            }
        }
    }
}
