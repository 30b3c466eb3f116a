//! 节点集合 - 场景层次结构的管理器
//!
//! 设计原则：
//! - 节点以 arena 方式存储，句柄为槽位索引，槽位在销毁后可复用
//! - 全局变换惰性重算：set 时只标脏整棵子树，读取时按父链重算一次
//! - set 系列方法把受影响的节点收集给调用方，由上层完成观察者分发

use glam::{Mat4, Quat, Vec3};
use log::trace;

use super::{NodeFlags, NodeId, Transform};

/// 场景节点
#[derive(Clone, Debug)]
pub struct Node {
    /// 节点名称
    pub name: String,
    /// 父节点
    pub(crate) parent: Option<NodeId>,
    /// 子节点列表
    pub(crate) children: Vec<NodeId>,
    /// 局部变换
    local: Transform,
    /// 全局变换缓存
    global: Mat4,
    /// 全局变换逆矩阵缓存
    global_inverse: Mat4,
    /// 状态标志
    flags: NodeFlags,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            local: Transform::default(),
            global: Mat4::IDENTITY,
            global_inverse: Mat4::IDENTITY,
            flags: NodeFlags::GLOBAL_DIRTY | NodeFlags::GLOBAL_INVERSE_DIRTY,
        }
    }

    /// 父节点
    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// 局部变换
    #[inline]
    pub fn local_transform(&self) -> Transform {
        self.local
    }

    /// 是否为软体根节点
    #[inline]
    pub fn is_soft_body_root(&self) -> bool {
        self.flags.contains(NodeFlags::SOFT_BODY_ROOT)
    }
}

/// 节点集合
#[derive(Clone, Debug, Default)]
pub struct NodeSet {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建节点并挂到指定父节点下
    pub fn add_node(&mut self, name: &str, parent: Option<NodeId>) -> NodeId {
        if let Some(p) = parent {
            // 提前校验父句柄，避免挂出悬空边
            let _ = self.node(p);
        }
        let node = Node::new(name.to_string(), parent);
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        };
        if let Some(p) = parent {
            self.node_mut(p).children.push(id);
        }
        id
    }

    /// 句柄是否仍然存活
    #[inline]
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.0 as usize)
            .map_or(false, |slot| slot.is_some())
    }

    /// 取节点引用，句柄失效时 panic
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("node handle {:?} refers to a destroyed node", id))
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("node handle {:?} refers to a destroyed node", id))
    }

    // ========================================
    // 局部变换写入（标脏 + 收集受影响节点）
    // ========================================

    /// 设置局部变换，把本节点及所有后代追加到 `affected`
    pub fn set_local_transform(
        &mut self,
        id: NodeId,
        transform: Transform,
        affected: &mut Vec<NodeId>,
    ) {
        self.node_mut(id).local = transform;
        self.mark_subtree_dirty(id, affected);
    }

    /// 设置局部平移
    pub fn set_local_translation(&mut self, id: NodeId, t: Vec3, affected: &mut Vec<NodeId>) {
        self.node_mut(id).local.translation = t;
        self.mark_subtree_dirty(id, affected);
    }

    /// 设置局部旋转
    pub fn set_local_rotation(&mut self, id: NodeId, r: Quat, affected: &mut Vec<NodeId>) {
        self.node_mut(id).local.rotation = r;
        self.mark_subtree_dirty(id, affected);
    }

    /// 设置局部缩放
    pub fn set_local_scale(&mut self, id: NodeId, s: Vec3, affected: &mut Vec<NodeId>) {
        self.node_mut(id).local.scale = s;
        self.mark_subtree_dirty(id, affected);
    }

    /// 标脏整棵子树并收集节点
    ///
    /// 已经是脏的节点也会被收集：同一帧内的第二次移动仍然要通知观察者。
    fn mark_subtree_dirty(&mut self, id: NodeId, affected: &mut Vec<NodeId>) {
        let node = self.node_mut(id);
        node.flags
            .insert(NodeFlags::GLOBAL_DIRTY | NodeFlags::GLOBAL_INVERSE_DIRTY);
        affected.push(id);
        let children = node.children.clone();
        for child in children {
            self.mark_subtree_dirty(child, affected);
        }
    }

    // ========================================
    // 全局变换读取（惰性重算）
    // ========================================

    /// 全局变换，脏时沿父链重算一次
    pub fn global_transform(&mut self, id: NodeId) -> Mat4 {
        if self.node(id).flags.contains(NodeFlags::GLOBAL_DIRTY) {
            let parent_global = match self.node(id).parent {
                Some(p) => self.global_transform(p),
                None => Mat4::IDENTITY,
            };
            let node = self.node_mut(id);
            node.global = parent_global * node.local.to_matrix();
            node.flags.remove(NodeFlags::GLOBAL_DIRTY);
        }
        self.node(id).global
    }

    /// 全局变换逆矩阵
    pub fn global_transform_inverse(&mut self, id: NodeId) -> Mat4 {
        if self
            .node(id)
            .flags
            .contains(NodeFlags::GLOBAL_INVERSE_DIRTY)
        {
            let global = self.global_transform(id);
            let node = self.node_mut(id);
            node.global_inverse = global.inverse();
            node.flags.remove(NodeFlags::GLOBAL_INVERSE_DIRTY);
        }
        self.node(id).global_inverse
    }

    // ========================================
    // 软体根节点
    // ========================================

    /// 把节点标记为软体根节点（骨骼空间锚点）
    pub fn mark_soft_body_root(&mut self, id: NodeId) {
        self.node_mut(id).flags.insert(NodeFlags::SOFT_BODY_ROOT);
    }

    /// 沿祖先链（含自身）解析软体根节点
    pub fn soft_body_root_of(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let node = self.node(cur);
            if node.flags.contains(NodeFlags::SOFT_BODY_ROOT) {
                return Some(cur);
            }
            cursor = node.parent;
        }
        None
    }

    // ========================================
    // 销毁
    // ========================================

    /// 销毁节点及其全部后代，把被销毁的句柄追加到 `removed`
    ///
    /// 调用方负责向注册在这些节点上的观察者广播销毁通知。
    pub fn remove_subtree(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        if let Some(p) = self.node(id).parent {
            self.node_mut(p).children.retain(|c| *c != id);
        }
        self.remove_recursive(id, removed);
        trace!("removed subtree of {} nodes", removed.len());
    }

    fn remove_recursive(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        let children = self.node(id).children.clone();
        for child in children {
            self.remove_recursive(child, removed);
        }
        self.nodes[id.0 as usize] = None;
        self.free.push(id.0);
        removed.push(id);
    }
}
