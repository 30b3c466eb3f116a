//! 骨骼 - 既是场景节点又是骨架关节
//!
//! 骨骼空间变换 = 软体根节点全局逆矩阵 * 自身全局矩阵。
//! 把角色自身在世界中的摆放从每根骨骼的蒙皮计算中抵消掉：
//! 整体拖动角色不会弄脏任何骨骼空间矩阵。

use glam::Mat4;

use crate::scene::{NodeId, NodeSet};

use super::{is_rigid, BindingKey};

/// 骨架关节
///
/// 静止姿态逆矩阵在 `bind_rest_pose` 时捕获一次，此后不变，
/// 直到显式重新绑定把后续变形重新基准化到新的参考姿态。
#[derive(Clone, Debug)]
pub struct Bone {
    /// 骨骼名称
    pub name: String,
    /// 对应的场景节点
    pub(crate) node: NodeId,
    /// 骨骼空间变换缓存
    skeletal: Mat4,
    /// 骨骼空间变换缓存失效标志
    skeletal_dirty: bool,
    /// 静止姿态骨骼空间变换的逆矩阵
    rest_pose_inverse: Mat4,
    /// 订阅者列表：观察此骨骼的全部绑定（非拥有句柄）
    pub(crate) listeners: Vec<BindingKey>,
}

impl Bone {
    pub(crate) fn new(name: String, node: NodeId) -> Self {
        Self {
            name,
            node,
            skeletal: Mat4::IDENTITY,
            skeletal_dirty: true,
            rest_pose_inverse: Mat4::IDENTITY,
            listeners: Vec::new(),
        }
    }

    /// 对应的场景节点
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// 由变换层在姿态变化时调用，只标脏不重算
    #[inline]
    pub(crate) fn mark_transform_dirty(&mut self) {
        self.skeletal_dirty = true;
    }

    /// 骨骼空间变换，脏时重算一次
    ///
    /// 两次姿态变化之间幂等，摊还 O(1)。
    pub(crate) fn skeletal_transform(&mut self, nodes: &mut NodeSet) -> Mat4 {
        if self.skeletal_dirty {
            let root = nodes
                .soft_body_root_of(self.node)
                .unwrap_or_else(|| panic!("bone '{}' is not under a soft body root", self.name));
            self.skeletal =
                nodes.global_transform_inverse(root) * nodes.global_transform(self.node);
            self.skeletal_dirty = false;
        }
        self.skeletal
    }

    /// 捕获静止姿态：取当前骨骼空间变换求逆并缓存
    pub(crate) fn bind_rest_pose(&mut self, nodes: &mut NodeSet) {
        self.rest_pose_inverse = self.skeletal_transform(nodes).inverse();
    }

    /// 静止姿态骨骼空间变换的逆矩阵
    #[inline]
    pub fn rest_pose_inverse(&self) -> Mat4 {
        self.rest_pose_inverse
    }

    /// 当前骨骼空间变换是否为纯旋转 + 平移
    pub(crate) fn has_rigid_skeletal_transform(&mut self, nodes: &mut NodeSet) -> bool {
        let m = self.skeletal_transform(nodes);
        is_rigid(&m)
    }
}
