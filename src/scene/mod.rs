//! 场景节点层 - 通用变换层
//!
//! 蒙皮核心只消费这一层的三个能力：
//! - 全局变换及其逆矩阵（惰性缓存，脏标记保护）
//! - 变换变更通知（set 系列方法返回受影响的节点集合，由上层分发）
//! - 沿祖先链解析软体根节点

mod node_set;

pub use node_set::{Node, NodeSet};

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};

// ============================================================================
// 公共类型定义
// ============================================================================

/// 节点句柄
///
/// 普通索引句柄，槽位可复用。访问已销毁的句柄是编程错误，会直接 panic。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

bitflags! {
    /// 节点状态标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// 全局变换缓存失效
        const GLOBAL_DIRTY = 1 << 0;
        /// 全局变换逆矩阵缓存失效
        const GLOBAL_INVERSE_DIRTY = 1 << 1;
        /// 软体根节点（骨骼空间锚点）
        const SOFT_BODY_ROOT = 1 << 2;
    }
}

/// 节点局部变换数据 (TRS)
#[derive(Clone, Copy, Debug)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// 转换为 4x4 矩阵
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// 从矩阵分解
    #[inline]
    pub fn from_matrix(m: Mat4) -> Self {
        let (scale, rotation, translation) = m.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }
}
