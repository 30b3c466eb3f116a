//! 蒙皮核心
//!
//! 组件依赖自底向上：
//! - Bone: 关节节点，缓存骨骼空间变换与静止姿态逆矩阵
//! - BoneBinding: 每 (网格, 骨骼) 一个的复合矩阵缓存
//! - SkinSection: 连续顶点区间 + 骨骼调色板，变形算法与绘制批次的单位
//! - SkinMeshNode: 蒙皮网格节点，按序持有各分段
//! - DeformedFaceArray: 整网格变形顶点位置的惰性缓存
//! - SoftBody: 软体门面，持有节点集合与骨骼/网格 arena，负责观察者分发
//!
//! 失效边是显式接线的协作式缓存一致性协议：
//! 骨骼动 → 绑定矩阵脏 → 所属网格的面缓存清空，全部在调用线程上同步完成。

mod bone;
mod deformed_faces;
mod skin_mesh_node;
mod skin_section;
mod soft_body;

pub use bone::Bone;
pub use deformed_faces::DeformedFaceArray;
pub use skin_mesh_node::{SkinBatch, SkinMeshNode};
pub use skin_section::{BoneBinding, SkinSection};
pub use soft_body::SoftBody;

use glam::Mat4;
use thiserror::Error;

use crate::mesh::MeshDataError;

// ============================================================================
// 句柄
// ============================================================================

/// 骨骼句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoneId(pub(crate) usize);

/// 蒙皮网格节点句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(pub(crate) usize);

/// 订阅键：标识某个网格中某分段调色板里的一条骨骼绑定
///
/// 骨骼的订阅者列表存的就是这种非拥有句柄；骨骼动或被销毁时按键回溯到绑定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BindingKey {
    pub mesh: MeshId,
    pub section: usize,
    pub slot: usize,
}

// ============================================================================
// 错误类型
// ============================================================================

/// 骨架装配错误
///
/// 只覆盖装配阶段的可恢复错误；查询阶段的不变量违反一律 panic。
#[derive(Debug, Error)]
pub enum SkinError {
    #[error("node handle is no longer alive")]
    DeadNode,
    #[error("bone handle is no longer alive")]
    DeadBone,
    #[error("skin mesh handle is no longer alive")]
    DeadMesh,
    #[error("section index {section} out of range ({count} sections)")]
    NoSuchSection { section: usize, count: usize },
    #[error("section must start at vertex {expected}, got {got}")]
    NonContiguousSection { expected: usize, got: usize },
    #[error("section range [{start}, {end}) exceeds mesh vertex count {vertex_count}")]
    SectionOutOfRange {
        start: usize,
        end: usize,
        vertex_count: usize,
    },
    #[error("sections cover [0, {covered}) of {vertex_count} vertices")]
    IncompleteCoverage { covered: usize, vertex_count: usize },
    #[error(transparent)]
    MeshData(#[from] MeshDataError),
}

// ============================================================================
// 刚性判定
// ============================================================================

/// 变换是否只含旋转 + 平移（基向量正交且单位长度，无缩放/错切）
pub(crate) fn is_rigid(m: &Mat4) -> bool {
    const TOLERANCE: f32 = 1e-4;
    let x = m.x_axis.truncate();
    let y = m.y_axis.truncate();
    let z = m.z_axis.truncate();
    (x.length_squared() - 1.0).abs() < TOLERANCE
        && (y.length_squared() - 1.0).abs() < TOLERANCE
        && (z.length_squared() - 1.0).abs() < TOLERANCE
        && x.dot(y).abs() < TOLERANCE
        && y.dot(z).abs() < TOLERANCE
        && z.dot(x).abs() < TOLERANCE
}
