//! 蒙皮分段与骨骼绑定
//!
//! SkinSection 覆盖网格顶点索引的一个半开区间 [start, start+count)，
//! 持有一份有序的骨骼调色板（BoneBinding 列表）。
//! 同一网格的各分段按插入顺序连续、不重叠地划分整个索引空间。
//!
//! BoneBinding 是每 (网格, 骨骼) 一个的复合矩阵缓存：
//! 构造时向骨骼与网格节点双方注册为变换观察者，
//! 任一方被销毁时收到广播并把对应引用置空，绝不延长对方生命周期。

use glam::{Mat4, Vec3};

use crate::mesh::SkinMesh;

use super::BoneId;

// ============================================================================
// 骨骼绑定
// ============================================================================

/// 单条 (网格, 骨骼) 绑定
///
/// 缓存的复合矩阵把网格局部空间的静止姿态顶点映射到当前姿态位置，
/// 网格自身的运动已被两端的骨骼空间矩阵抵消。
#[derive(Clone, Debug)]
pub struct BoneBinding {
    /// 被观察的骨骼；骨骼被销毁后置为 None
    bone: Option<BoneId>,
    /// 所属网格节点是否仍存活
    mesh_alive: bool,
    /// 复合变换缓存
    transform: Mat4,
    /// 缓存失效标志
    dirty: bool,
}

impl BoneBinding {
    pub(crate) fn new(bone: BoneId) -> Self {
        Self {
            bone: Some(bone),
            mesh_alive: true,
            transform: Mat4::IDENTITY,
            dirty: true,
        }
    }

    /// 被绑定的骨骼，骨骼已销毁时为 None
    #[inline]
    pub fn bone(&self) -> Option<BoneId> {
        self.bone
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// 骨骼销毁广播：置空引用，之后的变形查询是编程错误
    #[inline]
    pub(crate) fn on_bone_destroyed(&mut self) {
        self.bone = None;
    }

    /// 网格节点销毁广播
    #[inline]
    pub(crate) fn on_mesh_destroyed(&mut self) {
        self.mesh_alive = false;
    }

    /// 存入重算好的复合矩阵并清除脏标志
    #[inline]
    pub(crate) fn store_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.dirty = false;
    }

    /// 缓存的复合矩阵
    ///
    /// 仅在脏标志清除后有效；骨骼或网格引用已被置空时 panic。
    pub fn transform(&self) -> Mat4 {
        assert!(
            self.bone.is_some(),
            "bone binding queried after its bone was destroyed"
        );
        assert!(
            self.mesh_alive,
            "bone binding queried after its skin mesh node was destroyed"
        );
        debug_assert!(!self.dirty, "bone binding transform read while dirty");
        self.transform
    }
}

// ============================================================================
// 蒙皮分段
// ============================================================================

/// 蒙皮分段：一段连续顶点区间 + 骨骼调色板
///
/// 既是变形算法的批次单位，也是绘制批次的边界。
/// 对所属网格节点只持弱关系（由 SoftBody 经句柄回溯），不拥有。
#[derive(Clone, Debug)]
pub struct SkinSection {
    /// 起始顶点索引
    vertex_start: usize,
    /// 顶点数
    vertex_count: usize,
    /// 骨骼调色板，槽位即网格顶点属性中烘焙的骨骼索引
    bindings: Vec<BoneBinding>,
    /// 调色板矩阵，update_pose 后与 bindings 同步，供绘制层整段上传
    palette: Vec<Mat4>,
}

impl SkinSection {
    pub(crate) fn new(vertex_start: usize, vertex_count: usize) -> Self {
        Self {
            vertex_start,
            vertex_count,
            bindings: Vec::new(),
            palette: Vec::new(),
        }
    }

    #[inline]
    pub fn vertex_start(&self) -> usize {
        self.vertex_start
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// 调色板骨骼数。不解引用任何骨骼句柄，骨骼销毁后调用仍然安全。
    #[inline]
    pub fn bone_count(&self) -> usize {
        self.bindings.len()
    }

    /// 是否有骨架（调色板非空）
    #[inline]
    pub fn has_skeleton(&self) -> bool {
        !self.bindings.is_empty()
    }

    /// 顶点索引是否落在本分段区间内
    #[inline]
    pub fn contains_vertex_index(&self, vertex_index: usize) -> bool {
        vertex_index >= self.vertex_start && vertex_index < self.vertex_start + self.vertex_count
    }

    #[inline]
    pub fn bindings(&self) -> &[BoneBinding] {
        &self.bindings
    }

    pub(crate) fn push_binding(&mut self, binding: BoneBinding) -> usize {
        self.bindings.push(binding);
        self.bindings.len() - 1
    }

    #[inline]
    pub(crate) fn binding_mut(&mut self, slot: usize) -> &mut BoneBinding {
        &mut self.bindings[slot]
    }

    pub(crate) fn mark_bindings_dirty(&mut self) {
        for b in &mut self.bindings {
            b.mark_dirty();
        }
    }

    /// 用当前绑定矩阵刷新调色板
    pub(crate) fn refresh_palette(&mut self) {
        self.palette.clear();
        self.palette.extend(self.bindings.iter().map(|b| b.transform()));
    }

    /// 调色板矩阵切片，update_pose 之后有效
    #[inline]
    pub(crate) fn palette(&self) -> &[Mat4] {
        &self.palette
    }

    /// 顶点的变形后位置：对每条非零权重影响做加权求和
    ///
    /// 权重不做再归一化；没有任何影响的顶点返回零向量（退化输入）。
    /// 非零权重的槽位超出调色板范围是烘焙数据错误，直接 panic。
    /// 前置条件：本分段所有绑定矩阵已被 SoftBody 刷新干净。
    pub(crate) fn deformed_vertex_location(&self, mesh: &SkinMesh, vertex_index: usize) -> Vec3 {
        let rest_location = mesh.vertex_location(vertex_index);
        let mut deformed = Vec3::ZERO;

        for influence in 0..mesh.influence_count() {
            let weight = mesh.bone_weight(influence, vertex_index);
            if weight == 0.0 {
                continue;
            }
            let slot = mesh.bone_index(influence, vertex_index);
            assert!(
                slot < self.bindings.len(),
                "vertex {} references bone slot {} outside palette of {} bones",
                vertex_index,
                slot,
                self.bindings.len()
            );
            deformed += self.bindings[slot].transform().transform_point3(rest_location) * weight;
        }
        deformed
    }
}
