//! 蒙皮网格节点
//!
//! 按序持有蒙皮分段，缓存自身的骨骼空间变换及其逆矩阵
//! （与骨骼同一套缓存契约），并独占持有惰性创建的变形面缓存。

use glam::Mat4;
use log::trace;

use crate::mesh::SkinMesh;
use crate::scene::{NodeId, NodeSet};

use super::deformed_faces::DeformedFaceArray;
use super::skin_section::SkinSection;

/// 绘制批次：分段的顶点区间 + 调色板矩阵
///
/// 交给外部 GPU 绑定层按序上传、按序提交；
/// 分段边界既是数据所有权边界也是绘制调用边界。
#[derive(Clone, Copy, Debug)]
pub struct SkinBatch<'a> {
    pub vertex_start: usize,
    pub vertex_count: usize,
    pub palette: &'a [Mat4],
}

/// 蒙皮网格节点
#[derive(Clone, Debug)]
pub struct SkinMeshNode {
    /// 节点名称
    pub name: String,
    /// 对应的场景节点
    pub(crate) node: NodeId,
    /// 静止姿态网格数据
    mesh: SkinMesh,
    /// 蒙皮分段，插入顺序即顶点索引顺序
    sections: Vec<SkinSection>,
    /// 骨骼空间变换缓存
    skeletal: Mat4,
    skeletal_dirty: bool,
    /// 骨骼空间变换逆矩阵缓存
    skeletal_inverse: Mat4,
    skeletal_inverse_dirty: bool,
    /// 变形面缓存，首次面查询时惰性创建
    deformed_faces: Option<DeformedFaceArray>,
}

impl SkinMeshNode {
    pub(crate) fn new(name: String, node: NodeId, mesh: SkinMesh) -> Self {
        Self {
            name,
            node,
            mesh,
            sections: Vec::new(),
            skeletal: Mat4::IDENTITY,
            skeletal_dirty: true,
            skeletal_inverse: Mat4::IDENTITY,
            skeletal_inverse_dirty: true,
            deformed_faces: None,
        }
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[inline]
    pub fn mesh(&self) -> &SkinMesh {
        &self.mesh
    }

    #[inline]
    pub fn sections(&self) -> &[SkinSection] {
        &self.sections
    }

    #[inline]
    pub(crate) fn sections_mut(&mut self) -> &mut [SkinSection] {
        &mut self.sections
    }

    pub(crate) fn push_section(&mut self, section: SkinSection) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    /// 是否有骨架：任一分段的调色板非空
    pub fn has_skeleton(&self) -> bool {
        self.sections.iter().any(|s| s.has_skeleton())
    }

    // ========================================
    // 分段定位
    // ========================================

    /// 包含指定顶点索引的分段，越界是编程错误
    pub fn section_index_for_vertex(&self, vertex_index: usize) -> usize {
        self.sections
            .iter()
            .position(|s| s.contains_vertex_index(vertex_index))
            .unwrap_or_else(|| {
                panic!(
                    "vertex index {} is not covered by any skin section of '{}'",
                    vertex_index, self.name
                )
            })
    }

    /// 包含指定面的分段（按面的第一个顶点索引定位）
    pub fn section_index_for_face(&self, face_index: usize) -> usize {
        let indices = self.mesh.face_indices(face_index);
        self.section_index_for_vertex(indices[0])
    }

    // ========================================
    // 失效
    // ========================================

    /// 自身变换变化：骨骼空间缓存与全部绑定矩阵失效，面缓存清空
    pub(crate) fn mark_transform_dirty(&mut self) {
        self.skeletal_dirty = true;
        self.skeletal_inverse_dirty = true;
        for section in &mut self.sections {
            section.mark_bindings_dirty();
        }
        self.clear_deformable_caches();
    }

    /// 某根影响本网格的骨骼动了：面缓存失效
    pub(crate) fn bone_was_transformed(&mut self) {
        self.clear_deformable_caches();
    }

    fn clear_deformable_caches(&mut self) {
        if let Some(ref mut faces) = self.deformed_faces {
            faces.mark_dirty();
        }
    }

    // ========================================
    // 骨骼空间变换
    // ========================================

    /// 网格节点自身的骨骼空间变换
    pub(crate) fn skeletal_transform(&mut self, nodes: &mut NodeSet) -> Mat4 {
        if self.skeletal_dirty {
            let root = nodes.soft_body_root_of(self.node).unwrap_or_else(|| {
                panic!("skin mesh node '{}' is not under a soft body root", self.name)
            });
            self.skeletal =
                nodes.global_transform_inverse(root) * nodes.global_transform(self.node);
            self.skeletal_dirty = false;
        }
        self.skeletal
    }

    pub(crate) fn skeletal_transform_inverse(&mut self, nodes: &mut NodeSet) -> Mat4 {
        if self.skeletal_inverse_dirty {
            self.skeletal_inverse = self.skeletal_transform(nodes).inverse();
            self.skeletal_inverse_dirty = false;
        }
        self.skeletal_inverse
    }

    // ========================================
    // 变形面缓存
    // ========================================

    /// 变形面缓存，不存在则创建
    pub(crate) fn deformed_faces_mut(&mut self) -> &mut DeformedFaceArray {
        if self.deformed_faces.is_none() {
            trace!("creating deformed face array for '{}'", self.name);
            self.deformed_faces = Some(DeformedFaceArray::new());
        }
        self.deformed_faces.as_mut().unwrap()
    }

    #[inline]
    pub(crate) fn deformed_faces(&self) -> Option<&DeformedFaceArray> {
        self.deformed_faces.as_ref()
    }

    /// 面缓存是否开启
    pub fn should_cache_faces(&self) -> bool {
        self.deformed_faces
            .as_ref()
            .map_or(false, |f| f.should_cache())
    }

    /// 开关面缓存；关闭时释放自有存储
    pub(crate) fn set_should_cache_faces(&mut self, should_cache: bool) {
        self.deformed_faces_mut().set_should_cache(should_cache);
    }

    /// 面缓存已干净时直接给出填充好的缓存与网格/分段的只读借用
    ///
    /// 借用拆分：mesh/sections 与 deformed_faces 是不相交字段。
    pub(crate) fn split_for_population(
        &mut self,
    ) -> (&SkinMesh, &[SkinSection], &mut DeformedFaceArray) {
        if self.deformed_faces.is_none() {
            self.deformed_faces = Some(DeformedFaceArray::new());
        }
        (
            &self.mesh,
            &self.sections,
            self.deformed_faces.as_mut().unwrap(),
        )
    }

    // ========================================
    // 绘制
    // ========================================

    /// 按分段顺序给出绘制批次，`SoftBody::update_pose` 之后有效
    pub fn batches(&self) -> impl Iterator<Item = SkinBatch<'_>> {
        self.sections.iter().map(|s| SkinBatch {
            vertex_start: s.vertex_start(),
            vertex_count: s.vertex_count(),
            palette: s.palette(),
        })
    }
}
